//! # Socket and Arena Configuration
//!
//! `XdpConfig` carries everything needed to size the arena, the four rings and
//! the bind flags. `Option` fields mean "let the kernel or the implementation
//! decide"; `validate()` is run by every constructor before any syscall.

use crate::error::{Result, XskError};
use std::time::Duration;

/// Smallest chunk size the kernel accepts for an aligned UMEM.
pub const MIN_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_FRAME_COUNT: u32 = 4096;
pub const DEFAULT_RING_SIZE: u32 = 2048;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Busy-polling parameters applied with `SO_PREFER_BUSY_POLL`, `SO_BUSY_POLL`
/// and `SO_BUSY_POLL_BUDGET` after bind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusyPoll {
    /// Busy-poll timeout in microseconds.
    pub timeout_us: u32,
    /// Maximum number of packets processed per busy-poll call.
    pub budget: u32,
}

impl Default for BusyPoll {
    fn default() -> Self {
        BusyPoll {
            timeout_us: 20,
            budget: 64,
        }
    }
}

/// Configuration options for an arena and the sockets bound to it.
#[derive(Debug, Copy, Clone)]
pub struct XdpConfig {
    /// Size of one frame in bytes. Power of two, at least `MIN_FRAME_SIZE`
    /// and at most the system page size.
    pub frame_size: u32,
    /// Number of frames in the arena.
    pub frame_count: u32,
    /// Bytes reserved at the start of each frame before packet data.
    pub frame_headroom: u32,
    pub fill_size: u32,
    pub comp_size: u32,
    /// RX ring size; `0` makes the socket transmit-only.
    pub rx_size: u32,
    /// TX ring size; `0` makes the socket receive-only.
    pub tx_size: u32,
    /// Enables or disables zero-copy mode.
    ///
    /// - `Some(true)`: binds with `XDP_ZEROCOPY`.
    /// - `Some(false)`: binds with `XDP_COPY`.
    /// - `None`: the kernel picks zero-copy when the driver supports it.
    pub zero_copy: Option<bool>,
    /// When `false`, an interface without zero-copy support fails the bind
    /// with `UnsupportedDriver` instead of silently falling back to copy mode.
    pub copy_fallback: bool,
    /// Enables or disables huge pages for the arena.
    ///
    /// - `None`: huge pages are used if `/proc/meminfo` reports free 2MB pages.
    pub huge_page: Option<bool>,
    /// Sets the `XDP_USE_NEED_WAKEUP` flag. `None` defaults to `true`.
    pub need_wakeup: Option<bool>,
    pub busy_poll: Option<BusyPoll>,
    /// How long `close()` waits for kernel-held frames before marking them lost.
    pub drain_timeout: Duration,
}

impl Default for XdpConfig {
    fn default() -> Self {
        XdpConfig {
            frame_size: DEFAULT_FRAME_SIZE,
            frame_count: DEFAULT_FRAME_COUNT,
            frame_headroom: 0,
            fill_size: DEFAULT_RING_SIZE,
            comp_size: DEFAULT_RING_SIZE,
            rx_size: DEFAULT_RING_SIZE,
            tx_size: DEFAULT_RING_SIZE,
            zero_copy: None,
            copy_fallback: true,
            huge_page: None,
            need_wakeup: None,
            busy_poll: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl XdpConfig {
    /// Checks sizes and combinations the kernel would reject, before any
    /// memory is mapped.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(XskError::InvalidConfig(msg));

        if !self.frame_size.is_power_of_two() || self.frame_size < MIN_FRAME_SIZE {
            return invalid(format!(
                "frame size {} must be a power of two >= {MIN_FRAME_SIZE}",
                self.frame_size
            ));
        }
        let page_size = page_size();
        if self.frame_size as usize > page_size {
            return invalid(format!(
                "frame size {} exceeds the page size {page_size}",
                self.frame_size
            ));
        }
        if self.frame_count == 0 {
            return invalid("frame count must be positive".into());
        }
        let Some(ring_limit) = self.frame_count.checked_next_power_of_two() else {
            return invalid(format!("frame count {} is too large", self.frame_count));
        };
        if self.frame_headroom >= self.frame_size {
            return invalid(format!(
                "headroom {} leaves no room in a {}-byte frame",
                self.frame_headroom, self.frame_size
            ));
        }
        if self.rx_size == 0 && self.tx_size == 0 {
            return invalid("at least one of the RX and TX rings must be enabled".into());
        }
        for (name, size) in [
            ("fill", self.fill_size),
            ("completion", self.comp_size),
            ("rx", self.rx_size),
            ("tx", self.tx_size),
        ] {
            if size != 0 && !size.is_power_of_two() {
                return invalid(format!("{name} ring size {size} is not a power of two"));
            }
            if size > ring_limit {
                return invalid(format!(
                    "{name} ring size {size} exceeds the {} frames of the arena",
                    self.frame_count
                ));
            }
        }
        if self.rx_size > 0 && self.fill_size == 0 {
            return invalid("an RX ring requires a fill ring".into());
        }
        if self.tx_size > 0 && self.comp_size == 0 {
            return invalid("a TX ring requires a completion ring".into());
        }
        if self.zero_copy == Some(false) && !self.copy_fallback {
            return invalid("copy mode was requested but copy fallback is disabled".into());
        }
        Ok(())
    }

    /// Total arena size in bytes.
    pub fn arena_len(&self) -> usize {
        self.frame_size as usize * self.frame_count as usize
    }

    pub(crate) fn need_wakeup(&self) -> bool {
        self.need_wakeup.unwrap_or(true)
    }
}

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}
