//! # AF_XDP Socket
//!
//! ## Purpose
//!
//! A `Socket` binds one arena and its four rings to one `(interface, queue)`
//! pair and moves frames between the application and the kernel in batches.
//!
//! ## How it works
//!
//! The socket walks a fixed lifecycle:
//!
//! ```text
//! Created --bind--> Bound --activate--> Active --close--> Draining --> Closed
//! ```
//!
//! - `create` opens the `AF_XDP` file descriptor; nothing is mapped yet.
//! - `bind` registers the arena as a UMEM (or joins an already registered one
//!   with `XDP_SHARED_UMEM`), sizes and maps the rings and binds the queue.
//! - `activate` primes the Fill ring so the kernel can start receiving.
//! - `close` waits up to `drain_timeout` for the kernel to hand back frames it
//!   took from the Fill and TX rings. Fill entries the kernel never consumed
//!   are reclaimed once the socket is released; frames still in flight at the
//!   deadline are withdrawn from the arena as lost.
//!
//! Receive: `receive` turns RX descriptors into `Frame`s and tops the Fill
//! ring back up from the free pool; `recycle` hands a processed frame straight
//! back to the Fill ring. Transmit: `send` posts owned frames on the TX ring,
//! `complete` returns transmitted frames to the free pool.
//!
//! ## Main components
//!
//! - `Socket<P>`: the socket over a `FramePool` (`Arena` or `SharedArena`).
//! - `SocketBuilder`: configuration front end.
//! - `SocketState`: lifecycle states.

use crate::arena::{Arena, FramePool, SharedArena};
use crate::config::XdpConfig;
use crate::error::{Result, XskError, errno_error, last_errno_error, permission_denied};
use crate::frame::Frame;
use crate::netdev;
use crate::poll::CloseHandle;
use crate::ring::{Ring, RingCons, RingProd, RingType, XdpDesc};
use crate::stats::{KernelStats, SocketStats};
use caps::Capability;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const XDP_OPTIONS: libc::c_int = 8;
const XDP_OPTIONS_ZEROCOPY: u32 = 1 << 0;

const SO_BUSY_POLL: libc::c_int = 46;
const SO_PREFER_BUSY_POLL: libc::c_int = 69;
const SO_BUSY_POLL_BUDGET: libc::c_int = 70;

static NEXT_SOCKET_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle state of a `Socket`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Active,
    Draining,
    Closed,
}

impl SocketState {
    pub fn name(&self) -> &'static str {
        match self {
            SocketState::Created => "created",
            SocketState::Bound => "bound",
            SocketState::Active => "active",
            SocketState::Draining => "draining",
            SocketState::Closed => "closed",
        }
    }
}

/// The mapped rings of a bound socket. Fill/Completion exist when RX/TX do.
pub(crate) struct Rings {
    pub fill: Option<RingProd<u64>>,
    pub comp: Option<RingCons<u64>>,
    pub rx: Option<RingCons<XdpDesc>>,
    pub tx: Option<RingProd<XdpDesc>>,
}

/// An AF_XDP socket over a frame pool.
pub struct Socket<P: FramePool = Arena> {
    pub(crate) id: u32,
    pub(crate) fd: Option<OwnedFd>,
    pub(crate) state: SocketState,
    pub(crate) config: XdpConfig,
    pub(crate) if_index: u32,
    pub(crate) queue_id: u32,
    pub(crate) pool: P,
    pub(crate) rings: Option<Rings>,
    pub(crate) zero_copy: bool,
    pub(crate) closer: CloseHandle,
    pub(crate) stats: SocketStats,
}

/// Builds sockets from an `XdpConfig`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketBuilder {
    config: XdpConfig,
}

impl SocketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: XdpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn frame_size(mut self, frame_size: u32) -> Self {
        self.config.frame_size = frame_size;
        self
    }

    pub fn frame_count(mut self, frame_count: u32) -> Self {
        self.config.frame_count = frame_count;
        self
    }

    pub fn frame_headroom(mut self, headroom: u32) -> Self {
        self.config.frame_headroom = headroom;
        self
    }

    /// Sets the four ring sizes at once.
    pub fn ring_size(mut self, size: u32) -> Self {
        self.config.fill_size = size;
        self.config.comp_size = size;
        self.config.rx_size = size;
        self.config.tx_size = size;
        self
    }

    /// `0` disables the RX and Fill rings.
    pub fn rx_size(mut self, size: u32) -> Self {
        self.config.rx_size = size;
        if size == 0 {
            self.config.fill_size = 0;
        }
        self
    }

    /// `0` disables the TX and Completion rings.
    pub fn tx_size(mut self, size: u32) -> Self {
        self.config.tx_size = size;
        if size == 0 {
            self.config.comp_size = 0;
        }
        self
    }

    pub fn zero_copy(mut self, zero_copy: Option<bool>) -> Self {
        self.config.zero_copy = zero_copy;
        self
    }

    pub fn copy_fallback(mut self, allow: bool) -> Self {
        self.config.copy_fallback = allow;
        self
    }

    pub fn huge_page(mut self, huge_page: Option<bool>) -> Self {
        self.config.huge_page = huge_page;
        self
    }

    pub fn need_wakeup(mut self, need_wakeup: bool) -> Self {
        self.config.need_wakeup = Some(need_wakeup);
        self
    }

    pub fn busy_poll(mut self, busy_poll: crate::config::BusyPoll) -> Self {
        self.config.busy_poll = Some(busy_poll);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Creates a socket with a dedicated arena.
    pub fn create(self) -> Result<Socket<Arena>> {
        let arena = Arena::new(&self.config)?;
        Socket::create(self.config, arena)
    }

    /// Creates a socket on an arena shared with other sockets.
    pub fn create_shared(self, arena: &SharedArena) -> Result<Socket<SharedArena>> {
        Socket::create(self.config, arena.clone())
    }
}

impl<P: FramePool> Socket<P> {
    /// Opens an `AF_XDP` socket over `pool`. The socket is `Created`.
    pub fn create(config: XdpConfig, pool: P) -> Result<Self> {
        let mut socket = Self::detached(config, pool)?;
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM | libc::EACCES) => {
                    permission_denied("AF_XDP socket", &[Capability::CAP_NET_RAW])
                }
                _ => err.into(),
            });
        }
        socket.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        log::debug!("socket {}: created fd {fd}", socket.id);
        Ok(socket)
    }

    /// A socket object without a kernel descriptor.
    pub(crate) fn detached(config: XdpConfig, mut pool: P) -> Result<Self> {
        config.validate()?;
        {
            let arena = pool.arena();
            let ring = config.rx_size.max(config.tx_size);
            if arena
                .frame_count()
                .checked_next_power_of_two()
                .is_some_and(|limit| ring > limit)
            {
                return Err(XskError::InvalidConfig(format!(
                    "rings larger than the {} frames of the arena",
                    arena.frame_count()
                )));
            }
        }
        Ok(Socket {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            fd: None,
            state: SocketState::Created,
            config,
            if_index: 0,
            queue_id: 0,
            pool,
            rings: None,
            zero_copy: false,
            closer: CloseHandle::new()?,
            stats: SocketStats::default(),
        })
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn config(&self) -> &XdpConfig {
        &self.config
    }

    /// Whether the kernel bound the socket in zero-copy mode.
    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// The socket descriptor, until the socket is closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    /// Reads the kernel's `XDP_STATISTICS` for this socket.
    pub fn kernel_stats(&self) -> Result<KernelStats> {
        let fd = self.raw_fd().ok_or(XskError::Closed)?;
        Ok(KernelStats::read(fd)?)
    }

    /// A handle that makes blocked and future `wait` calls return `Closed`.
    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }

    /// Access to the arena, e.g. to read or build frame contents.
    pub fn arena(&mut self) -> P::Guard<'_> {
        self.pool.arena()
    }

    fn expect_state(&self, expected: SocketState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(match self.state {
            SocketState::Draining | SocketState::Closed => XskError::Closed,
            found => XskError::InvalidState {
                expected: expected.name(),
                found: found.name(),
            },
        })
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        self.expect_state(SocketState::Active)?;
        if self.closer.is_closed() {
            return Err(XskError::Closed);
        }
        Ok(())
    }

    /// Binds the socket to queue `queue_id` of interface `if_index`.
    ///
    /// A failed bind releases the descriptor and leaves the socket `Closed`;
    /// create a new one to retry.
    pub fn bind(&mut self, if_index: u32, queue_id: u32) -> Result<()> {
        self.expect_state(SocketState::Created)?;
        let fd = self.raw_fd().ok_or(XskError::Closed)?;
        self.if_index = if_index;
        self.queue_id = queue_id;
        match self.setup(fd) {
            Ok(()) => {
                self.state = SocketState::Bound;
                log::info!(
                    "socket {}: bound to interface {if_index} queue {queue_id} ({} mode)",
                    self.id,
                    if self.zero_copy { "zero-copy" } else { "copy" }
                );
                Ok(())
            }
            Err(e) => {
                log::debug!("socket {}: bind failed: {e}", self.id);
                self.rings = None;
                self.release_fd();
                self.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    fn setup(&mut self, fd: RawFd) -> Result<()> {
        let cfg = self.config;
        check_zero_copy(self.if_index, &cfg)?;
        let shared_fd = {
            let mut arena = self.pool.arena();
            match arena.owner_fd() {
                Some(owner) => Some(owner),
                None => {
                    register_umem(fd, &arena.umem_reg())?;
                    arena.set_owner_fd(Some(fd));
                    None
                }
            }
        };

        if cfg.fill_size > 0 {
            RingType::Fill.set_size(fd, cfg.fill_size)?;
        }
        if cfg.comp_size > 0 {
            RingType::Completion.set_size(fd, cfg.comp_size)?;
        }
        if cfg.rx_size > 0 {
            RingType::Rx.set_size(fd, cfg.rx_size)?;
        }
        if cfg.tx_size > 0 {
            RingType::Tx.set_size(fd, cfg.tx_size)?;
        }

        let offsets = ring_offsets(fd)?;
        self.rings = Some(Rings {
            fill: (cfg.fill_size > 0)
                .then(|| Ring::mmap(fd, cfg.fill_size, RingType::Fill, &offsets).map(RingProd::new))
                .transpose()?,
            comp: (cfg.comp_size > 0)
                .then(|| {
                    Ring::mmap(fd, cfg.comp_size, RingType::Completion, &offsets).map(RingCons::new)
                })
                .transpose()?,
            rx: (cfg.rx_size > 0)
                .then(|| Ring::mmap(fd, cfg.rx_size, RingType::Rx, &offsets).map(RingCons::new))
                .transpose()?,
            tx: (cfg.tx_size > 0)
                .then(|| Ring::mmap(fd, cfg.tx_size, RingType::Tx, &offsets).map(RingProd::new))
                .transpose()?,
        });

        match shared_fd {
            Some(owner) => self.bind_queue(fd, libc::XDP_SHARED_UMEM, owner)?,
            None => self.bind_exclusive(fd)?,
        }

        self.zero_copy = query_zero_copy(fd)?;
        if let Some(busy) = cfg.busy_poll {
            set_int_sockopt(fd, SO_PREFER_BUSY_POLL, 1)?;
            set_int_sockopt(fd, SO_BUSY_POLL, busy.timeout_us)?;
            set_int_sockopt(fd, SO_BUSY_POLL_BUDGET, busy.budget)?;
        }
        Ok(())
    }

    /// Binds with the UMEM registered on this socket, choosing the copy mode.
    fn bind_exclusive(&mut self, fd: RawFd) -> Result<()> {
        let cfg = self.config;
        let wakeup = if cfg.need_wakeup() {
            libc::XDP_USE_NEED_WAKEUP
        } else {
            0
        };
        let mode = match (cfg.zero_copy, cfg.copy_fallback) {
            (Some(true), _) | (None, false) => libc::XDP_ZEROCOPY,
            (Some(false), _) => libc::XDP_COPY,
            // let the kernel pick zero-copy when it can
            (None, true) => 0,
        };

        match self.bind_queue(fd, wakeup | mode, 0) {
            Err(XskError::Io(e))
                if mode == libc::XDP_ZEROCOPY
                    && e.raw_os_error() == Some(libc::EOPNOTSUPP) =>
            {
                if !cfg.copy_fallback {
                    return Err(XskError::UnsupportedDriver(self.if_index));
                }
                log::warn!(
                    "interface {} rejected zero-copy ({e}), falling back to copy mode",
                    self.if_index
                );
                self.bind_queue(fd, wakeup | libc::XDP_COPY, 0)
            }
            other => other,
        }
    }

    fn bind_queue(&self, fd: RawFd, flags: u16, shared_umem_fd: RawFd) -> Result<()> {
        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: flags,
            sxdp_ifindex: self.if_index,
            sxdp_queue_id: self.queue_id,
            sxdp_shared_umem_fd: shared_umem_fd as u32,
        };
        if unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            )
        } == 0
        {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        Err(match err.raw_os_error() {
            Some(libc::EBUSY) => XskError::BindConflict {
                if_index: self.if_index,
                queue_id: self.queue_id,
            },
            Some(libc::ENODEV) => XskError::InterfaceNotFound(format!("index {}", self.if_index)),
            Some(libc::EPERM | libc::EACCES) => {
                permission_denied("AF_XDP bind", &[Capability::CAP_NET_RAW])
            }
            _ => XskError::Io(err),
        })
    }

    /// Primes the Fill ring and allows receive and transmit.
    ///
    /// With both directions enabled at most half of the free frames go to the
    /// Fill ring so that transmit has frames to allocate.
    pub fn activate(&mut self) -> Result<()> {
        self.expect_state(SocketState::Bound)?;
        let id = self.id;
        let tx_enabled = self.config.tx_size > 0;
        let rings = self.rings.as_mut().ok_or(XskError::Closed)?;
        if let Some(fill) = rings.fill.as_mut() {
            let mut arena = self.pool.arena();
            let free = arena.free_count() as u32;
            let budget = if tx_enabled { free / 2 } else { free };
            let wanted = fill.free(fill.size()).min(budget);
            let addrs = arena.take_for_fill(wanted, id)?;
            let posted = fill.produce(&addrs);
            debug_assert_eq!(posted, addrs.len());
            log::debug!("socket {id}: primed fill ring with {posted} frames");
        }
        self.state = SocketState::Active;
        Ok(())
    }

    /// Takes up to `max` received frames. An empty RX ring yields an empty
    /// batch; the caller owns every returned frame until it recycles it.
    pub fn receive(&mut self, max: usize) -> Result<Vec<Frame>> {
        self.ensure_active()?;
        let mut frames = Vec::new();
        let n = self.take_rx(max, &mut frames)?;
        if n == 0 {
            self.wake_rx_if_needed()?;
            return Ok(frames);
        }
        self.stats.rx_batch += 1;
        self.stats.rx_packets += n as u64;
        self.stats.rx_bytes += frames.iter().map(|f| f.len() as u64).sum::<u64>();
        self.refill()?;
        Ok(frames)
    }

    fn take_rx(&mut self, max: usize, frames: &mut Vec<Frame>) -> Result<usize> {
        let id = self.id;
        let Some(rx) = self.rings.as_mut().and_then(|r| r.rx.as_mut()) else {
            return Ok(0);
        };
        let mut descs = Vec::with_capacity(max.min(rx.size() as usize));
        let n = rx.consume(max, &mut descs);
        if n == 0 {
            return Ok(0);
        }
        let mut arena = self.pool.arena();
        frames.reserve(n);
        let taken: Result<Vec<Frame>> = descs
            .into_iter()
            .map(|desc| arena.receive(desc, id))
            .collect();
        rx.release_consumed(n as u32);
        frames.extend(taken?);
        Ok(n)
    }

    fn wake_rx_if_needed(&mut self) -> Result<()> {
        let needs = self
            .rings
            .as_ref()
            .and_then(|r| r.fill.as_ref())
            .is_some_and(|fill| fill.needs_wakeup());
        if needs || self.config.busy_poll.is_some() {
            self.stats.rx_wakeup += 1;
            self.kick_rx()?;
        }
        Ok(())
    }

    /// Tops the Fill ring up from the free pool.
    fn refill(&mut self) -> Result<()> {
        let id = self.id;
        let Some(fill) = self.rings.as_mut().and_then(|r| r.fill.as_mut()) else {
            return Ok(());
        };
        let wanted = fill.free(fill.size());
        if wanted == 0 {
            return Ok(());
        }
        let addrs = self.pool.arena().take_for_fill(wanted, id)?;
        fill.produce(&addrs);
        if (addrs.len() as u32) < wanted && fill.pending() == 0 {
            log::warn!(
                "socket {id}: fill ring is empty and the arena has no free frames; \
                 recycle received frames"
            );
        }
        Ok(())
    }

    /// Returns a processed frame to the Fill ring, or to the free pool when
    /// the ring is full or the socket does not receive.
    pub fn recycle(&mut self, frame: Frame) -> Result<()> {
        self.expect_state(SocketState::Active)?;
        let id = self.id;
        let fill = self.rings.as_mut().and_then(|r| r.fill.as_mut());
        let mut arena = self.pool.arena();
        match fill {
            Some(fill) => {
                let (index, count) = fill.reserve(1);
                if count == 0 {
                    return arena.release(frame);
                }
                match arena.post_fill(frame, id) {
                    Ok(addr) => {
                        fill.write(index, addr);
                        fill.submit(1);
                        Ok(())
                    }
                    Err(e) => {
                        fill.cancel(1);
                        Err(e)
                    }
                }
            }
            None => arena.release(frame),
        }
    }

    /// Recycles every frame of a batch.
    pub fn recycle_all(&mut self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        frames.into_iter().try_for_each(|frame| self.recycle(frame))
    }

    /// Allocates a frame to build an outgoing packet in, reclaiming
    /// completed transmissions first when the pool is empty.
    pub fn allocate_tx(&mut self) -> Result<Frame> {
        self.ensure_active()?;
        match self.pool.arena().allocate() {
            Err(XskError::OutOfFrames(_)) => {}
            other => return other,
        }
        self.reap_completions()?;
        self.pool.arena().allocate()
    }

    /// Posts frames from the front of `frames` on the TX ring and returns how
    /// many were taken.
    ///
    /// Each frame is transmitted with its current `len()`. Frames that did not
    /// fit stay in `frames`. On error nothing is consumed except a frame the
    /// arena rejected as not owned, so the caller keeps what the kernel did
    /// not get. Posted
    /// frames belong to the kernel until they appear on the Completion ring.
    pub fn send(&mut self, frames: &mut Vec<Frame>) -> Result<usize> {
        self.ensure_active()?;
        if frames.is_empty() {
            return Ok(0);
        }
        if self.rings.as_ref().is_none_or(|r| r.tx.is_none()) {
            return Err(XskError::InvalidState {
                expected: "tx ring",
                found: "receive-only socket",
            });
        }
        self.reap_completions()?;
        let id = self.id;
        let need_wakeup = self.config.need_wakeup();
        let Some(tx) = self.rings.as_mut().and_then(|r| r.tx.as_mut()) else {
            return Ok(0);
        };

        let (start, count) = tx.reserve(frames.len() as u32);
        let mut bytes = 0u64;
        {
            let mut arena = self.pool.arena();
            let posting: Vec<Frame> = frames.drain(..count as usize).collect();
            let mut posting = posting.into_iter();
            let mut i = 0u32;
            while let Some(frame) = posting.next() {
                match arena.post_tx(frame, id) {
                    Ok(desc) => {
                        bytes += desc.len as u64;
                        tx.write(start.wrapping_add(i), desc);
                        i += 1;
                    }
                    Err(e) => {
                        tx.submit(i);
                        tx.cancel(count - i);
                        let mut unposted: Vec<Frame> = posting.collect();
                        unposted.append(frames);
                        *frames = unposted;
                        return Err(e);
                    }
                }
            }
        }
        if count > 0 {
            tx.submit(count);
            self.stats.tx_batch += 1;
            self.stats.tx_packets += count as u64;
            self.stats.tx_bytes += bytes;
        }
        if count > 0 && (!need_wakeup || tx.needs_wakeup()) {
            self.stats.tx_wakeup += 1;
            self.kick_tx()?;
        }
        Ok(count as usize)
    }

    /// Reclaims transmitted frames into the free pool; returns how many.
    pub fn complete(&mut self) -> Result<usize> {
        self.expect_state(SocketState::Active)?;
        self.reap_completions()
    }

    fn reap_completions(&mut self) -> Result<usize> {
        let id = self.id;
        let Some(comp) = self.rings.as_mut().and_then(|r| r.comp.as_mut()) else {
            return Ok(0);
        };
        let (start, n) = comp.peek(comp.size());
        if n == 0 {
            return Ok(0);
        }
        let mut arena = self.pool.arena();
        let mut result = Ok(n as usize);
        for i in 0..n {
            if let Err(e) = arena.complete(comp.get(start.wrapping_add(i)), id) {
                result = Err(e);
                break;
            }
        }
        comp.release_consumed(n);
        result
    }

    /// Frames the kernel took from the Fill ring (in its hands or in RX) and
    /// frames posted on TX but not completed.
    fn in_flight(&mut self) -> (u32, u32) {
        let id = self.id;
        let fill_pending = self
            .rings
            .as_ref()
            .and_then(|r| r.fill.as_ref())
            .map_or(0, |fill| fill.pending());
        let (fill_held, tx_held) = self.pool.arena().kernel_held(id);
        (fill_held.saturating_sub(fill_pending), tx_held)
    }

    /// Returns RX frames the application will never see to the free pool.
    fn drain_rx(&mut self) -> Result<()> {
        let mut frames = Vec::new();
        while self.take_rx(usize::MAX, &mut frames)? > 0 {}
        let mut arena = self.pool.arena();
        frames.into_iter().try_for_each(|frame| arena.release(frame))
    }

    /// Drains and closes the socket. Calling it again is a no-op.
    ///
    /// Frames the kernel still holds after `drain_timeout` are marked lost
    /// and never handed out again.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SocketState::Closed => return Ok(()),
            SocketState::Created => {
                self.release_fd();
                self.state = SocketState::Closed;
                return Ok(());
            }
            _ => {}
        }
        self.state = SocketState::Draining;
        self.closer.close();
        log::info!("socket {}: closing", self.id);

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut result = Ok(());
        loop {
            if let Err(e) = self.reap_completions().and_then(|_| self.drain_rx()) {
                result = Err(e);
                break;
            }
            let (rx_held, tx_held) = self.in_flight();
            if rx_held == 0 && tx_held == 0 {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            if tx_held > 0 {
                if let Err(e) = self.kick_tx() {
                    log::debug!("socket {}: wakeup while draining failed: {e}", self.id);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // fill entries the kernel never took become free once the socket is
        // released
        let unconsumed = self
            .rings
            .as_ref()
            .and_then(|r| r.fill.as_ref())
            .map(|fill| fill.unconsumed())
            .unwrap_or_default();
        self.rings = None;
        self.release_fd();

        let id = self.id;
        let mut arena = self.pool.arena();
        let reclaimed = unconsumed
            .into_iter()
            .filter(|addr| arena.reclaim_fill(*addr, id))
            .count();
        let lost = arena.mark_lost(id);
        drop(arena);
        if lost > 0 {
            log::warn!(
                "socket {id}: {lost} frames still held by the kernel after {:?}, marked lost",
                self.config.drain_timeout
            );
        }
        log::debug!("socket {id}: reclaimed {reclaimed} unused fill frames");
        self.state = SocketState::Closed;
        result
    }

    fn release_fd(&mut self) {
        if let Some(fd) = self.fd.take() {
            let mut arena = self.pool.arena();
            if arena.owner_fd() == Some(fd.as_raw_fd()) {
                arena.set_owner_fd(None);
            }
        }
    }
}

impl<P: FramePool> Drop for Socket<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("socket {}: close failed: {e}", self.id);
        }
    }
}

/// Retrieves the memory map offsets of the four rings.
pub fn ring_offsets(raw_fd: RawFd) -> io::Result<libc::xdp_mmap_offsets> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    unsafe {
        if libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(offsets)
}

fn register_umem(raw_fd: RawFd, reg: &libc::xdp_umem_reg) -> Result<()> {
    if unsafe {
        libc::setsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_UMEM_REG,
            reg as *const _ as *const libc::c_void,
            size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(last_errno_error("failed to register UMEM"));
    }
    Ok(())
}

fn query_zero_copy(raw_fd: RawFd) -> Result<bool> {
    let mut flags: u32 = 0;
    let mut optlen = size_of::<u32>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            XDP_OPTIONS,
            &mut flags as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    } < 0
    {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        // XDP_OPTIONS is 5.3+; older kernels only bind in copy mode here
        if errno == libc::ENOPROTOOPT {
            return Ok(false);
        }
        return Err(errno_error(errno, "failed to query XDP options"));
    }
    Ok(flags & XDP_OPTIONS_ZEROCOPY != 0)
}

fn set_int_sockopt(raw_fd: RawFd, opt: libc::c_int, value: u32) -> Result<()> {
    let value = value as libc::c_int;
    if unsafe {
        libc::setsockopt(
            raw_fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(last_errno_error("failed to set busy-poll option"));
    }
    Ok(())
}

/// Rejects a zero-copy-only bind on a driver that reports no zero-copy
/// support, before the UMEM is registered. Unknown support is left to bind.
fn check_zero_copy(if_index: u32, config: &XdpConfig) -> Result<()> {
    let required = config.zero_copy != Some(false) && !config.copy_fallback;
    if required && matches!(netdev::supports_zero_copy(if_index), Ok(Some(false))) {
        return Err(XskError::UnsupportedDriver(if_index));
    }
    Ok(())
}
