//! # Socket Statistics
//!
//! `SocketStats` is maintained by the socket itself on every batch;
//! `KernelStats` is read from the kernel with `XDP_STATISTICS`.

use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;

/// `XDP_STATISTICS` socket option.
const XDP_STATISTICS: libc::c_int = 7;

/// Counters updated by `receive`, `send` and the wakeup paths.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketStats {
    /// Non-empty receive batches.
    pub rx_batch: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Wakeups issued because the Fill ring asked for one.
    pub rx_wakeup: u64,
    pub tx_batch: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_wakeup: u64,
}

impl SocketStats {
    /// Counter-wise difference, for per-interval reporting.
    pub fn delta(&self, earlier: &SocketStats) -> SocketStats {
        SocketStats {
            rx_batch: self.rx_batch.wrapping_sub(earlier.rx_batch),
            rx_packets: self.rx_packets.wrapping_sub(earlier.rx_packets),
            rx_bytes: self.rx_bytes.wrapping_sub(earlier.rx_bytes),
            rx_wakeup: self.rx_wakeup.wrapping_sub(earlier.rx_wakeup),
            tx_batch: self.tx_batch.wrapping_sub(earlier.tx_batch),
            tx_packets: self.tx_packets.wrapping_sub(earlier.tx_packets),
            tx_bytes: self.tx_bytes.wrapping_sub(earlier.tx_bytes),
            tx_wakeup: self.tx_wakeup.wrapping_sub(earlier.tx_wakeup),
        }
    }
}

impl fmt::Display for SocketStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {} pkts / {} bytes in {} batches ({} wakeups), \
             tx {} pkts / {} bytes in {} batches ({} wakeups)",
            self.rx_packets,
            self.rx_bytes,
            self.rx_batch,
            self.rx_wakeup,
            self.tx_packets,
            self.tx_bytes,
            self.tx_batch,
            self.tx_wakeup
        )
    }
}

/// Layout of `struct xdp_statistics`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// Dropped for other reasons than invalid descriptors.
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    /// Dropped because the RX ring was full.
    pub rx_ring_full: u64,
    /// Times the Fill ring was found empty.
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}

impl KernelStats {
    /// Reads the counters of a bound socket. Older kernels return the first
    /// three fields only; the rest stay zero.
    pub fn read(fd: RawFd) -> io::Result<KernelStats> {
        let mut stats = KernelStats::default();
        let mut optlen = size_of::<KernelStats>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_XDP,
                XDP_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(stats)
    }
}
