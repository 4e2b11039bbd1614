//! Test double for the kernel side of a socket.
//!
//! `Socket::simulated` builds a bound socket whose rings live in anonymous
//! memory. The returned `KernelSim` holds the opposite role of each ring and
//! plays the kernel: it takes Fill entries, writes packets into those frames
//! and publishes them on RX, and consumes TX descriptors and reports them on
//! the Completion ring.

use crate::arena::FramePool;
use crate::config::XdpConfig;
use crate::error::Result;
use crate::ring::{Ring, RingCons, RingProd, XdpDesc};
use crate::socket::{Rings, Socket, SocketState};
use std::collections::VecDeque;

/// Bytes the kernel leaves in front of received data.
pub(crate) const XDP_PACKET_HEADROOM: u64 = 256;

pub(crate) struct KernelSim {
    pub fill: Option<RingCons<u64>>,
    pub comp: Option<RingProd<u64>>,
    pub rx: Option<RingProd<XdpDesc>>,
    pub tx: Option<RingCons<XdpDesc>>,
    base: *mut u8,
    frame_size: u64,
    headroom: u64,
    /// Fill frames taken and not yet delivered.
    held: VecDeque<u64>,
}

impl<P: FramePool> Socket<P> {
    pub(crate) fn simulated(config: XdpConfig, pool: P) -> Result<(Self, KernelSim)> {
        let mut socket = Self::detached(config, pool)?;
        let (base, frame_size, headroom) = {
            let arena = socket.pool.arena();
            (arena.base_ptr(), arena.frame_size() as u64, arena.headroom() as u64)
        };
        fn ring<T: Copy>(size: u32) -> Result<Option<Ring<T>>> {
            Ok(if size > 0 { Some(Ring::anonymous(size)?) } else { None })
        }
        let fill: Option<Ring<u64>> = ring(config.fill_size)?;
        let comp: Option<Ring<u64>> = ring(config.comp_size)?;
        let rx: Option<Ring<XdpDesc>> = ring(config.rx_size)?;
        let tx: Option<Ring<XdpDesc>> = ring(config.tx_size)?;

        let sim = KernelSim {
            fill: fill.as_ref().map(|r| RingCons::new(r.mirror())),
            comp: comp.as_ref().map(|r| RingProd::new(r.mirror())),
            rx: rx.as_ref().map(|r| RingProd::new(r.mirror())),
            tx: tx.as_ref().map(|r| RingCons::new(r.mirror())),
            base,
            frame_size,
            headroom,
            held: VecDeque::new(),
        };
        socket.rings = Some(Rings {
            fill: fill.map(RingProd::new),
            comp: comp.map(RingCons::new),
            rx: rx.map(RingCons::new),
            tx: tx.map(RingProd::new),
        });
        socket.state = SocketState::Bound;
        Ok((socket, sim))
    }
}

impl KernelSim {
    /// Takes up to `n` frames from the Fill ring, like a driver posting
    /// receive buffers.
    pub fn take_fill(&mut self, n: u32) -> usize {
        let Some(fill) = self.fill.as_mut() else {
            return 0;
        };
        let mut addrs = Vec::new();
        let got = fill.consume(n as usize, &mut addrs);
        fill.release_consumed(got as u32);
        self.held.extend(addrs);
        got
    }

    /// Receives one packet into a Fill frame and publishes it on RX.
    pub fn deliver(&mut self, packet: &[u8]) -> bool {
        if self.held.is_empty() && self.take_fill(1) == 0 {
            return false;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        if rx.free(1) == 0 {
            return false;
        }
        let Some(chunk) = self.held.pop_front() else {
            return false;
        };
        let chunk = chunk - chunk % self.frame_size;
        let addr = chunk + self.headroom + XDP_PACKET_HEADROOM;
        assert!(addr + packet.len() as u64 <= chunk + self.frame_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                packet.as_ptr(),
                self.base.add(addr as usize),
                packet.len(),
            );
        }
        rx.produce(&[XdpDesc::new(addr, packet.len() as u32, 0)]) == 1
    }

    /// Transmits everything on the TX ring and completes it. Returns the
    /// packets in order.
    pub fn transmit(&mut self) -> Vec<Vec<u8>> {
        let (Some(tx), Some(comp)) = (self.tx.as_mut(), self.comp.as_mut()) else {
            return Vec::new();
        };
        let mut descs = Vec::new();
        let n = tx.consume(comp.free(comp.size()) as usize, &mut descs);
        tx.release_consumed(n as u32);
        let packets = descs
            .iter()
            .map(|d| unsafe {
                std::slice::from_raw_parts(self.base.add(d.addr as usize), d.len as usize).to_vec()
            })
            .collect();
        let addrs: Vec<u64> = descs.iter().map(|d| d.addr).collect();
        assert_eq!(comp.produce(&addrs), n);
        packets
    }

    /// Consumes TX descriptors without completing them, like a stalled NIC.
    pub fn swallow_tx(&mut self) -> usize {
        let Some(tx) = self.tx.as_mut() else {
            return 0;
        };
        let mut descs = Vec::new();
        let n = tx.consume(usize::MAX, &mut descs);
        tx.release_consumed(n as u32);
        n
    }

    pub fn set_fill_need_wakeup(&self, on: bool) {
        if let Some(fill) = self.fill.as_ref() {
            fill.ring().set_need_wakeup(on);
        }
    }
}
