//! # Batch I/O Loop
//!
//! ## Purpose
//!
//! The application-facing packet loop: receive a batch, let a handler look at
//! (and possibly rewrite) each packet, then recycle it or transmit it in place.
//!
//! ## How it works
//!
//! Each `run_once` first pushes frames still waiting for TX room, then takes
//! up to `batch` frames from the socket. The handler's `Verdict` decides the
//! frame's path: `Recycle` returns it to the Fill ring, `Transmit` sends the
//! same frame out without copying. Transmitted frames come back through the
//! Completion ring into the free pool, from where the socket refills.
//!
//! When a batch is empty the `PollStrategy` decides what happens: `Busy`
//! returns immediately so the caller spins, `Wait` parks in `Socket::wait`.

use crate::arena::{Arena, FramePool};
use crate::error::{Result, XskError};
use crate::frame::Frame;
use crate::poll::Interest;
use crate::socket::{Socket, SocketState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// What to do with a packet after the handler saw it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Give the frame back for reception.
    Recycle,
    /// Send the (possibly modified) frame out of the same socket.
    Transmit,
}

/// Behaviour when there is nothing to receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollStrategy {
    /// Return at once; lowest latency, one core at 100%.
    Busy,
    /// Park until the socket is readable or the timeout expires.
    Wait(Option<Duration>),
}

pub struct IoLoop<P: FramePool = Arena> {
    socket: Socket<P>,
    batch: usize,
    strategy: PollStrategy,
    tx_pending: Vec<Frame>,
}

impl<P: FramePool> IoLoop<P> {
    /// Wraps a bound or active socket, activating it if needed.
    pub fn new(mut socket: Socket<P>, batch: usize, strategy: PollStrategy) -> Result<Self> {
        if batch == 0 {
            return Err(XskError::InvalidConfig("batch size must be positive".into()));
        }
        if socket.state() == SocketState::Bound {
            socket.activate()?;
        }
        if socket.state() != SocketState::Active {
            return Err(XskError::InvalidState {
                expected: "active",
                found: socket.state().name(),
            });
        }
        Ok(IoLoop {
            socket,
            batch,
            strategy,
            tx_pending: Vec::new(),
        })
    }

    pub fn socket(&self) -> &Socket<P> {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut Socket<P> {
        &mut self.socket
    }

    /// Frames the handler asked to transmit that did not fit in the TX ring yet.
    pub fn tx_backlog(&self) -> usize {
        self.tx_pending.len()
    }

    /// Processes at most one batch and returns the number of packets handled.
    pub fn run_once(&mut self, mut handler: impl FnMut(&mut [u8]) -> Verdict) -> Result<usize> {
        self.flush()?;
        let frames = self.socket.receive(self.batch)?;
        if frames.is_empty() {
            self.idle()?;
            return Ok(0);
        }
        let n = frames.len();

        let mut recycle = Vec::with_capacity(n);
        {
            let mut arena = self.socket.arena();
            for mut frame in frames {
                let verdict = handler(arena.data_mut(&mut frame)?);
                match verdict {
                    Verdict::Recycle => recycle.push(frame),
                    Verdict::Transmit => self.tx_pending.push(frame),
                }
            }
        }
        self.socket.recycle_all(recycle)?;
        self.flush()?;
        Ok(n)
    }

    /// Runs batches until `stop` is set or the socket is closed through its
    /// `CloseHandle`; returns the number of packets handled.
    pub fn run_until(
        &mut self,
        stop: &AtomicBool,
        mut handler: impl FnMut(&mut [u8]) -> Verdict,
    ) -> Result<u64> {
        let mut total = 0u64;
        while !stop.load(Ordering::Relaxed) {
            match self.run_once(&mut handler) {
                Ok(n) => total += n as u64,
                Err(XskError::Closed) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> Result<()> {
        if self.tx_pending.is_empty() {
            return Ok(());
        }
        self.socket.send(&mut self.tx_pending)?;
        Ok(())
    }

    fn idle(&mut self) -> Result<()> {
        let rx = self.socket.config().rx_size > 0;
        if self.socket.config().tx_size > 0 {
            self.socket.complete()?;
        }
        if let PollStrategy::Wait(timeout) = self.strategy {
            let interest = if rx {
                Interest::Readable
            } else {
                Interest::Writable
            };
            self.socket.wait(interest, timeout)?;
        }
        Ok(())
    }

    /// Returns pending frames to the arena and closes the socket.
    pub fn close(mut self) -> Result<()> {
        self.release_pending();
        self.socket.close()
    }

    fn release_pending(&mut self) {
        if self.tx_pending.is_empty() {
            return;
        }
        let mut arena = self.socket.arena();
        for frame in self.tx_pending.drain(..) {
            if let Err(e) = arena.release(frame) {
                log::error!("failed to release pending frame: {e}");
                break;
            }
        }
    }
}

impl<P: FramePool> Drop for IoLoop<P> {
    fn drop(&mut self) {
        self.release_pending();
    }
}
