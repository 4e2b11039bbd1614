//! # Frame Arena (UMEM)
//!
//! ## Purpose
//!
//! The arena owns the page-aligned memory region that is registered with the
//! kernel as a UMEM and tracks, for every frame, which party holds it.
//!
//! ## How it works
//!
//! The region is mapped once and never moves; frame `i` occupies bytes
//! `[i * frame_size, (i + 1) * frame_size)`. Every slot carries an ownership
//! state and an epoch that is bumped each time the application gains the slot:
//!
//! ```text
//!   Free --allocate--> App --send--> Tx(sock) --completion--> Free
//!    |                  |
//!    +--refill--> Fill(sock) --rx--> App --recycle--> Fill(sock)
//!                       \--close timeout--> Lost (never reused)
//! ```
//!
//! Free slots live on a LIFO stack. Any ownership violation (double release,
//! foreign or stale token) is logged and poisons the arena; after that every
//! allocation and transfer fails with `ArenaPoisoned`, since the kernel-side
//! view of the frames can no longer be trusted.
//!
//! ## Main components
//!
//! - `Arena`: the region plus the ownership table.
//! - `SharedArena`: `Arc<Mutex<Arena>>` for sockets sharing one UMEM.
//! - `FramePool`: what a socket needs from either of them.

use crate::config::XdpConfig;
use crate::error::{Result, XskError};
use crate::frame::Frame;
use crate::mmap::OwnedMmap;
use crate::ring::XdpDesc;
use std::io;
use std::ops::DerefMut;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

/// Bytes of arena memory currently mapped by this process; `RLIMIT_MEMLOCK`
/// is kept at or above this value.
static LOCKED_BYTES: Mutex<u64> = Mutex::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    App,
    /// Posted on the Fill ring of the socket, or sitting in its RX ring.
    Fill(u32),
    /// Posted on the TX ring of the socket, awaiting completion.
    Tx(u32),
    Lost,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::App => "application",
            SlotState::Fill(_) => "fill",
            SlotState::Tx(_) => "tx",
            SlotState::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    epoch: u32,
}

/// A UMEM region sliced into equal frames, with per-frame ownership.
pub struct Arena {
    id: u32,
    mmap: OwnedMmap,
    frame_size: u32,
    frame_count: u32,
    headroom: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    lost: u32,
    poisoned: bool,
    /// Socket that registered this region with the kernel.
    owner_fd: Option<RawFd>,
}

impl Arena {
    /// Maps `frame_size * frame_count` bytes and marks every frame free.
    pub fn new(config: &XdpConfig) -> Result<Self> {
        config.validate()?;
        let len = config.arena_len();
        ensure_memlock(len as u64)?;
        let mmap = match OwnedMmap::mmap(len, config.huge_page) {
            Ok(mmap) => mmap,
            Err(e) => {
                unlock(len as u64);
                return Err(e.into());
            }
        };
        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "arena {id}: {} frames of {} bytes ({} bytes headroom)",
            config.frame_count,
            config.frame_size,
            config.frame_headroom
        );
        Ok(Arena {
            id,
            mmap,
            frame_size: config.frame_size,
            frame_count: config.frame_count,
            headroom: config.frame_headroom,
            slots: vec![
                Slot {
                    state: SlotState::Free,
                    epoch: 0,
                };
                config.frame_count as usize
            ],
            // lowest index on top of the stack
            free: (0..config.frame_count).rev().collect(),
            lost: 0,
            poisoned: false,
            owner_fd: None,
        })
    }

    /// Takes one free frame.
    pub fn allocate(&mut self) -> Result<Frame> {
        self.check_poisoned()?;
        let index = self
            .free
            .pop()
            .ok_or(XskError::OutOfFrames(self.frame_count))?;
        Ok(self.grant(index, self.headroom, 0))
    }

    /// Takes `n` free frames, or none at all.
    pub fn allocate_n(&mut self, n: usize) -> Result<Vec<Frame>> {
        self.check_poisoned()?;
        if self.free.len() < n {
            return Err(XskError::OutOfFrames(self.frame_count));
        }
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(index) = self.free.pop() {
                frames.push(self.grant(index, self.headroom, 0));
            }
        }
        Ok(frames)
    }

    /// Returns an application-held frame to the free pool.
    pub fn release(&mut self, frame: Frame) -> Result<()> {
        self.check_poisoned()?;
        self.check_owned(&frame)?;
        self.slots[frame.index as usize].state = SlotState::Free;
        self.free.push(frame.index);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Frames permanently withdrawn after a socket closed while the kernel
    /// still held them.
    pub fn lost_count(&self) -> u32 {
        self.lost
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The valid data bytes of an owned frame.
    pub fn data(&mut self, frame: &Frame) -> Result<&[u8]> {
        self.check_owned(frame)?;
        let start = frame.addr() as usize;
        Ok(&self.region()[start..start + frame.len as usize])
    }

    /// The valid data bytes of an owned frame, writable.
    pub fn data_mut(&mut self, frame: &mut Frame) -> Result<&mut [u8]> {
        self.check_owned(frame)?;
        let start = frame.addr() as usize;
        Ok(&mut self.region_mut()[start..start + frame.len as usize])
    }

    /// The whole writable area of an owned frame from its data offset, for
    /// building a packet before `Frame::set_len`.
    pub fn buffer_mut(&mut self, frame: &Frame) -> Result<&mut [u8]> {
        self.check_owned(frame)?;
        let start = frame.addr() as usize;
        Ok(&mut self.region_mut()[start..start + frame.capacity as usize])
    }

    /// Copies `bytes` into an owned frame and sets its length.
    pub fn write(&mut self, frame: &mut Frame, bytes: &[u8]) -> Result<()> {
        let buf = self.buffer_mut(frame)?;
        if bytes.len() > buf.len() {
            return Err(XskError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes do not fit in a {}-byte frame", bytes.len(), buf.len()),
            )));
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        frame.set_len(bytes.len() as u32)
    }

    fn region(&self) -> &[u8] {
        // SAFETY: the mapping is live for the arena's lifetime; callers only
        // hand out ranges of slots the application owns.
        unsafe { std::slice::from_raw_parts(self.mmap.as_u8_ptr(), self.mmap.len()) }
    }

    fn region_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_u8_ptr(), self.mmap.len()) }
    }

    fn grant(&mut self, index: u32, offset: u32, len: u32) -> Frame {
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::App;
        slot.epoch = slot.epoch.wrapping_add(1);
        Frame {
            arena: self.id,
            index,
            epoch: slot.epoch,
            chunk: index as u64 * self.frame_size as u64,
            offset,
            len,
            capacity: self.frame_size - offset,
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(XskError::ArenaPoisoned);
        }
        Ok(())
    }

    fn check_owned(&mut self, frame: &Frame) -> Result<()> {
        let err = if frame.arena != self.id || frame.index >= self.frame_count {
            XskError::NotOwned {
                index: frame.index,
                state: "foreign",
            }
        } else {
            let slot = self.slots[frame.index as usize];
            match slot.state {
                SlotState::App if slot.epoch == frame.epoch => return Ok(()),
                SlotState::Free => XskError::DoubleRelease(frame.index),
                state => XskError::NotOwned {
                    index: frame.index,
                    state: if state == SlotState::App {
                        "stale"
                    } else {
                        state.name()
                    },
                },
            }
        };
        self.poison(&err);
        Err(err)
    }

    fn poison(&mut self, err: &XskError) {
        log::error!("arena {}: {err}; arena is now poisoned", self.id);
        self.poisoned = true;
    }

    fn slot_index(&self, addr: u64) -> Option<u32> {
        let index = addr / self.frame_size as u64;
        (index < self.frame_count as u64).then_some(index as u32)
    }

    /// Moves up to `n` free frames to `socket`'s Fill side and returns their
    /// chunk addresses.
    pub(crate) fn take_for_fill(&mut self, n: u32, socket: u32) -> Result<Vec<u64>> {
        self.check_poisoned()?;
        let n = (n as usize).min(self.free.len());
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(index) = self.free.pop() {
                self.slots[index as usize].state = SlotState::Fill(socket);
                addrs.push(index as u64 * self.frame_size as u64);
            }
        }
        Ok(addrs)
    }

    /// Hands an owned frame back to `socket`'s Fill side.
    pub(crate) fn post_fill(&mut self, frame: Frame, socket: u32) -> Result<u64> {
        self.check_poisoned()?;
        self.check_owned(&frame)?;
        self.slots[frame.index as usize].state = SlotState::Fill(socket);
        Ok(frame.chunk)
    }

    /// Transfers an owned frame to `socket`'s TX side.
    pub(crate) fn post_tx(&mut self, frame: Frame, socket: u32) -> Result<XdpDesc> {
        self.check_poisoned()?;
        self.check_owned(&frame)?;
        self.slots[frame.index as usize].state = SlotState::Tx(socket);
        Ok(frame.desc())
    }

    /// Turns an RX descriptor into an application frame.
    pub(crate) fn receive(&mut self, desc: XdpDesc, socket: u32) -> Result<Frame> {
        self.check_poisoned()?;
        let Some(index) = self.slot_index(desc.addr) else {
            let err = XskError::NotOwned {
                index: u32::MAX,
                state: "out of range",
            };
            self.poison(&err);
            return Err(err);
        };
        let state = self.slots[index as usize].state;
        if state != SlotState::Fill(socket) {
            let err = XskError::NotOwned {
                index,
                state: state.name(),
            };
            self.poison(&err);
            return Err(err);
        }
        let offset = (desc.addr % self.frame_size as u64) as u32;
        let mut frame = self.grant(index, offset, 0);
        frame.len = desc.len.min(frame.capacity);
        Ok(frame)
    }

    /// Frees a frame reported on `socket`'s Completion ring.
    pub(crate) fn complete(&mut self, addr: u64, socket: u32) -> Result<()> {
        self.check_poisoned()?;
        let index = self.slot_index(addr);
        match index.map(|i| (i, self.slots[i as usize].state)) {
            Some((index, SlotState::Tx(owner))) if owner == socket => {
                self.slots[index as usize].state = SlotState::Free;
                self.free.push(index);
                Ok(())
            }
            other => {
                let err = XskError::NotOwned {
                    index: other.map_or(u32::MAX, |(i, _)| i),
                    state: other.map_or("out of range", |(_, s)| s.name()),
                };
                self.poison(&err);
                Err(err)
            }
        }
    }

    /// Returns a Fill entry the kernel never consumed to the free pool. Only
    /// valid once the socket is unbound.
    pub(crate) fn reclaim_fill(&mut self, addr: u64, socket: u32) -> bool {
        match self.slot_index(addr) {
            Some(index) if self.slots[index as usize].state == SlotState::Fill(socket) => {
                self.slots[index as usize].state = SlotState::Free;
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    /// Frames `socket` has handed to the kernel: `(fill + rx, tx)`.
    pub(crate) fn kernel_held(&self, socket: u32) -> (u32, u32) {
        self.slots
            .iter()
            .fold((0, 0), |(fill, tx), slot| match slot.state {
                SlotState::Fill(s) if s == socket => (fill + 1, tx),
                SlotState::Tx(s) if s == socket => (fill, tx + 1),
                _ => (fill, tx),
            })
    }

    /// Withdraws every frame still held by the kernel for `socket`.
    pub(crate) fn mark_lost(&mut self, socket: u32) -> u32 {
        let mut n = 0;
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Fill(s) | SlotState::Tx(s) if s == socket) {
                slot.state = SlotState::Lost;
                n += 1;
            }
        }
        self.lost += n;
        n
    }

    pub(crate) fn owner_fd(&self) -> Option<RawFd> {
        self.owner_fd
    }

    pub(crate) fn set_owner_fd(&mut self, fd: Option<RawFd>) {
        self.owner_fd = fd;
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_u8_ptr()
    }

    /// Registration parameters for `XDP_UMEM_REG`.
    pub(crate) fn umem_reg(&self) -> libc::xdp_umem_reg {
        // zeroed flags select aligned chunk mode
        unsafe {
            libc::xdp_umem_reg {
                addr: self.mmap.as_void_ptr() as u64,
                len: self.frame_size as u64 * self.frame_count as u64,
                chunk_size: self.frame_size,
                headroom: self.headroom,
                ..std::mem::zeroed()
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unlock(self.frame_size as u64 * self.frame_count as u64);
    }
}

/// Raises `RLIMIT_MEMLOCK` to cover `len` more bytes of registered memory.
///
/// Kernels with memcg accounting ignore the limit, so failing to raise it is
/// only worth a warning; registration will report the real error if any.
fn ensure_memlock(len: u64) -> Result<()> {
    let mut locked = LOCKED_BYTES.lock().unwrap_or_else(|e| e.into_inner());
    let wanted = locked.saturating_add(len);
    *locked = wanted;

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if rlim.rlim_cur == libc::RLIM_INFINITY || rlim.rlim_cur >= wanted {
        return Ok(());
    }
    let raised = libc::rlimit {
        rlim_cur: wanted,
        rlim_max: rlim.rlim_max.max(wanted),
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &raised) } < 0 {
        log::warn!(
            "cannot raise RLIMIT_MEMLOCK to {wanted} bytes: {}",
            io::Error::last_os_error()
        );
    }
    Ok(())
}

fn unlock(len: u64) {
    let mut locked = LOCKED_BYTES.lock().unwrap_or_else(|e| e.into_inner());
    *locked = locked.saturating_sub(len);
}

/// Access to the arena behind a socket.
///
/// A socket either owns its arena outright (`Arena`) or shares it with other
/// sockets through `SharedArena`.
pub trait FramePool {
    type Guard<'a>: DerefMut<Target = Arena>
    where
        Self: 'a;

    fn arena(&mut self) -> Self::Guard<'_>;
}

impl FramePool for Arena {
    type Guard<'a> = &'a mut Arena;

    fn arena(&mut self) -> &mut Arena {
        self
    }
}

/// An arena shared by several sockets on the same interface (`XDP_SHARED_UMEM`).
#[derive(Clone)]
pub struct SharedArena(Arc<Mutex<Arena>>);

impl SharedArena {
    pub fn new(arena: Arena) -> Self {
        SharedArena(Arc::new(Mutex::new(arena)))
    }

    /// Locks the arena for direct use.
    pub fn lock(&self) -> MutexGuard<'_, Arena> {
        // every transition is a single assignment, so a panic while the lock
        // was held leaves the table consistent
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FramePool for SharedArena {
    type Guard<'a> = MutexGuard<'a, Arena>;

    fn arena(&mut self) -> MutexGuard<'_, Arena> {
        self.lock()
    }
}
