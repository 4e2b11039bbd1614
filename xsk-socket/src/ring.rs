//! # Descriptor Rings
//!
//! ## Purpose
//!
//! The four AF_XDP rings are single-producer/single-consumer circular queues
//! living in memory shared with the kernel. This module is the only place that
//! touches that memory: everything else goes through `RingProd` and `RingCons`.
//!
//! ## How it works
//!
//! A ring is a power-of-two array of slots plus a producer index, a consumer
//! index and a flags word. Indices are free-running `u32` counters; the slot
//! of index `i` is `i & mask`.
//!
//! The producer writes slots first and only then publishes the advanced
//! producer index with `Release`. The consumer loads the producer index with
//! `Acquire` before reading slots and publishes its own index with `Release`
//! after it is done with them. Both sides keep cached copies of the peer
//! index and only reload it when the cache runs out.
//!
//! `RingCons` separates the local "seen" cursor from the published consumer
//! index: `consume` peeks at a batch, `release_consumed` hands the slots back.
//!
//! ```text
//!  producer side                       consumer side
//!  | released ... cached_cons) ...     | released .. seen ) .. cached_prod |
//!  published -> visible to consumer    released  -> visible to producer
//! ```
//!
//! ## Main components
//!
//! - `XdpDesc`: the RX/TX descriptor.
//! - `Ring<T>`: the mapped region with raw index access.
//! - `RingProd<T>`, `RingCons<T>`: the two roles.
//! - `RingType`: per-ring socket option and mmap offset.

use crate::mmap::OwnedMmap;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr};

/// RX and TX ring descriptor; layout of `struct xdp_desc`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

static_assertions::assert_eq_size!(XdpDesc, libc::xdp_desc);

impl XdpDesc {
    pub fn new(addr: u64, len: u32, options: u32) -> Self {
        XdpDesc { addr, len, options }
    }
}

/// Pointers into a mapped ring region.
pub struct RingMmap<T> {
    pub mmap: Arc<OwnedMmap>,
    pub producer: *mut AtomicU32,
    pub consumer: *mut AtomicU32,
    pub desc: *mut T,
    pub flags: *mut AtomicU32,
}

unsafe impl<T: Send> Send for RingMmap<T> {}

impl<T> Clone for RingMmap<T> {
    fn clone(&self) -> Self {
        RingMmap {
            mmap: self.mmap.clone(),
            producer: self.producer,
            consumer: self.consumer,
            desc: self.desc,
            flags: self.flags,
        }
    }
}

/// A mapped ring of `size` slots of `T`.
pub struct Ring<T> {
    mmap: RingMmap<T>,
    size: u32,
    mask: u32,
}

impl<T: Copy> Ring<T> {
    /// Maps the ring of type `ring_type` from the socket `fd`.
    pub fn mmap(
        fd: i32,
        size: u32,
        ring_type: RingType,
        offsets: &libc::xdp_mmap_offsets,
    ) -> Result<Self, io::Error> {
        debug_assert!(size.is_power_of_two());
        let offs = ring_type.offsets(offsets);
        let map_size = (offs.desc as usize).saturating_add(size as usize * size_of::<T>());
        let mmap = OwnedMmap::mmap_shared(fd, map_size, ring_type.as_pgoff())?;
        Ok(Self::from_region(Arc::new(mmap), offs, size))
    }

    /// Creates a ring in private anonymous memory, laid out like a kernel
    /// ring. Both roles can then be attached to it in one process.
    pub fn anonymous(size: u32) -> Result<Self, io::Error> {
        if !size.is_power_of_two() {
            return Err(io::Error::other(format!(
                "ring size {size} is not a power of two"
            )));
        }
        // indices on separate cache lines, like the kernel layout
        let offs = libc::xdp_ring_offset {
            producer: 0,
            consumer: 64,
            flags: 128,
            desc: 192,
        };
        let map_size = offs.desc as usize + size as usize * size_of::<T>();
        let mmap = OwnedMmap::mmap(map_size, Some(false))?;
        Ok(Self::from_region(Arc::new(mmap), &offs, size))
    }

    fn from_region(mmap: Arc<OwnedMmap>, offs: &libc::xdp_ring_offset, size: u32) -> Self {
        let base = mmap.as_u8_ptr();
        let (producer, consumer, desc, flags) = unsafe {
            (
                base.add(offs.producer as usize) as *mut AtomicU32,
                base.add(offs.consumer as usize) as *mut AtomicU32,
                base.add(offs.desc as usize) as *mut T,
                base.add(offs.flags as usize) as *mut AtomicU32,
            )
        };
        Ring {
            mmap: RingMmap {
                mmap,
                producer,
                consumer,
                desc,
                flags,
            },
            size,
            mask: size - 1,
        }
    }

    /// Another handle on the same shared region, used to drive the opposite
    /// role of the ring.
    pub fn mirror(&self) -> Self {
        Ring {
            mmap: self.mmap.clone(),
            size: self.size,
            mask: self.mask,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn producer(&self) -> u32 {
        unsafe { (*self.mmap.producer).load(Ordering::Acquire) }
    }

    pub fn consumer(&self) -> u32 {
        unsafe { (*self.mmap.consumer).load(Ordering::Acquire) }
    }

    fn update_producer(&self, value: u32) {
        unsafe { (*self.mmap.producer).store(value, Ordering::Release) }
    }

    fn update_consumer(&self, value: u32) {
        unsafe { (*self.mmap.consumer).store(value, Ordering::Release) }
    }

    pub fn flags(&self) -> u32 {
        unsafe { (*self.mmap.flags).load(Ordering::Acquire) }
    }

    /// Sets or clears `XDP_RING_NEED_WAKEUP`; the kernel owns this word on
    /// real rings.
    pub fn set_need_wakeup(&self, on: bool) {
        let flags = unsafe { &*self.mmap.flags };
        if on {
            flags.fetch_or(libc::XDP_RING_NEED_WAKEUP, Ordering::Release);
        } else {
            flags.fetch_and(!libc::XDP_RING_NEED_WAKEUP, Ordering::Release);
        }
    }

    fn read(&self, index: u32) -> T {
        unsafe { ptr::read(self.mmap.desc.add((index & self.mask) as usize)) }
    }

    fn write(&self, index: u32, value: T) {
        unsafe { ptr::write(self.mmap.desc.add((index & self.mask) as usize), value) }
    }
}

/// The producing role of a ring.
pub struct RingProd<T> {
    ring: Ring<T>,
    cached_prod: u32,
    cached_cons: u32,
    published: u32,
}

impl<T: Copy> RingProd<T> {
    pub fn new(ring: Ring<T>) -> Self {
        let published = ring.producer();
        let cached_cons = ring.consumer().wrapping_add(ring.size);
        RingProd {
            ring,
            cached_prod: published,
            cached_cons,
            published,
        }
    }

    pub fn ring(&self) -> &Ring<T> {
        &self.ring
    }

    pub fn size(&self) -> u32 {
        self.ring.size
    }

    /// Number of slots that can be reserved right now, up to `wanted`.
    pub fn free(&mut self, wanted: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= wanted {
            return wanted;
        }
        self.cached_cons = self.ring.consumer().wrapping_add(self.ring.size);
        self.cached_cons.wrapping_sub(self.cached_prod).min(wanted)
    }

    /// Reserves up to `n` slots, returning the first index and the count.
    pub fn reserve(&mut self, n: u32) -> (u32, u32) {
        let count = self.free(n);
        let start = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(count);
        (start, count)
    }

    /// Writes a reserved slot. `index` must come from `reserve`.
    pub fn write(&mut self, index: u32, value: T) {
        debug_assert!(index.wrapping_sub(self.published) < self.cached_prod.wrapping_sub(self.published));
        self.ring.write(index, value);
    }

    /// Publishes `count` written slots to the consumer.
    pub fn submit(&mut self, count: u32) {
        debug_assert!(count <= self.cached_prod.wrapping_sub(self.published));
        self.published = self.published.wrapping_add(count);
        self.ring.update_producer(self.published);
    }

    /// Gives back reserved slots that were not written.
    pub fn cancel(&mut self, count: u32) {
        debug_assert!(count <= self.cached_prod.wrapping_sub(self.published));
        self.cached_prod = self.cached_prod.wrapping_sub(count);
    }

    /// Publishes as many of `items` as fit and returns how many did.
    /// Never blocks; a full ring yields a short count.
    pub fn produce(&mut self, items: &[T]) -> usize {
        let (start, count) = self.reserve(items.len().min(u32::MAX as usize) as u32);
        for (i, item) in items[..count as usize].iter().enumerate() {
            self.write(start.wrapping_add(i as u32), *item);
        }
        self.submit(count);
        count as usize
    }

    /// Entries published but not yet released by the consumer.
    pub fn pending(&self) -> u32 {
        self.published.wrapping_sub(self.ring.consumer())
    }

    /// Reads back the published entries the consumer has not taken yet.
    /// Only meaningful once the consumer is known to be stopped.
    pub fn unconsumed(&self) -> Vec<T> {
        let consumer = self.ring.consumer();
        let n = self.published.wrapping_sub(consumer);
        (0..n)
            .map(|i| self.ring.read(consumer.wrapping_add(i)))
            .collect()
    }

    pub fn needs_wakeup(&self) -> bool {
        self.ring.flags() & libc::XDP_RING_NEED_WAKEUP != 0
    }
}

/// The consuming role of a ring.
pub struct RingCons<T> {
    ring: Ring<T>,
    cached_prod: u32,
    seen: u32,
    released: u32,
}

impl<T: Copy> RingCons<T> {
    pub fn new(ring: Ring<T>) -> Self {
        let released = ring.consumer();
        RingCons {
            cached_prod: ring.producer(),
            ring,
            seen: released,
            released,
        }
    }

    pub fn ring(&self) -> &Ring<T> {
        &self.ring
    }

    pub fn size(&self) -> u32 {
        self.ring.size
    }

    /// Number of published entries not yet seen, up to `max`.
    pub fn available(&mut self, max: u32) -> u32 {
        let entries = self.cached_prod.wrapping_sub(self.seen);
        if entries >= max {
            return max;
        }
        self.cached_prod = self.ring.producer();
        self.cached_prod.wrapping_sub(self.seen).min(max)
    }

    /// Advances the seen cursor over up to `max` entries, returning the first
    /// index and the count. The slots stay owned by this side until
    /// `release_consumed`.
    pub fn peek(&mut self, max: u32) -> (u32, u32) {
        let count = self.available(max);
        let start = self.seen;
        self.seen = self.seen.wrapping_add(count);
        (start, count)
    }

    /// Reads a peeked slot.
    pub fn get(&self, index: u32) -> T {
        debug_assert!(index.wrapping_sub(self.released) < self.seen.wrapping_sub(self.released));
        self.ring.read(index)
    }

    /// Appends up to `max` entries to `out` and returns how many were added.
    /// An empty ring returns zero.
    pub fn consume(&mut self, max: usize, out: &mut Vec<T>) -> usize {
        let (start, count) = self.peek(max.min(u32::MAX as usize) as u32);
        out.extend((0..count).map(|i| self.ring.read(start.wrapping_add(i))));
        count as usize
    }

    /// Returns `count` consumed slots to the producer.
    pub fn release_consumed(&mut self, count: u32) {
        debug_assert!(count <= self.seen.wrapping_sub(self.released));
        self.released = self.released.wrapping_add(count);
        self.ring.update_consumer(self.released);
    }

    /// Entries seen but not released.
    pub fn outstanding(&self) -> u32 {
        self.seen.wrapping_sub(self.released)
    }

    pub fn needs_wakeup(&self) -> bool {
        self.ring.flags() & libc::XDP_RING_NEED_WAKEUP != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RingType {
    Tx,
    Rx,
    Fill,
    Completion,
}

impl RingType {
    fn as_sockopt(&self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn as_pgoff(&self) -> u64 {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
        }
    }

    fn offsets<'a>(&self, offsets: &'a libc::xdp_mmap_offsets) -> &'a libc::xdp_ring_offset {
        match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        }
    }

    /// Sets the ring size on the socket before it is mapped.
    pub fn set_size(self, raw_fd: libc::c_int, ring_size: u32) -> io::Result<()> {
        unsafe {
            if libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.as_sockopt(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
