//! # Frame Ownership Token
//!
//! A `Frame` is the application's proof of ownership of one arena slot. It is
//! deliberately neither `Clone` nor `Copy`: handing it to `release`, `recycle`
//! or `send` moves it out of the caller's hands, so safe code cannot keep a
//! reference to a slot that went back to the kernel.
//!
//! The arena still checks every token it receives against its ownership table
//! (arena id, slot state and epoch), which catches tokens that outlived their
//! slot through other means.

use crate::error::{Result, XskError};
use crate::ring::XdpDesc;
use std::io;

/// An application-owned frame of an `Arena`.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub(crate) arena: u32,
    pub(crate) index: u32,
    pub(crate) epoch: u32,
    /// Arena offset of the first byte of the slot.
    pub(crate) chunk: u64,
    /// Start of the data relative to `chunk`.
    pub(crate) offset: u32,
    pub(crate) len: u32,
    /// Bytes available from `offset` to the end of the slot.
    pub(crate) capacity: u32,
}

impl Frame {
    /// Slot number within the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Arena offset of the data, as it appears in a ring descriptor.
    pub fn addr(&self) -> u64 {
        self.chunk + self.offset as u64
    }

    /// Number of valid data bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes that fit in the frame after its data offset.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Sets the number of valid data bytes, typically after writing through
    /// `Arena::buffer_mut`.
    pub fn set_len(&mut self, len: u32) -> Result<()> {
        if len > self.capacity {
            return Err(XskError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "length {len} exceeds the {} bytes of frame {}",
                    self.capacity, self.index
                ),
            )));
        }
        self.len = len;
        Ok(())
    }

    pub(crate) fn desc(&self) -> XdpDesc {
        XdpDesc::new(self.addr(), self.len, 0)
    }

    /// A second token for the same slot. Only for exercising the arena's
    /// runtime ownership checks.
    #[cfg(test)]
    pub(crate) fn forge(&self) -> Frame {
        Frame { ..*self }
    }
}
