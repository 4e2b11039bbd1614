//! # Error Taxonomy
//!
//! ## Purpose
//!
//! A single error type for every fallible operation of the crate. Setup-time
//! failures (bind, attach, configuration) surface here immediately. Steady-state
//! backpressure does not: a full or empty ring is reported as a short or zero
//! count by the ring and socket methods, never as an error.
//!
//! ## Main components
//!
//! - `XskError`: the error enum.
//! - `Result<T>`: crate-wide alias.
//! - `errno_error()`: maps a raw `errno` to the matching setup-time kind.

use caps::{CapSet, Capability};
use std::io;

/// Errors returned by arena, socket and redirect program operations.
#[derive(Debug, thiserror::Error)]
pub enum XskError {
    /// The arena has no free frame. Recycle or complete frames and retry.
    #[error("out of frames: all {0} frames are in use")]
    OutOfFrames(u32),

    /// The `(interface, queue)` pair is already bound by another socket.
    #[error("queue {queue_id} on interface {if_index} is already bound")]
    BindConflict { if_index: u32, queue_id: u32 },

    /// Zero-copy was required but the driver does not provide it.
    #[error("interface {0} does not support zero-copy AF_XDP and copy fallback is disabled")]
    UnsupportedDriver(u32),

    /// The caller lacks `CAP_NET_ADMIN`/`CAP_BPF` (or equivalent).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Another XDP program already occupies the interface hook.
    #[error("an XDP program (id {prog_id}) is already attached to interface {if_index}")]
    AlreadyAttached { if_index: u32, prog_id: u32 },

    /// A frame was released that the application no longer holds.
    #[error("frame {0} released twice")]
    DoubleRelease(u32),

    /// A frame was used by a party that does not own it.
    #[error("frame {index} is not owned by the caller (state: {state})")]
    NotOwned { index: u32, state: &'static str },

    /// A previous ownership violation left the arena in an untrusted state.
    #[error("arena is poisoned by an earlier ownership violation")]
    ArenaPoisoned,

    /// The socket is closing or closed.
    #[error("socket is closed")]
    Closed,

    /// The operation is not valid in the socket's current lifecycle state.
    #[error("invalid socket state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The kernel verifier rejected the redirect program.
    #[error("failed to load XDP program: {0}")]
    Load(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, XskError>;

impl XskError {
    /// Returns `true` for the programming-error class (`DoubleRelease`, `NotOwned`).
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, XskError::DoubleRelease(_) | XskError::NotOwned { .. })
    }
}

/// Converts a raw `errno` value returned by a setup syscall into an error.
///
/// `EPERM` and `EACCES` become `PermissionDenied`; everything else is kept as
/// an `io::Error` prefixed with `what`.
pub fn errno_error(errno: i32, what: &str) -> XskError {
    match errno {
        libc::EPERM | libc::EACCES => XskError::PermissionDenied(format!(
            "{what}: {}",
            io::Error::from_raw_os_error(errno)
        )),
        _ => XskError::Io(io::Error::other(format!(
            "{what}: {}",
            io::Error::from_raw_os_error(errno)
        ))),
    }
}

/// Builds a `PermissionDenied` for `what`, naming which of the `needed`
/// capabilities are missing from the effective set.
pub fn permission_denied(what: &str, needed: &[Capability]) -> XskError {
    let missing: Vec<String> = needed
        .iter()
        .filter(|cap| !caps::has_cap(None, CapSet::Effective, **cap).unwrap_or(false))
        .map(|cap| cap.to_string())
        .collect();
    if missing.is_empty() {
        XskError::PermissionDenied(what.to_string())
    } else {
        XskError::PermissionDenied(format!("{what}: missing {}", missing.join(", ")))
    }
}

/// Like `errno_error` but reads `errno` from the last failed syscall.
pub fn last_errno_error(what: &str) -> XskError {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    errno_error(errno, what)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permission_errors_are_classified() {
        assert!(matches!(
            errno_error(libc::EPERM, "bind"),
            XskError::PermissionDenied(_)
        ));
        assert!(matches!(
            errno_error(libc::EACCES, "bpf"),
            XskError::PermissionDenied(_)
        ));
        assert!(matches!(errno_error(libc::EINVAL, "bind"), XskError::Io(_)));
    }

    #[test]
    fn permission_denied_names_the_action() {
        let err = permission_denied("attach", &[Capability::CAP_NET_ADMIN]);
        assert!(matches!(&err, XskError::PermissionDenied(msg) if msg.starts_with("attach")));
    }

    #[test]
    fn ownership_violations() {
        assert!(XskError::DoubleRelease(3).is_ownership_violation());
        assert!(
            XskError::NotOwned {
                index: 1,
                state: "free"
            }
            .is_ownership_violation()
        );
        assert!(!XskError::OutOfFrames(4).is_ownership_violation());
    }
}
