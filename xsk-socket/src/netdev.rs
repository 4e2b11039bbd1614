//! # Network Device Queries
//!
//! Interface lookups needed before binding: name to index resolution and the
//! XDP feature flags reported by the driver.

use crate::error::{Result, XskError, errno_error};
use std::ffi::CString;
use std::io;
use std::mem::size_of;

/// `NETDEV_XDP_ACT_XSK_ZEROCOPY` from `include/uapi/linux/netdev.h`.
pub const XDP_FEATURE_XSK_ZEROCOPY: u32 = 1 << 3;
/// `NETDEV_XDP_ACT_REDIRECT`.
pub const XDP_FEATURE_REDIRECT: u32 = 1 << 1;

/// Resolves an interface name such as `eth0` to its index.
pub fn if_index(name: &str) -> Result<u32> {
    let c_name =
        CString::new(name).map_err(|_| XskError::InterfaceNotFound(name.to_string()))?;
    match unsafe { libc::if_nametoindex(c_name.as_ptr()) } {
        0 => Err(XskError::InterfaceNotFound(format!(
            "{name}: {}",
            io::Error::last_os_error()
        ))),
        index => Ok(index),
    }
}

/// Queries the XDP feature flags (`NETDEV_XDP_ACT_*`) of an interface driver.
pub fn xdp_features(if_index: u32) -> Result<u32> {
    Ok(unsafe {
        let mut opts: libbpf_sys::bpf_xdp_query_opts = std::mem::zeroed();
        opts.sz = size_of::<libbpf_sys::bpf_xdp_query_opts>() as _;
        let ret = libbpf_sys::bpf_xdp_query(
            if_index as libc::c_int,
            libbpf_sys::XDP_FLAGS_DRV_MODE as libc::c_int,
            &mut opts,
        );
        if ret < 0 {
            return Err(match -ret {
                libc::ENODEV => XskError::InterfaceNotFound(format!("index {if_index}")),
                errno => errno_error(errno, "failed to query XDP features"),
            });
        }
        opts.feature_flags as u32
    })
}

/// Whether the driver advertises zero-copy AF_XDP. `None` when the kernel
/// reports no XDP features at all (before 6.3), so support is unknown.
pub fn supports_zero_copy(if_index: u32) -> Result<Option<bool>> {
    Ok(zero_copy_from_features(xdp_features(if_index)?))
}

fn zero_copy_from_features(flags: u32) -> Option<bool> {
    match flags {
        0 => None,
        flags => Some(flags & XDP_FEATURE_XSK_ZEROCOPY != 0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_resolves() {
        assert_eq!(if_index("lo").unwrap(), 1);
    }

    #[test]
    fn unknown_interface() {
        assert!(matches!(
            if_index("nosuchdev0"),
            Err(XskError::InterfaceNotFound(_))
        ));
        assert!(matches!(
            if_index("bad\0name"),
            Err(XskError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn missing_feature_report_is_unknown() {
        assert_eq!(zero_copy_from_features(0), None);
        assert_eq!(zero_copy_from_features(XDP_FEATURE_REDIRECT), Some(false));
        assert_eq!(
            zero_copy_from_features(XDP_FEATURE_REDIRECT | XDP_FEATURE_XSK_ZEROCOPY),
            Some(true)
        );
    }
}
