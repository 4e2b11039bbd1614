//! # Memory Mapping for the Frame Arena and Rings
//!
//! ## Purpose
//!
//! Safe ownership of `mmap`-ed regions: the page-aligned arena memory shared
//! with the kernel, and the ring regions mapped from the socket file
//! descriptor.
//!
//! ## How it works
//!
//! `OwnedMmap` wraps the pointer and length returned by `libc::mmap` and calls
//! `libc::munmap` on drop. The arena mapping can be backed by 2MB huge pages,
//! which reduces TLB misses; when the caller does not decide, `/proc/meminfo`
//! is consulted.
//!
//! ## Main components
//!
//! - `OwnedMmap`: owner of one mapped region.
//! - `get_hugepage_info()`: parses huge page availability from `/proc/meminfo`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::RawFd;
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// One mapped region, unmapped on drop.
///
/// The address never changes for the lifetime of the value, which is what the
/// kernel relies on once the region is registered as a UMEM.
pub struct OwnedMmap {
    addr: ptr::NonNull<libc::c_void>,
    len: usize,
}

// The region is plain memory; synchronisation of its contents is the job of
// the ring indices and the arena ownership table.
unsafe impl Send for OwnedMmap {}
unsafe impl Sync for OwnedMmap {}

impl OwnedMmap {
    /// Creates a new anonymous, private region suitable for use as a UMEM.
    ///
    /// If `huge_page` is `None`, huge pages are used when `/proc/meminfo`
    /// reports enough free 2MB pages, and a failed huge page mapping falls
    /// back to regular pages. The size is rounded up to the page size.
    pub fn mmap(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        let huge = huge_page.unwrap_or_else(|| huge_pages_cover(size));
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let granule = if huge {
            flags |= libc::MAP_HUGETLB | libc::MAP_HUGE_2MB;
            HUGE_PAGE_SIZE
        } else {
            crate::config::page_size()
        };
        let len = size.div_ceil(granule) * granule;
        match Self::map(len, flags, -1, 0) {
            Err(err) if huge && huge_page.is_none() => {
                log::debug!("huge page mapping failed ({err}), using regular pages");
                Self::mmap(size, Some(false))
            }
            Err(err) => Err(err),
            Ok(region) => {
                log::debug!("arena mapped: {len} bytes at {:p}, huge pages {huge}", region.addr);
                Ok(region)
            }
        }
    }

    /// Maps `size` bytes of a socket's ring region at page offset `pgoff`.
    pub fn mmap_shared(fd: RawFd, size: usize, pgoff: u64) -> io::Result<Self> {
        Self::map(
            size,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            pgoff as libc::off_t,
        )
    }

    fn map(len: usize, flags: libc::c_int, fd: RawFd, offset: libc::off_t) -> io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let raw = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, offset) };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        ptr::NonNull::new(raw)
            .map(|addr| OwnedMmap { addr, len })
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.addr.as_ptr()
    }

    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.addr.as_ptr(), self.len) } < 0 {
            log::error!("munmap of {} bytes: {}", self.len, io::Error::last_os_error());
        }
    }
}

fn huge_pages_cover(size: usize) -> bool {
    match get_hugepage_info() {
        Ok(HugePageInfo {
            free: Some(free),
            size_kb: Some(2048),
            ..
        }) => free as usize * HUGE_PAGE_SIZE >= size,
        _ => false,
    }
}

/// Contains information about the system's huge page configuration.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    /// The size of a huge page in kilobytes.
    pub size_kb: Option<u64>,
    /// The total number of huge pages configured in the system.
    pub total: Option<u64>,
    /// The number of free (available) huge pages.
    pub free: Option<u64>,
}

/// Parses `/proc/meminfo` to get information about huge pages.
pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    parse_hugepage_info(BufReader::new(file))
}

fn parse_hugepage_info(reader: impl BufRead) -> io::Result<HugePageInfo> {
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value_str = value.trim().trim_end_matches(" kB");
        let parsed = || value_str.parse::<u64>().map_err(io::Error::other);
        match key.trim() {
            "Hugepagesize" => info.size_kb = Some(parsed()?),
            "HugePages_Total" => info.total = Some(parsed()?),
            "HugePages_Free" => info.free = Some(parsed()?),
            _ => {}
        }
    }
    Ok(info)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anonymous_mapping_is_page_aligned() {
        let map = OwnedMmap::mmap(10_000, Some(false)).unwrap();
        let page = crate::config::page_size();
        assert_eq!(map.as_u8_ptr() as usize % page, 0);
        assert_eq!(map.len() % page, 0);
        assert!(map.len() >= 10_000);
    }

    #[test]
    fn parses_meminfo() {
        let text = "MemTotal:       16318480 kB\n\
                    HugePages_Total:      64\n\
                    HugePages_Free:       60\n\
                    Hugepagesize:       2048 kB\n";
        let info = parse_hugepage_info(text.as_bytes()).unwrap();
        assert_eq!(info.total, Some(64));
        assert_eq!(info.free, Some(60));
        assert_eq!(info.size_kb, Some(2048));
    }
}
