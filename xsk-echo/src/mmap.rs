//! # UMEM arena mapping
//!
//! The UMEM arena is a page-aligned, contiguous region of `FRAME_COUNT` frames
//! that the kernel and this process share for zero-copy packet I/O. The kernel
//! may map it at a different virtual address, so packets are always referred to
//! by a byte offset into the arena (the "frame address"), never by pointer.
//!
//! `OwnedMmap` owns the mapping and releases it with `munmap` on drop. The
//! arena can optionally be backed by 2MB huge pages to reduce TLB pressure;
//! availability is probed via `/proc/meminfo`.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

/// A safe owner of a memory-mapped region.
pub struct OwnedMmap(
    /// Raw pointer to the beginning of the mapped area.
    pub *mut libc::c_void,
    /// Total size of the mapped area in bytes.
    pub usize,
);

impl OwnedMmap {
    /// Allocates a new anonymous, page-aligned mapping of at least `size` bytes.
    ///
    /// With `huge_page` unset, huge pages are used when `/proc/meminfo` reports
    /// free 2MB pages; `Some(true)`/`Some(false)` enforce the choice. The size
    /// is rounded up to the page size actually used.
    pub fn mmap(size: usize, huge_page: Option<bool>) -> Result<Self, io::Error> {
        let huge_tlb = if let Some(yes) = huge_page {
            yes
        } else {
            let info = get_hugepage_info()?;
            if let (Some(free), Some(2048)) = (info.free, info.size_kb) {
                free > 0
            } else {
                false
            }
        };
        let page_size = if huge_tlb {
            2 * 1024 * 1024
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | if huge_tlb {
                        libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
                    } else {
                        0
                    },
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap(ptr, aligned_size))
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.0
    }

    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn len(&self) -> usize {
        self.1
    }

    pub fn is_empty(&self) -> bool {
        self.1 == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        unsafe {
            if self.0 != libc::MAP_FAILED && !self.0.is_null() {
                let res = libc::munmap(self.0, self.1);
                if res < 0 {
                    log::error!("Failed to unmap memory: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// Resolves a frame address to the arena bytes it designates.
///
/// Returns `None` when the offset+length pair does not lie entirely inside the
/// arena. This is the only way frame addresses become byte slices; raw arena
/// pointers never cross module boundaries.
pub fn frame_bytes(arena: &mut [u8], addr: u64, len: usize) -> Option<&mut [u8]> {
    let start = usize::try_from(addr).ok()?;
    let end = start.checked_add(len)?;
    if end > arena.len() {
        return None;
    }
    Some(&mut arena[start..end])
}

/// Lifts the locked-memory limit so the whole UMEM arena can be pinned.
///
/// AF_XDP pins the registered UMEM pages; the default `RLIMIT_MEMLOCK` is far
/// below `FRAME_COUNT * FRAME_SIZE` on most systems.
pub fn allow_unlimited_memlock() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Huge page configuration as reported by the kernel.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    pub size_kb: Option<u64>,
    pub total: Option<u64>,
    pub free: Option<u64>,
}

/// Parses `/proc/meminfo` for the huge page size and free count.
pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    let reader = BufReader::new(file);
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() == 2 {
            let key = parts[0].trim();
            let value_str = parts[1].trim().trim_end_matches(" kB");
            match key {
                "Hugepagesize" => info.size_kb = Some(value_str.parse().map_err(io::Error::other)?),
                "HugePages_Total" => {
                    info.total = Some(value_str.parse().map_err(io::Error::other)?)
                }
                "HugePages_Free" => info.free = Some(value_str.parse().map_err(io::Error::other)?),
                _ => {}
            }
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::frame_bytes;

    #[test]
    fn frame_bytes_resolves_in_bounds_offsets() {
        let mut arena = vec![0u8; 8192];
        arena[4096] = 0xab;
        let frame = frame_bytes(&mut arena, 4096, 4096).unwrap();
        assert_eq!(frame.len(), 4096);
        assert_eq!(frame[0], 0xab);
    }

    #[test]
    fn frame_bytes_rejects_out_of_bounds() {
        let mut arena = vec![0u8; 8192];
        assert!(frame_bytes(&mut arena, 8192, 1).is_none());
        assert!(frame_bytes(&mut arena, 4096, 4097).is_none());
        assert!(frame_bytes(&mut arena, u64::MAX, 64).is_none());
    }
}
