//! The pages source: where zone memory comes from.
//!
//! The heap models its supply of raw memory as an opaque capability with
//! two operations, acquire and release. The default implementation maps
//! anonymous pages with `mmap(2)`; tests may substitute their own source.

use core::ptr::{self, NonNull};

use crate::bitmap::BLOCK;

/// Hardware page size assumed for trimming. `mmap` only hands out
/// page-aligned regions, so requests are rounded up to this granularity.
const PAGE: usize = 4096;

/// Supplier of zone-sized, block-aligned memory regions.
///
/// The heap presumes acquired pages are mapped read/write and that any
/// alignment of at least the 512-byte block size is honored.
pub trait PagesSource {
    /// Obtain a region of at least `min_bytes` bytes aligned to `align`.
    ///
    /// Returns `None` when the host cannot supply more memory; the heap
    /// turns that into a null result from its allocation entry points.
    fn acquire(&self, min_bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a region previously obtained from [`acquire`](Self::acquire).
    ///
    /// # Safety
    /// `base` and `bytes` must describe exactly one region handed out by
    /// this source and the caller must not touch the memory afterwards.
    unsafe fn release(&self, base: NonNull<u8>, bytes: usize);
}

/// The `mmap`-backed pages source used by the global allocator.
///
/// Alignment beyond the page size is produced by over-mapping and trimming
/// the misaligned head and the surplus tail, so no virtual address space is
/// held beyond the returned region.
pub struct MmapSource;

impl MmapSource {
    fn round_up(value: usize, to: usize) -> usize {
        (value + to - 1) & !(to - 1)
    }
}

impl PagesSource for MmapSource {
    fn acquire(&self, min_bytes: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two() && align >= BLOCK);
        let align = align.max(PAGE);
        let bytes = Self::round_up(min_bytes, PAGE);
        let span = bytes + align;

        // SAFETY: a fresh anonymous private mapping with no file descriptor
        // involved; every argument combination here is valid for mmap.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                span,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }

        let base = Self::round_up(raw as usize, align);
        let lead = base - raw as usize;
        if lead > 0 {
            // SAFETY: `raw` is page-aligned and the leading `lead` bytes
            // belong to the mapping created above.
            unsafe { libc::munmap(raw, lead) };
        }
        let tail = span - lead - bytes;
        if tail > 0 {
            // SAFETY: `base + bytes` is page-aligned (both operands are
            // page multiples) and the trailing bytes belong to the mapping.
            unsafe { libc::munmap((base + bytes) as *mut libc::c_void, tail) };
        }
        NonNull::new(base as *mut u8)
    }

    unsafe fn release(&self, base: NonNull<u8>, bytes: usize) {
        let bytes = Self::round_up(bytes, PAGE);
        // SAFETY: the region was produced by `acquire`, which returns a
        // page-aligned base and a page-rounded extent.
        unsafe { libc::munmap(base.as_ptr().cast(), bytes) };
    }
}

#[cfg(test)]
mod tests {
    use super::{MmapSource, PagesSource, BLOCK};

    #[test]
    fn acquire_honors_alignment() {
        let source = MmapSource;
        for align in [BLOCK, 4096, 16 * 1024] {
            let region = source.acquire(3 * BLOCK, align).unwrap();
            assert_eq!(region.as_ptr() as usize % align, 0);
            // SAFETY: freshly acquired region of at least 3 blocks.
            unsafe {
                region.as_ptr().write_bytes(0xa5, 3 * BLOCK);
                source.release(region, 3 * BLOCK);
            }
        }
    }

    #[test]
    fn fresh_pages_are_zeroed() {
        let source = MmapSource;
        let region = source.acquire(BLOCK, BLOCK).unwrap();
        // SAFETY: the region spans at least one block.
        let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr(), BLOCK) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: acquired above, not used afterwards.
        unsafe { source.release(region, BLOCK) };
    }
}
