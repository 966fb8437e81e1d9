//! Bucket array storage.
//!
//! This module owns the memory behind the index: the contiguous array of
//! bucket head lines, and the allocation entry points for overflow lines.
//! Both hand back zeroed, cache-line-aligned memory so every slot starts
//! unused.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;
use std::ptr::NonNull;

use crate::constants::CACHE_LINE_BYTES;
use crate::error::IndexError;
use crate::index::CacheLine;

/// How the bucket array memory was obtained, so `Drop` can return it the
/// same way.
enum Backing {
    /// Standard aligned heap allocation.
    Heap(Layout),
    /// Anonymous large-page mapping of this many bytes.
    #[cfg(target_os = "linux")]
    HugeTlb(usize),
}

/// The contiguous array of bucket head lines.
///
/// Allocated once at construction, zeroed, aligned to the cache line. With
/// `use_large_pages` the array is served from an anonymous `MAP_HUGETLB`
/// mapping when the host provides one; otherwise (and on any failure) it
/// falls back to the standard allocator with a warning.
pub struct BucketArray {
    lines: NonNull<CacheLine>,
    n_lines: u64,
    backing: Backing,
}

impl BucketArray {
    /// Allocate a zeroed array of `n_lines` cache lines.
    pub fn allocate(n_lines: u64, use_large_pages: bool) -> Result<Self, IndexError> {
        assert!(n_lines > 0, "bucket array needs at least one line");
        let bytes = n_lines as usize * mem::size_of::<CacheLine>();

        if use_large_pages {
            #[cfg(target_os = "linux")]
            if let Some((lines, mapped)) = Self::allocate_huge(bytes) {
                return Ok(Self {
                    lines,
                    n_lines,
                    backing: Backing::HugeTlb(mapped),
                });
            }
            tracing::warn!(
                bytes,
                "large-page allocation unavailable, falling back to the standard allocator"
            );
        }

        let layout = Layout::from_size_align(bytes, CACHE_LINE_BYTES)
            .map_err(|_| IndexError::AllocationFailed { bytes })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let lines = NonNull::new(ptr as *mut CacheLine)
            .ok_or(IndexError::AllocationFailed { bytes })?;
        Ok(Self {
            lines,
            n_lines,
            backing: Backing::Heap(layout),
        })
    }

    /// Try to map `bytes` of anonymous large-page memory.
    ///
    /// Returns the mapping and its padded length, or `None` when the host
    /// has no huge pages to give. The kernel zeroes anonymous mappings.
    #[cfg(target_os = "linux")]
    fn allocate_huge(bytes: usize) -> Option<(NonNull<CacheLine>, usize)> {
        use crate::utility::pad_alignment;

        // MAP_HUGETLB wants the length rounded to the default huge page size.
        const HUGE_PAGE_BYTES: usize = 2 << 20;
        let mapped = pad_alignment(bytes, HUGE_PAGE_BYTES);

        // SAFETY: anonymous mapping, no fd, no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut CacheLine).map(|lines| (lines, mapped))
    }

    /// Get the number of lines
    #[inline]
    pub fn len(&self) -> u64 {
        self.n_lines
    }

    /// Check if the array is empty (never true after construction)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_lines == 0
    }

    /// Get the line at `index`
    #[inline]
    pub fn line(&self, index: usize) -> &CacheLine {
        debug_assert!((index as u64) < self.n_lines);
        // SAFETY: index is in bounds and the array lives as long as self.
        unsafe { &*self.lines.as_ptr().add(index) }
    }

    /// Get the line at `index` mutably
    #[inline]
    pub fn line_mut(&mut self, index: usize) -> &mut CacheLine {
        debug_assert!((index as u64) < self.n_lines);
        // SAFETY: index is in bounds; &mut self guarantees exclusivity.
        unsafe { &mut *self.lines.as_ptr().add(index) }
    }
}

impl Drop for BucketArray {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap(layout) => {
                // SAFETY: allocated in `allocate` with this exact layout.
                unsafe { dealloc(self.lines.as_ptr() as *mut u8, layout) };
            }
            #[cfg(target_os = "linux")]
            Backing::HugeTlb(mapped) => {
                // SAFETY: mapped in `allocate_huge` with this exact length.
                unsafe { libc::munmap(self.lines.as_ptr() as *mut libc::c_void, mapped) };
            }
        }
    }
}

// SAFETY: BucketArray owns its memory exclusively; no interior mutability.
unsafe impl Send for BucketArray {}
unsafe impl Sync for BucketArray {}

/// Allocate one zeroed overflow cache line.
///
/// Overflow lines are allocated one at a time on the insert-growth path and
/// stay alive until [`free_overflow_line`] at index destruction.
pub(crate) fn alloc_overflow_line() -> Result<NonNull<CacheLine>, IndexError> {
    let layout = Layout::new::<CacheLine>();
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc_zeroed(layout) };
    NonNull::new(ptr as *mut CacheLine).ok_or(IndexError::AllocationFailed {
        bytes: layout.size(),
    })
}

/// Free an overflow cache line.
///
/// # Safety
/// `line` must come from [`alloc_overflow_line`] and must not be reachable
/// from any chain afterwards.
pub(crate) unsafe fn free_overflow_line(line: NonNull<CacheLine>) {
    // SAFETY: forwarded preconditions.
    unsafe { dealloc(line.as_ptr() as *mut u8, Layout::new::<CacheLine>()) };
}
