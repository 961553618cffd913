//! Thread-caching bitmap allocator.
//!
//! This crate provides a general-purpose memory allocator that manages the
//! process heap as a collection of 512-byte blocks. Each block ends in one
//! or more *info words* whose low bits identify the block's layout and
//! whose remaining bits form an in-use bitmap, so small allocations carry
//! almost no per-object metadata:
//!
//! * slots of 1, 2, 4 and 8 bytes live in chains of fixed-size sub-blocks
//!   with one bitmap bit per slot;
//! * mid-sized allocations are packed contiguously into variable blocks
//!   whose region sizes are implied by an ascending address array;
//! * anything larger gets a dedicated run of whole blocks.
//!
//! Given any allocated pointer, the word preceding the next 512-byte
//! boundary either *is* the managing metadata (non-zero low byte) or names
//! the managing block outright, so `free` recovers the owner in constant
//! time without any global structure.
//!
//! Many threads may allocate and free concurrently: every slot transition
//! is a single compare-and-set on an info word. Each thread additionally
//! keeps a private cache of recently used blocks, a bounded *hoard* that
//! absorbs frees which lost a race, and a size predictor that shapes newly
//! carved blocks after the thread's traffic.
//!
//! # Usage
//! Install the allocator globally and forget about it:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: bitmalloc::Allocator = bitmalloc::Allocator::new();
//! ```
//! Or drive a private heap explicitly, one [`ThreadState`] per thread:
//! ```
//! use bitmalloc::{Heap, MmapSource, ThreadState};
//! use core::alloc::Layout;
//!
//! let heap = Heap::new(MmapSource);
//! let mut state = ThreadState::new();
//! let layout = Layout::from_size_align(64, 8).unwrap();
//! let p = heap.alloc(&mut state, layout);
//! assert!(!p.is_null());
//! // SAFETY: `p` was just allocated and is not used afterwards.
//! unsafe { heap.free(&mut state, p).unwrap() };
//! ```
//!
//! # Out-of-memory behavior
//! Allocation fails by returning null exactly when the pages source cannot
//! supply a new zone. Invalid frees are reported as [`FreeError`] from
//! [`Heap::free`] and swallowed by the [`GlobalAlloc`] adapter, which is
//! not allowed to unwind.

#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod bitmap;
mod endian;
mod heap;
mod predictor;
mod thread;

pub use heap::zone::{MmapSource, PagesSource};
pub use heap::{FreeError, Heap};
pub use thread::{ThreadState, MAX_HOARD};

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;

/// The process-wide heap behind the [`Allocator`] handle.
static HEAP: Heap<MmapSource> = Heap::new(MmapSource);

std::thread_local! {
    /// Per-thread cache, hoard and predictor. `const`-initialized so no
    /// allocation happens on first access; dropping it at thread exit
    /// flushes the hoard back to the shared bitmaps.
    static THREAD_STATE: UnsafeCell<ThreadState> = const { UnsafeCell::new(ThreadState::new()) };
}

/// Run `f` with the calling thread's allocator state.
///
/// During thread teardown the thread-local may already be gone; a scratch
/// state stands in, losing only caching (its hoard flushes when it drops).
fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    match THREAD_STATE.try_with(|cell| cell.get()) {
        // SAFETY: the state is strictly thread-local and the heap never
        // re-enters the global allocator from inside itself, so no
        // second mutable borrow can exist.
        Ok(ptr) => f(unsafe { &mut *ptr }),
        Err(_) => f(&mut ThreadState::new()),
    }
}

/// The global allocator handle.
///
/// A zero-sized façade over one process-wide [`Heap`] backed by anonymous
/// pages, with per-thread state kept in thread-local storage. Assign it to
/// a static and apply `#[global_allocator]`.
pub struct Allocator;

impl Allocator {
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Allocator {
        Allocator
    }
}

impl Default for Allocator {
    fn default() -> Allocator {
        Allocator::new()
    }
}

// SAFETY: the engine honors the `GlobalAlloc` contract: returned pointers
// are aligned per the layout and remain valid until freed, null signals
// failure and nothing in here unwinds on purpose.
unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_state(|state| HEAP.alloc(state, layout))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Errors cannot be surfaced here; an invalid free is a caller bug
        // and is deliberately ignored in release builds. The assertion runs
        // outside `with_state` so its panic machinery may allocate.
        // SAFETY: the caller passes a pointer this allocator returned.
        let result = with_state(|state| unsafe { HEAP.free(state, ptr) });
        debug_assert!(result.is_ok(), "invalid free: {result:?}");
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: forwarded contract; `ptr` belongs to this allocator.
        with_state(|state| unsafe { HEAP.realloc(state, ptr, layout, new_size) })
    }
}

#[cfg(test)]
mod tests {
    use super::Allocator;
    use core::alloc::{GlobalAlloc, Layout};

    /// Assert the given alignment of pointers.
    macro_rules! assert_alignment {
        ($ptr:expr, $align:expr) => {{
            assert_eq!(($ptr as usize) % $align, 0, "alignment not fulfilled");
        }};
    }

    #[test]
    fn grows_and_serves_all_small_layouts() {
        let allocator = Allocator::new();
        for size in 1..=64usize {
            let layout = Layout::from_size_align(size, 1).unwrap();
            // SAFETY: valid layout; memory is freed below.
            let ptr = unsafe { allocator.alloc(layout) };
            assert!(!ptr.is_null());
            // SAFETY: `size` bytes were allocated.
            unsafe {
                ptr.write_bytes(0x77, size);
                allocator.dealloc(ptr, layout);
            }
        }
    }

    #[test]
    fn medium_alignments() {
        let allocator = Allocator::new();
        for align in [8, 32, 128] {
            let layout = Layout::from_size_align(4, align).unwrap();
            // SAFETY: valid layout; freed right after.
            let ptr = unsafe { allocator.alloc(layout) };
            assert_alignment!(ptr, align);
            // SAFETY: live allocation.
            unsafe { allocator.dealloc(ptr, layout) };
        }
    }

    #[test]
    fn example_usage() {
        // Example allocations with intermediate deallocation, mixed sizes
        // and alignments, crossing the fixed/variable/run boundaries.
        let allocator = Allocator::new();

        unsafe {
            // SAFETY: every pointer below is used within its layout and
            // freed exactly once.
            let layout1 = Layout::new::<u32>();
            let ptr1 = allocator.alloc(layout1);
            assert!(!ptr1.is_null());

            let layout2 = Layout::new::<f64>();
            let ptr2 = allocator.alloc(layout2);
            assert!(!ptr2.is_null());

            let layout3 = Layout::new::<[u16; 12]>();
            let ptr3 = allocator.alloc(layout3);
            assert!(!ptr3.is_null());

            allocator.dealloc(ptr2, layout2);

            let layout4 = Layout::new::<[u128; 64]>();
            let ptr4 = allocator.alloc(layout4);
            assert!(!ptr4.is_null());

            let layout5 = Layout::new::<f32>();
            let ptr5 = allocator.alloc(layout5);
            assert!(!ptr5.is_null());

            allocator.dealloc(ptr3, layout3);
            allocator.dealloc(ptr4, layout4);
            allocator.dealloc(ptr5, layout5);
            allocator.dealloc(ptr1, layout1);
        }
    }
}
