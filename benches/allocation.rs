#![feature(test)]
extern crate test;
use test::Bencher;

use std::alloc::{GlobalAlloc as _, Layout};

mod repeated_allocation_deallocation {
    use super::*;

    /// Run a benchmark, which repeatedly allocates and deallocates the same
    /// block. The benchmark will allocate the given amount of blocks
    /// beforehand (before running the actual benchmark) in order to fill up
    /// the heap with unrelated allocations.
    fn benchmark_with_preallocation(b: &mut Bencher, pre_allocations: usize) {
        let allocator = bitmalloc::Allocator::new();
        // pre-allocate much memory to see the real impact of cache misses
        for _ in 0..pre_allocations {
            unsafe { allocator.alloc(Layout::new::<u8>()) };
        }

        let layout = Layout::new::<u64>();

        // make sure, that there is enough room for the next allocation
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, std::ptr::null_mut::<u8>());
        unsafe { allocator.dealloc(ptr, layout) };

        // run actual benchmark: allocate & deallocate the same block repeatedly
        b.iter(|| {
            let ptr = unsafe { allocator.alloc(layout) };
            let ptr = test::black_box(ptr);
            unsafe { allocator.dealloc(ptr, layout) };
        });
    }

    #[bench]
    fn no_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 0);
    }

    #[bench]
    fn low_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8);
    }

    #[bench]
    fn medium_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 510);
    }

    #[bench]
    fn high_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 1020);
    }
}

mod packed_regions {
    use super::*;

    /// Alternate between two region sizes so the variable-size engine keeps
    /// trimming and coalescing the same payload block.
    #[bench]
    fn trim_and_coalesce(b: &mut Bencher) {
        let allocator = bitmalloc::Allocator::new();
        let small = Layout::from_size_align(40, 8).unwrap();
        let large = Layout::from_size_align(120, 8).unwrap();

        b.iter(|| {
            let p = unsafe { allocator.alloc(small) };
            let q = unsafe { allocator.alloc(large) };
            let p = test::black_box(p);
            let q = test::black_box(q);
            unsafe { allocator.dealloc(q, large) };
            unsafe { allocator.dealloc(p, small) };
        });
    }
}
