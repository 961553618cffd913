//! Multi-thread stress: concurrent frees and allocations racing on the
//! same bitmap words. Lost races park slots in the freeing thread's hoard;
//! the hoard flushes when that thread's state drops, so by the end of each
//! round every slot must be reachable again.

use core::alloc::Layout;
use std::collections::HashSet;
use std::thread;

use bitmalloc::{Heap, MmapSource, ThreadState};

#[test]
fn racing_frees_lose_no_slot() {
    let heap = Heap::new(MmapSource);
    let layout = Layout::from_size_align(8, 8).unwrap();
    let mut main_state = ThreadState::new();

    for _round in 0..100 {
        let ptrs: Vec<usize> = (0..40)
            .map(|_| heap.alloc(&mut main_state, layout) as usize)
            .collect();
        assert!(ptrs.iter().all(|&p| p != 0));
        assert_eq!(ptrs.iter().collect::<HashSet<_>>().len(), ptrs.len());

        // Two threads free interleaved halves of the same blocks.
        thread::scope(|scope| {
            for half in ptrs.chunks(20) {
                let heap = &heap;
                scope.spawn(move || {
                    let mut state = ThreadState::new();
                    for &p in half {
                        // SAFETY: each pointer is freed exactly once, by
                        // exactly one thread.
                        unsafe { heap.free(&mut state, p as *mut u8).unwrap() };
                    }
                    // Dropping the state flushes any hoarded slots.
                });
            }
        });

        // Every slot is free again: the same number of allocations must
        // succeed without mapping new zones forever.
        let again: Vec<usize> = (0..40)
            .map(|_| heap.alloc(&mut main_state, layout) as usize)
            .collect();
        assert!(again.iter().all(|&p| p != 0));
        for &p in &again {
            // SAFETY: just allocated, freed once.
            unsafe { heap.free(&mut main_state, p as *mut u8).unwrap() };
        }
    }
}

#[test]
fn concurrent_alloc_free_churn_stays_consistent() {
    let heap = Heap::new(MmapSource);

    thread::scope(|scope| {
        for t in 0..4usize {
            let heap = &heap;
            scope.spawn(move || {
                let mut state = ThreadState::new();
                let mut live: Vec<(usize, usize, u8)> = Vec::new();
                for i in 0..2000usize {
                    let size = 1 + (i * 31 + t * 7) % 200;
                    let layout = Layout::from_size_align(size, 1).unwrap();
                    let p = heap.alloc(&mut state, layout);
                    assert!(!p.is_null());
                    let fill = (t as u8) ^ (i as u8);
                    // SAFETY: `size` bytes were just allocated.
                    unsafe { p.write_bytes(fill, size) };
                    live.push((p as usize, size, fill));

                    if live.len() > 16 {
                        let (q, qsize, qfill) = live.swap_remove(i % live.len());
                        // The thread's own data must be untouched: regions
                        // never overlap across threads.
                        // SAFETY: `q` is a live allocation of `qsize` bytes.
                        unsafe {
                            let bytes = core::slice::from_raw_parts(q as *const u8, qsize);
                            assert!(bytes.iter().all(|&b| b == qfill));
                            heap.free(&mut state, q as *mut u8).unwrap();
                        }
                    }
                }
                for (q, _, _) in live {
                    // SAFETY: remaining live allocations, freed once.
                    unsafe { heap.free(&mut state, q as *mut u8).unwrap() };
                }
            });
        }
    });
}

#[test]
fn run_sized_allocations_race_cleanly() {
    let heap = Heap::new(MmapSource);

    thread::scope(|scope| {
        for t in 0..3usize {
            let heap = &heap;
            scope.spawn(move || {
                let mut state = ThreadState::new();
                for i in 0..50usize {
                    let size = 600 + 512 * (i % 3) + t;
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    let p = heap.alloc(&mut state, layout);
                    assert!(!p.is_null());
                    // SAFETY: the run spans at least `size` bytes.
                    unsafe {
                        p.write_bytes(0xc3, size);
                        heap.free(&mut state, p).unwrap();
                    }
                }
            });
        }
    });
}
