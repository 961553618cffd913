//! Per-thread allocator state: block cache, freed-slot hoard, predictor.
//!
//! Nothing in here is shared between threads, so none of it needs
//! synchronization. The global allocator keeps one `ThreadState` per thread
//! in thread-local storage; embedders driving a [`Heap`](crate::Heap)
//! directly pass their own instance, one per thread.

use crate::bitmap::WORD;
use crate::heap::block::{self, find_sub_block, locate};
use crate::heap::master::Child;
use crate::heap::varblock::VarBlock;
use crate::predictor::SizePredictor;

/// Upper bound, in bytes, on memory parked in a thread's hoard.
pub const MAX_HOARD: usize = 3000;

/// Recently used blocks remembered per thread.
const CACHE_SLOTS: usize = 8;

/// The per-thread allocation state.
///
/// `const`-constructible so it can live in `thread_local!` storage without
/// any lazy initialization. Dropping the state flushes the hoard, clearing
/// the bitmap bit of every parked slot, so a dying thread loses no memory.
pub struct ThreadState {
    /// Most-recently-used list of blocks worth probing first.
    cache: [Option<Child>; CACHE_SLOTS],
    /// Requests the cache could not serve; predictor fuel.
    cache_misses: u32,
    /// Head of the freed-slot list threaded through the slots themselves.
    freed_list: usize,
    /// Bytes currently parked in the hoard.
    hoard_size: usize,
    pub(crate) predictor: SizePredictor,
}

impl ThreadState {
    pub const fn new() -> ThreadState {
        ThreadState {
            cache: [None; CACHE_SLOTS],
            cache_misses: 0,
            freed_list: 0,
            hoard_size: 0,
            predictor: SizePredictor::new(),
        }
    }

    /// Blocks to probe, most recently used first.
    pub(crate) fn cached(&self) -> impl Iterator<Item = Child> + '_ {
        self.cache.iter().flatten().copied()
    }

    /// Move `child` to the front of the cache, evicting the tail on
    /// overflow.
    pub(crate) fn promote(&mut self, child: Child) {
        let cut = self
            .cache
            .iter()
            .position(|c| *c == Some(child))
            .unwrap_or(CACHE_SLOTS - 1);
        self.cache.copy_within(..cut, 1);
        self.cache[0] = Some(child);
    }

    /// Record a cache miss for `size`; misses are the predictor's input,
    /// and a long run of them additionally ages its counts.
    pub(crate) fn note_miss(&mut self, size: usize) {
        self.cache_misses += 1;
        if self.cache_misses % 512 == 0 {
            self.predictor.decay();
        }
        self.predictor.observe(size);
    }

    /// Park a freed slot instead of clearing its bitmap bit. The slot
    /// memory itself carries the list link. Returns `false` when the slot
    /// cannot hold a pointer or the hoard is full.
    pub(crate) fn hoard_push(&mut self, addr: usize, size: usize) -> bool {
        if size < WORD || addr % WORD != 0 || self.hoard_size >= MAX_HOARD {
            return false;
        }
        // SAFETY: the slot is owned by this thread (its bit is still set)
        // and is at least pointer sized and pointer aligned.
        unsafe { (addr as *mut usize).write(self.freed_list) };
        self.freed_list = addr;
        self.hoard_size += size;
        true
    }

    /// Take a parked slot of exactly `needed` bytes, if one is present.
    /// The slot's bitmap bit is already set, so the memory is immediately
    /// usable without touching any shared word.
    pub(crate) fn hoard_pop(&mut self, needed: usize) -> Option<usize> {
        let mut prev = 0usize;
        let mut cur = self.freed_list;
        while cur != 0 {
            // SAFETY: every list node was linked by `hoard_push` and is
            // still owned by this thread.
            let next = unsafe { (cur as *const usize).read() };
            let size = hoard_entry_size(cur);
            if size == needed {
                if prev == 0 {
                    self.freed_list = next;
                } else {
                    // SAFETY: `prev` is the owned node linked before `cur`.
                    unsafe { (prev as *mut usize).write(next) };
                }
                self.hoard_size -= size;
                return Some(cur);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Return every parked slot to its bitmap. Runs on thread exit.
    pub(crate) fn flush_hoard(&mut self) {
        let mut cur = self.freed_list;
        self.freed_list = 0;
        self.hoard_size = 0;
        while cur != 0 {
            // SAFETY: owned hoard node, see `hoard_pop`.
            let next = unsafe { (cur as *const usize).read() };
            let owner = locate(cur);
            if let Some(var) = VarBlock::from_block(owner) {
                var.release_hoarded(cur);
            } else if let Some(sub) = find_sub_block(owner, cur) {
                block::clear_bit(sub.bm, sub.class.bit_index(sub.bm, cur));
            }
            cur = next;
        }
    }

    #[cfg(test)]
    pub(crate) fn hoard_bytes(&self) -> usize {
        self.hoard_size
    }
}

/// Size of the slot a hoard entry occupies, recovered from its metadata.
fn hoard_entry_size(addr: usize) -> usize {
    let owner = locate(addr);
    if let Some(var) = VarBlock::from_block(owner) {
        var.size_of(addr).unwrap_or(0)
    } else if let Some(sub) = find_sub_block(owner, addr) {
        sub.class.slot_size()
    } else {
        0
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.flush_hoard();
    }
}

impl Default for ThreadState {
    fn default() -> ThreadState {
        ThreadState::new()
    }
}
