//! Variable-size blocks: an address array describing packed regions.
//!
//! A variable-size unit is a pair of adjacent 512-byte blocks. The first is
//! the *payload* block: user regions are packed into its bytes 8..504 (496
//! usable bytes; the first word stays empty so no region ever starts on a
//! block boundary, which the locator reserves for whole-block runs) and its
//! final word holds the address of the second block. That second block is
//! the *metadata* block: 62 slot words, the info word and a trailing
//! self-pointer (which is what the locator finds, for payload pointers via
//! the payload block's final word and for inline pointers directly).
//!
//! Slot words are tagged in their first memory byte: `0` means the word is
//! a (rotated) region boundary address, `1..=7` means the slot itself holds
//! that many bytes of payload inline, and an all-zero word is a vacant
//! slot. Boundary addresses are strictly ascending by slot index; a region
//! ends where the next boundary begins, so region sizes cost no storage.
//! Slot `i` owns info-word bit `3 + i`; the last slot is reserved and holds
//! the address of the next allocation block in the zone (the wilderness
//! boundary until one is carved).
//!
//! Every mutation follows the same protocol: claim all touched slots by
//! flipping their bits to "used" in one compare-and-set, *recheck* that the
//! slot words still hold what the pre-claim snapshot saw (a peer may have
//! rewritten a slot and released its bit in between, restoring the same
//! info word), write the slot words, then release whatever should end up
//! free. A failed recheck rolls the claimed bits back and restarts. Peers
//! therefore never observe a half-written boundary.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::{BLOCK, WORD};
use crate::endian;
use crate::heap::FreeError;
use crate::heap::block::atom;
use crate::thread::ThreadState;

/// Slots that may carry boundaries or inline payload (index 61 is reserved).
pub const USER_SLOTS: usize = 61;

/// Index of the reserved slot holding the next-block/wilderness address.
pub const RESERVED_SLOT: usize = 61;

/// Usable payload bytes in the paired payload block (bytes 8..504).
pub const PAYLOAD_BYTES: usize = BLOCK - 2 * WORD;

/// Largest request served from a variable block.
pub const MAX_REGION: usize = PAYLOAD_BYTES;

/// Info-word bit owned by slot `i`; bits 0..=2 are the discriminator.
const BIT_BASE: u32 = 3;

/// Word offsets inside the metadata block.
const INFO_OFFSET: usize = 62 * WORD;
const SELF_OFFSET: usize = 63 * WORD;

/// Slot index where the initial free-region boundary is placed: in the
/// middle of the array so trims can insert boundaries on either side.
const INITIAL_BOUNDARY: usize = 30;

/// Handle to one variable-size unit, identified by its metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarBlock {
    meta: usize,
}

/// Consistent snapshot of the boundary slots: parallel index/address
/// arrays, ordered by slot index (and therefore by address).
struct Boundaries {
    idx: [u8; USER_SLOTS],
    addr: [usize; USER_SLOTS],
    len: usize,
}

impl VarBlock {
    /// Lay out a fresh unit over two adjacent zeroed blocks starting at
    /// `payload` and return its handle.
    pub fn init(payload: usize) -> VarBlock {
        debug_assert!(payload % BLOCK == 0);
        let meta = payload + BLOCK;
        let block = VarBlock { meta };
        // SAFETY: both blocks were just carved from a zone and are unshared
        // until the handle escapes.
        unsafe {
            atom(meta + INITIAL_BOUNDARY * WORD)
                .store(endian::rotate(payload + WORD), Ordering::Relaxed);
            atom(meta + RESERVED_SLOT * WORD)
                .store(endian::rotate(meta + BLOCK), Ordering::Relaxed);
            atom(meta + INFO_OFFSET).store(0, Ordering::Relaxed);
            atom(meta + SELF_OFFSET).store(meta, Ordering::Relaxed);
            atom(payload + BLOCK - WORD).store(meta, Ordering::Release);
        }
        block
    }

    /// Reconstruct a handle from a located block, verifying the
    /// self-pointer sentinel.
    pub fn from_block(block: usize) -> Option<VarBlock> {
        if block == 0 || block % BLOCK != 0 {
            return None;
        }
        // SAFETY: `block` came from the locator, so its final word is
        // mapped heap memory.
        let sentinel = unsafe { atom(block + SELF_OFFSET) }.load(Ordering::Acquire);
        (sentinel == block).then_some(VarBlock { meta: block })
    }

    /// Base address of the metadata block.
    pub fn meta(self) -> usize {
        self.meta
    }

    /// Base address of the paired payload block.
    pub fn payload(self) -> usize {
        self.meta - BLOCK
    }

    /// First usable payload address; the payload block's initial word is
    /// never handed out.
    pub fn payload_start(self) -> usize {
        self.payload() + WORD
    }

    /// One past the last usable payload address.
    fn payload_end(self) -> usize {
        self.payload() + BLOCK - WORD
    }

    fn info(self) -> &'static AtomicUsize {
        // SAFETY: the metadata block stays mapped for the process lifetime.
        unsafe { atom(self.meta + INFO_OFFSET) }
    }

    fn slot(self, i: usize) -> &'static AtomicUsize {
        debug_assert!(i < RESERVED_SLOT + 1);
        // SAFETY: slot words lie inside the metadata block.
        unsafe { atom(self.meta + i * WORD) }
    }

    const fn bit(slot: usize) -> usize {
        1 << (BIT_BASE + slot as u32)
    }

    /// Record which allocation block follows this unit in its zone.
    pub fn set_next_block(self, next: usize) {
        self.slot(RESERVED_SLOT)
            .store(endian::rotate(next), Ordering::Release);
    }

    /// Read the info word and every boundary slot consistently: the info
    /// word is re-read after the scan and the scan restarts whenever a
    /// peer's bit transition slipped in between.
    fn snapshot(self) -> (usize, Boundaries) {
        loop {
            let before = self.info().load(Ordering::Acquire);
            let mut bounds = Boundaries {
                idx: [0; USER_SLOTS],
                addr: [0; USER_SLOTS],
                len: 0,
            };
            for i in 0..USER_SLOTS {
                let word = self.slot(i).load(Ordering::Acquire);
                if word != 0 && endian::slot_tag(word) == 0 {
                    bounds.idx[bounds.len] = i as u8;
                    bounds.addr[bounds.len] = endian::unrotate(word);
                    bounds.len += 1;
                }
            }
            if self.info().load(Ordering::Acquire) == before {
                return (before, bounds);
            }
        }
    }

    /// End address of the region starting at snapshot position `pos`.
    fn region_end(self, bounds: &Boundaries, pos: usize) -> usize {
        if pos + 1 < bounds.len {
            bounds.addr[pos + 1]
        } else {
            self.payload_end()
        }
    }

    /// Allocate `n` bytes (a multiple of the word size) from a free region.
    ///
    /// An exact fit claims the region's bit. Otherwise the region is
    /// trimmed: a vacant slot is claimed together with the region's bit,
    /// the new boundary pair is written and the remainder is released as a
    /// smaller free region. The low end of the region is preferred; when no
    /// vacant slot is available below the boundary the high end is used.
    pub fn alloc(self, n: usize) -> Option<usize> {
        debug_assert!(n % WORD == 0 && n > 0 && n <= MAX_REGION);
        'retry: loop {
            let (b, bounds) = self.snapshot();
            for pos in 0..bounds.len {
                let slot = bounds.idx[pos] as usize;
                if b & Self::bit(slot) != 0 {
                    continue; // in use
                }
                let start = bounds.addr[pos];
                let end = self.region_end(&bounds, pos);
                let size = end - start;
                if size < n {
                    continue;
                }
                if size == n {
                    if !self.claim_checked(b, slot, start, None) {
                        continue 'retry;
                    }
                    return Some(start);
                }
                // Look for a vacant slot below the boundary (low-end trim),
                // then above it (high-end trim).
                let lo = if pos == 0 { 0 } else { bounds.idx[pos - 1] as usize + 1 };
                let hi = if pos + 1 < bounds.len {
                    bounds.idx[pos + 1] as usize
                } else {
                    USER_SLOTS
                };
                let below = (lo..slot).find(|&v| self.is_vacant(b, v));
                let above = (slot + 1..hi).find(|&v| self.is_vacant(b, v));
                let (vacant, user, rewrite) = match (below, above) {
                    (Some(v), _) => (v, start, Some(start + n)),
                    (None, Some(v)) => (v, end - n, None),
                    (None, None) => {
                        // No boundary room left; take the whole region if
                        // the waste is tolerable, else look further.
                        if size - n <= 4 * WORD {
                            if !self.claim_checked(b, slot, start, None) {
                                continue 'retry;
                            }
                            return Some(start);
                        }
                        continue;
                    }
                };
                if !self.claim_checked(b, slot, start, Some(vacant)) {
                    continue 'retry;
                }
                self.slot(vacant)
                    .store(endian::rotate(user), Ordering::Release);
                if let Some(new_start) = rewrite {
                    self.slot(slot)
                        .store(endian::rotate(new_start), Ordering::Release);
                }
                // Release the shrunken remainder back to "free".
                self.clear_bits(Self::bit(slot));
                return Some(user);
            }
            return None;
        }
    }

    /// Store `len` bytes inline in a vacant slot and return the payload
    /// address (the byte after the tag byte).
    pub fn alloc_inline(self, len: usize) -> Option<usize> {
        debug_assert!((1..=7).contains(&len));
        loop {
            let b = self.info().load(Ordering::Acquire);
            let vacant = (0..USER_SLOTS).rev().find(|&v| self.is_vacant(b, v))?;
            let claim = b | Self::bit(vacant);
            if self
                .info()
                .compare_exchange(b, claim, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.slot(vacant).load(Ordering::Acquire) != 0 {
                    // Reused as a boundary while unclaimed; roll back.
                    self.clear_bits(Self::bit(vacant));
                    continue;
                }
                self.slot(vacant)
                    .store(endian::inline_tag(len), Ordering::Release);
                return Some(self.meta + vacant * WORD + 1);
            }
        }
    }

    /// Whether slot `v` is vacant under info word `b`: no bit claimed and
    /// an all-zero word.
    fn is_vacant(self, b: usize, v: usize) -> bool {
        b & Self::bit(v) == 0 && self.slot(v).load(Ordering::Acquire) == 0
    }

    /// Claim the boundary `slot` (plus, optionally, a vacant slot) against
    /// the snapshot word `b`, then recheck that both slot words still hold
    /// what the snapshot saw. On any mismatch the claimed bits roll back
    /// and the caller restarts from a fresh snapshot.
    fn claim_checked(self, b: usize, slot: usize, start: usize, vacant: Option<usize>) -> bool {
        let mask = Self::bit(slot) | vacant.map_or(0, Self::bit);
        if self
            .info()
            .compare_exchange(b, b | mask, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let boundary_ok = self.slot(slot).load(Ordering::Acquire) == endian::rotate(start);
        let vacant_ok =
            vacant.map_or(true, |v| self.slot(v).load(Ordering::Acquire) == 0);
        if boundary_ok && vacant_ok {
            return true;
        }
        self.clear_bits(mask);
        false
    }

    /// Release the allocation owning pointer `p` (region or inline).
    pub fn free(self, p: usize, state: &mut ThreadState) -> Result<(), FreeError> {
        if p >= self.payload_start() && p < self.payload_end() {
            return self.free_region(p, state);
        }
        if p > self.meta && p < self.meta + RESERVED_SLOT * WORD && (p - 1 - self.meta) % WORD == 0
        {
            return self.free_inline(p);
        }
        Err(FreeError::AllocationNotFound)
    }

    fn free_inline(self, p: usize) -> Result<(), FreeError> {
        let slot = (p - 1 - self.meta) / WORD;
        let word = self.slot(slot).load(Ordering::Acquire);
        let tag = endian::slot_tag(word);
        if !(1..=7).contains(&tag) {
            return Err(FreeError::AllocationNotFound);
        }
        if self.info().load(Ordering::Acquire) & Self::bit(slot) == 0 {
            return Err(FreeError::DoubleFreeDetected);
        }
        // The slot is owned until its bit clears, so the value store comes
        // first and the vacant state becomes visible with the bit flip.
        self.slot(slot).store(0, Ordering::Release);
        self.clear_bits(Self::bit(slot));
        Ok(())
    }

    fn free_region(self, p: usize, state: &mut ThreadState) -> Result<(), FreeError> {
        let (b, bounds) = self.snapshot();
        let pos = (0..bounds.len)
            .find(|&pos| {
                bounds.addr[pos] <= p && p < self.region_end(&bounds, pos)
            })
            .ok_or(FreeError::AllocationNotFound)?;
        let slot = bounds.idx[pos] as usize;
        let start = bounds.addr[pos];
        let end = self.region_end(&bounds, pos);
        if b & Self::bit(slot) == 0 {
            return Err(FreeError::DoubleFreeDetected);
        }

        // Absorb a following free region while releasing: claim its slot,
        // pull its boundary down to this region's start, vacate this
        // boundary and clear both bits in one CAS. The surviving boundary
        // keeps the higher slot index, which preserves room for low-end
        // trims below it.
        if pos + 1 < bounds.len {
            let next = bounds.idx[pos + 1] as usize;
            let next_addr = bounds.addr[pos + 1];
            if b & Self::bit(next) == 0 && self.claim(Self::bit(next)) {
                if self.slot(next).load(Ordering::Acquire) == endian::rotate(next_addr) {
                    self.slot(next).store(endian::rotate(start), Ordering::Release);
                    self.slot(slot).store(0, Ordering::Release);
                    self.clear_bits(Self::bit(slot) | Self::bit(next));
                    if pos > 0 {
                        self.dissolve(bounds.idx[pos - 1] as usize, next, start);
                    }
                    return Ok(());
                }
                // The neighbor changed under the claim; roll back and fall
                // through to a plain release.
                self.clear_bits(Self::bit(next));
            }
        }

        // Plain release; a lost race donates the region to the hoard.
        let mask = Self::bit(slot);
        let mut b = self.info().load(Ordering::Acquire);
        loop {
            if b & mask == 0 {
                return Err(FreeError::DoubleFreeDetected);
            }
            match self
                .info()
                .compare_exchange(b, b & !mask, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if pos > 0 {
                        self.dissolve(bounds.idx[pos - 1] as usize, slot, start);
                    }
                    return Ok(());
                }
                Err(current) => {
                    b = current;
                    if p == start && b & mask != 0 && state.hoard_push(p, end - start) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// If the region ending at the free boundary `slot` (expected to start
    /// at `addr`, with the region at `prev` before it) is itself free,
    /// vacate `slot` so the two regions merge. Best effort: any
    /// interference simply leaves the two regions for a later pass.
    fn dissolve(self, prev: usize, slot: usize, addr: usize) {
        let b = self.info().load(Ordering::Acquire);
        if b & Self::bit(prev) != 0 || b & Self::bit(slot) != 0 {
            return;
        }
        if !self.claim(Self::bit(slot)) {
            return;
        }
        // Re-check now that the boundary is owned: the neighbor may have
        // been allocated and the boundary itself rewritten in the meantime.
        let unchanged = self.slot(slot).load(Ordering::Acquire) == endian::rotate(addr);
        if unchanged && self.info().load(Ordering::Acquire) & Self::bit(prev) == 0 {
            self.slot(slot).store(0, Ordering::Release);
        }
        self.clear_bits(Self::bit(slot));
    }

    /// Try to extend the region containing `p` to `new_size` bytes by
    /// consuming the following free region. Returns `true` on success.
    pub fn try_grow(self, p: usize, new_size: usize) -> bool {
        let new_size = round_up(new_size);
        let (b, bounds) = self.snapshot();
        let Some(pos) = (0..bounds.len)
            .find(|&pos| bounds.addr[pos] <= p && p < self.region_end(&bounds, pos))
        else {
            return false;
        };
        let slot = bounds.idx[pos] as usize;
        if b & Self::bit(slot) == 0 || pos + 1 >= bounds.len {
            return false;
        }
        let next = bounds.idx[pos + 1] as usize;
        if b & Self::bit(next) != 0 {
            return false;
        }
        let target = p + new_size;
        let next_end = self.region_end(&bounds, pos + 1);
        if next_end < target {
            return false;
        }
        if !self.claim(Self::bit(next)) {
            return false;
        }
        if self.slot(next).load(Ordering::Acquire) != endian::rotate(bounds.addr[pos + 1]) {
            self.clear_bits(Self::bit(next));
            return false;
        }
        if target == next_end {
            self.slot(next).store(0, Ordering::Release);
        } else {
            self.slot(next)
                .store(endian::rotate(target), Ordering::Release);
        }
        self.clear_bits(Self::bit(next));
        true
    }

    /// Release a region previously parked in a hoard: its bit is still set
    /// and owned by the caller, so a plain clearing CAS suffices.
    pub(crate) fn release_hoarded(self, p: usize) {
        let (_, bounds) = self.snapshot();
        if let Some(pos) = (0..bounds.len).find(|&pos| bounds.addr[pos] == p) {
            self.clear_bits(Self::bit(bounds.idx[pos] as usize));
        }
    }

    /// Size of the live allocation owning `p`, for reallocation.
    pub fn size_of(self, p: usize) -> Option<usize> {
        if p > self.meta {
            let slot = (p - 1 - self.meta) / WORD;
            let tag = endian::slot_tag(self.slot(slot).load(Ordering::Acquire));
            return (1..=7).contains(&tag).then_some(tag);
        }
        let (b, bounds) = self.snapshot();
        let pos = (0..bounds.len)
            .find(|&pos| bounds.addr[pos] <= p && p < self.region_end(&bounds, pos))?;
        let slot = bounds.idx[pos] as usize;
        (b & Self::bit(slot) != 0).then(|| self.region_end(&bounds, pos) - p)
    }

    /// Claim bits 0→1 with a compare-and-set loop; fails only if one of the
    /// bits is already set.
    fn claim(self, mask: usize) -> bool {
        let mut b = self.info().load(Ordering::Acquire);
        loop {
            if b & mask != 0 {
                return false;
            }
            match self
                .info()
                .compare_exchange(b, b | mask, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => b = current,
            }
        }
    }

    /// Clear owned bits 1→0. No other thread attempts the same transition,
    /// so the loop only ever retries over unrelated traffic.
    fn clear_bits(self, mask: usize) {
        let mut b = self.info().load(Ordering::Acquire);
        loop {
            debug_assert_eq!(b & mask, mask);
            match self
                .info()
                .compare_exchange(b, b & !mask, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => b = current,
            }
        }
    }
}

/// Round a region request up to whole words.
pub fn round_up(n: usize) -> usize {
    (n.max(1) + WORD - 1) & !(WORD - 1)
}
