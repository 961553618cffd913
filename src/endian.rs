//! Byte-order probe and address rotation.
//!
//! Slot words in a variable-size block carry a tag in their first memory
//! byte: `0` means "this word is an address", `1..=7` means "this word holds
//! that many payload bytes inline". An address therefore has to be stored so
//! that its first memory byte is zero. On big-endian hosts the first memory
//! byte is the high-order byte of the value, which is already zero for every
//! user-space address, so addresses are stored as-is. On little-endian hosts
//! the first memory byte is the *low*-order byte, so the address is rotated
//! one byte left before storing: the always-zero top byte lands in the tag
//! position and nothing is lost.

use core::sync::atomic::{AtomicU8, Ordering};

/// Cached probe result: 0 = not probed yet, 1 = little-endian, 2 = big.
static BYTE_ORDER: AtomicU8 = AtomicU8::new(0);

/// Whether this host stores the least significant byte first.
///
/// The result is computed once by writing `1` as a 32-bit integer and
/// inspecting its first byte, then cached for the lifetime of the process.
#[inline]
pub fn is_little_endian() -> bool {
    match BYTE_ORDER.load(Ordering::Relaxed) {
        1 => true,
        2 => false,
        _ => {
            let probe = 1u32.to_ne_bytes()[0] == 1;
            BYTE_ORDER.store(if probe { 1 } else { 2 }, Ordering::Relaxed);
            probe
        }
    }
}

/// Encode an address for storage in a slot word.
///
/// After encoding, the first memory byte of the stored word is zero for
/// every address whose top byte is zero (all user-space addresses on the
/// supported targets).
#[inline]
pub fn rotate(addr: usize) -> usize {
    debug_assert!(addr >> (usize::BITS - 8) == 0, "address top byte not free");
    if is_little_endian() {
        addr.rotate_left(8)
    } else {
        addr
    }
}

/// Decode an address previously stored with [`rotate`].
#[inline]
pub fn unrotate(word: usize) -> usize {
    if is_little_endian() {
        word.rotate_right(8)
    } else {
        word
    }
}

/// The tag carried in the first memory byte of a slot word.
///
/// `0` marks an address slot, `1..=7` the length of an inline allocation.
#[inline]
pub fn slot_tag(word: usize) -> usize {
    if is_little_endian() {
        word & 0xff
    } else {
        word >> (usize::BITS - 8)
    }
}

/// Build a slot word tagging `len` inline payload bytes (the payload itself
/// is written through the slot memory, not through this word).
#[inline]
pub fn inline_tag(len: usize) -> usize {
    debug_assert!((1..=7).contains(&len));
    if is_little_endian() {
        len
    } else {
        len << (usize::BITS - 8)
    }
}
