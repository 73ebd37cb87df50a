//! Chunk encoding: the boundary-tagged header shared by every allocation
//! (`spec.md` §3, §4.1).
//!
//! A chunk's header occupies four words at its base (`SPEC_FULL.md`'s
//! resolution of the header-overhead open question):
//!
//! ```text
//! base ->  previous_footer   (size-or-XOR-key, dual interpretation)
//!          head              (size | P | C)
//!          tag               (caller tag, or FREE_MAGIC once freed)
//!          _reserved         (padding to keep the payload 2-word aligned)
//! payload -> ...
//! ```
//!
//! There is no separate footer word: a chunk's footer *is* its successor's
//! `previous_footer` field (the classic boundary-tag trick), which is why
//! free chunks must always be followed by either another chunk or a
//! fence-post.

use core::mem::size_of;

/// Chunks (and the segments that hold them) are aligned to twice a pointer's
/// width, so that the low bits of `head` are always free for flags.
pub const ALIGN: usize = 2 * size_of::<usize>();

/// Number of header words preceding every chunk's payload.
pub const HEADER_WORDS: usize = 4;

/// Bytes occupied by [`HEADER_WORDS`].
pub const HEADER_SIZE: usize = HEADER_WORDS * size_of::<usize>();

/// Bytes needed for a free chunk's intrusive `next`/`previous` list pointers.
pub const FREE_LINK_SIZE: usize = 2 * size_of::<usize>();

/// Smallest chunk size able to hold a header plus the free-chunk link words.
pub const MIN_CHUNK_SIZE: usize = align_up(HEADER_SIZE + FREE_LINK_SIZE);

/// Sentinel tag value written into a chunk's `tag` field on free, distinct
/// from any valid caller tag (`0` and `u32::MAX` are also reserved, see
/// [`is_valid_tag`]).
pub const FREE_MAGIC: u32 = u32::MAX - 1;

/// `previous-in-use`: clear iff the chunk immediately preceding this one
/// (in memory) is free.
pub const P_BIT: usize = 1 << 0;
/// `current-in-use`: clear iff this chunk itself is free.
pub const C_BIT: usize = 1 << 1;
/// The spec's third, otherwise-reserved flag bit (`{P, C, ·}`, `spec.md`
/// §3): marks a chunk as a direct (individually-backed) allocation, whose
/// entire segment is released straight back to the backing allocator on
/// free rather than returned to a bin.
pub const D_BIT: usize = 1 << 2;
const FLAG_BITS: usize = 0b111;

/// Returns whether `tag` is acceptable as a caller-supplied allocation tag.
#[inline]
pub const fn is_valid_tag(tag: u32) -> bool {
    tag != 0 && tag != u32::MAX && tag != FREE_MAGIC
}

#[inline]
pub const fn align_up(n: usize) -> usize {
    (n + (ALIGN - 1)) & !(ALIGN - 1)
}

#[repr(C)]
pub(crate) struct ChunkHeader {
    pub previous_footer: usize,
    pub head: usize,
    pub tag: usize,
    pub _reserved: usize,
}

/// Raw-pointer view over a chunk's header. All operations are `unsafe`
/// because they trust the caller to have a chunk-aligned, validly-typed
/// pointer.
#[inline]
unsafe fn header(c: *mut u8) -> *mut ChunkHeader {
    c.cast()
}

#[inline]
pub unsafe fn payload(c: *mut u8) -> *mut u8 {
    c.add(HEADER_SIZE)
}

#[inline]
pub unsafe fn chunk_from_payload(p: *mut u8) -> *mut u8 {
    p.sub(HEADER_SIZE)
}

#[inline]
pub unsafe fn chunk_size(c: *mut u8) -> usize {
    (*header(c)).head & !FLAG_BITS
}

#[inline]
pub unsafe fn is_current_in_use(c: *mut u8) -> bool {
    (*header(c)).head & C_BIT != 0
}

#[inline]
pub unsafe fn is_previous_in_use(c: *mut u8) -> bool {
    (*header(c)).head & P_BIT != 0
}

#[inline]
pub unsafe fn is_direct(c: *mut u8) -> bool {
    (*header(c)).head & D_BIT != 0
}

#[inline]
pub unsafe fn set_direct_bit(c: *mut u8) {
    (*header(c)).head |= D_BIT;
}

#[inline]
pub unsafe fn next_chunk(c: *mut u8) -> *mut u8 {
    c.add(chunk_size(c))
}

/// Returns the previous chunk. Only valid when `!is_previous_in_use(c)`.
#[inline]
pub unsafe fn previous_chunk(c: *mut u8) -> *mut u8 {
    debug_assert!(!is_previous_in_use(c));
    c.sub((*header(c)).previous_footer)
}

#[inline]
pub unsafe fn tag_of(c: *mut u8) -> u32 {
    (*header(c)).tag as u32
}

#[inline]
pub unsafe fn set_tag(c: *mut u8, tag: u32) {
    (*header(c)).tag = tag as usize;
}

/// Writes `c`'s header as free, with the given size and previous-in-use bit
/// preserved from whatever was already there.
#[inline]
pub unsafe fn set_free_and_size(c: *mut u8, size: usize, previous_in_use: bool) {
    debug_assert_eq!(size & FLAG_BITS, 0);
    (*header(c)).head = size | if previous_in_use { P_BIT } else { 0 };
}

/// Writes `c`'s header as in-use, with the given size, previous-in-use bit,
/// and tag.
#[inline]
pub unsafe fn set_in_use(c: *mut u8, size: usize, previous_in_use: bool, tag: u32) {
    debug_assert_eq!(size & FLAG_BITS, 0);
    (*header(c)).head = size | C_BIT | if previous_in_use { P_BIT } else { 0 };
    (*header(c)).tag = tag as usize;
}

#[inline]
pub unsafe fn set_previous_in_use_bit(c: *mut u8) {
    (*header(c)).head |= P_BIT;
}

#[inline]
pub unsafe fn clear_previous_in_use_bit(c: *mut u8) {
    (*header(c)).head &= !P_BIT;
}

/// Writes the free-chunk footer: the *next* chunk's `previous_footer` field
/// is this chunk's size, so that `previous_chunk` can find it.
#[inline]
pub unsafe fn write_free_footer(c: *mut u8, size: usize) {
    (*header(c.add(size))).previous_footer = size;
}

/// Writes `heap_address XOR heap_tag` into the successor's `previous_footer`
/// slot, so that a later [`decode_footer`] can detect an overrun into it
/// (`spec.md` §4.1).
#[inline]
pub unsafe fn mark_in_use_footer(c: *mut u8, size: usize, footer_key: usize) {
    (*header(c.add(size))).previous_footer = footer_key;
}

/// Recovers the putative footer key written by [`mark_in_use_footer`] for
/// the chunk preceding `c`. Returns `true` if it matches, `false` if the
/// footer has been corrupted (buffer overrun from the chunk below).
#[inline]
pub unsafe fn decode_footer(c: *mut u8, footer_key: usize) -> bool {
    (*header(c)).previous_footer == footer_key
}

/// A two-word in-use fence-post: stops consolidation walks at a segment
/// boundary. Laid out as a minimal chunk header with `C_BIT` set and size
/// equal to a single word, so `chunk_size` + `next_chunk` never walks past it
/// accidentally (callers must recognize fence-posts by segment bounds, not
/// by probing past them).
#[inline]
pub unsafe fn write_fence_post(c: *mut u8, previous_in_use: bool) {
    (*header(c)).head = size_of::<usize>() | C_BIT | if previous_in_use { P_BIT } else { 0 };
    (*header(c)).tag = FREE_MAGIC as usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_chunk_size_is_aligned_and_sufficient() {
        assert_eq!(MIN_CHUNK_SIZE % ALIGN, 0);
        assert!(MIN_CHUNK_SIZE >= HEADER_SIZE + FREE_LINK_SIZE);
    }

    #[test]
    fn header_round_trips_size_and_flags() {
        let mut buf = [0u8; HEADER_SIZE * 2];
        let c = buf.as_mut_ptr();
        unsafe {
            set_in_use(c, HEADER_SIZE, true, 0x41414141);
            assert_eq!(chunk_size(c), HEADER_SIZE);
            assert!(is_current_in_use(c));
            assert!(is_previous_in_use(c));
            assert_eq!(tag_of(c), 0x41414141);

            set_free_and_size(c, HEADER_SIZE, false);
            assert!(!is_current_in_use(c));
            assert!(!is_previous_in_use(c));
            assert_eq!(chunk_size(c), HEADER_SIZE);
        }
    }

    #[test]
    fn footer_key_round_trips() {
        let mut buf = [0u8; HEADER_SIZE * 2];
        let c = buf.as_mut_ptr();
        unsafe {
            let key = 0xDEADBEEFusize;
            mark_in_use_footer(c, HEADER_SIZE, key);
            assert!(decode_footer(c.add(HEADER_SIZE), key));
            assert!(!decode_footer(c.add(HEADER_SIZE), key ^ 1));
        }
    }

    #[test]
    fn valid_tag_excludes_sentinels() {
        assert!(!is_valid_tag(0));
        assert!(!is_valid_tag(u32::MAX));
        assert!(!is_valid_tag(FREE_MAGIC));
        assert!(is_valid_tag(0x41414141));
    }
}
