//! C2: the small-bin array (`spec.md` §3 "Small bins", §4.2).
//!
//! 32 circular doubly-linked lists, bin `i` holding only chunks of exact
//! size `i * 8`. Each head is a sentinel [`ListNode`] embedded directly in
//! the bin array (no separate "is this a real chunk" check is needed
//! because the sentinel is never itself visited by [`ListNode::iter`]).

use crate::bitfield::BitMap32;
use crate::chunk;
use crate::llist::ListNode;

pub const SMALL_BIN_COUNT: u32 = 32;

/// `size >> 3`, clamped into range. Chunk sizes are always multiples of
/// [`chunk::ALIGN`] (16 bytes), so only even indices are ever populated in
/// practice; this mirrors the geometry `spec.md` specifies rather than
/// "fixing" the resulting sparsity.
#[inline]
pub fn small_bin_index(size: usize) -> u32 {
    debug_assert!(size < (SMALL_BIN_COUNT as usize) * 8);
    (size >> 3) as u32
}

#[inline]
pub const fn small_bin_size(index: u32) -> usize {
    (index as usize) * 8
}

/// The upper bound (exclusive) on chunk sizes servicable from the small
/// bins; `spec.md`'s `MAX_SMALL_REQUEST` threshold is derived from this by
/// subtracting header overhead.
pub const MAX_SMALL_CHUNK_SIZE: usize = small_bin_size(SMALL_BIN_COUNT - 1);

pub(crate) struct SmallBins {
    sentinels: [ListNode; SMALL_BIN_COUNT as usize],
}

impl SmallBins {
    pub const fn new() -> Self {
        const SENTINEL: ListNode = ListNode { next: core::ptr::null_mut(), prev: core::ptr::null_mut() };
        Self { sentinels: [SENTINEL; SMALL_BIN_COUNT as usize] }
    }

    /// Must be called once before any other operation; sentinels start
    /// self-linked.
    pub fn init(&mut self) {
        for s in &mut self.sentinels {
            unsafe { ListNode::init_sentinel(s as *mut ListNode) };
        }
    }

    #[inline]
    fn sentinel(&mut self, bin: u32) -> *mut ListNode {
        debug_assert!(bin < SMALL_BIN_COUNT);
        &mut self.sentinels[bin as usize] as *mut ListNode
    }

    /// Read-only sentinel access for [`crate::heap::Heap::validate`] and
    /// other diagnostics that only iterate a bin's ring without mutating it.
    #[inline]
    pub fn sentinel_for_validate(&self, bin: u32) -> *mut ListNode {
        debug_assert!(bin < SMALL_BIN_COUNT);
        &self.sentinels[bin as usize] as *const ListNode as *mut ListNode
    }

    /// Insert the free chunk `c` (of exact size `size`) at the front of its
    /// bin's ring. Updates `avail` if the bin transitions empty -> non-empty.
    ///
    /// # Safety
    /// `c`'s payload must be writable for two words.
    pub unsafe fn insert(&mut self, avail: &mut BitMap32, c: *mut u8, size: usize) {
        let bin = small_bin_index(size);
        let sentinel = self.sentinel(bin);
        if ListNode::is_empty(sentinel) {
            avail.set(bin);
        }
        ListNode::insert_after(sentinel, chunk::payload(c).cast());
    }

    /// Unlink `c` from the small bin implied by `size`. Returns `false`
    /// (corruption) without modifying bin state if the ring pointers are
    /// inconsistent.
    ///
    /// # Safety
    /// `c` must currently be linked into the bin implied by `size`.
    #[must_use]
    pub unsafe fn unlink(&mut self, avail: &mut BitMap32, c: *mut u8, size: usize) -> bool {
        let bin = small_bin_index(size);
        let node: *mut ListNode = chunk::payload(c).cast();
        if !ListNode::try_unlink(node) {
            return false;
        }
        let sentinel = self.sentinel(bin);
        if ListNode::is_empty(sentinel) {
            avail.clear(bin);
        }
        true
    }

    /// Pop and return the front chunk of `bin`, assumed non-empty.
    ///
    /// # Safety
    /// `bin` must have at least one chunk linked (caller checks `avail`).
    pub unsafe fn pop_front(&mut self, avail: &mut BitMap32, bin: u32) -> *mut u8 {
        let sentinel = self.sentinel(bin);
        debug_assert!(!ListNode::is_empty(sentinel));
        let node = (*sentinel).next;
        let ok = ListNode::try_unlink(node);
        debug_assert!(ok);
        if ListNode::is_empty(sentinel) {
            avail.clear(bin);
        }
        chunk::chunk_from_payload(node.cast())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_index_matches_spec_formula() {
        assert_eq!(small_bin_index(0), 0);
        assert_eq!(small_bin_index(248), 31);
    }

    #[test]
    fn insert_then_pop_round_trips() {
        let mut bins = SmallBins::new();
        bins.init();
        let mut avail = BitMap32::new();

        let mut buf = [0u8; 64];
        let c = buf.as_mut_ptr();
        let size = 64;

        unsafe {
            bins.insert(&mut avail, c, size);
            assert!(avail.is_set(small_bin_index(size)));
            let popped = bins.pop_front(&mut avail, small_bin_index(size));
            assert_eq!(popped, c);
            assert!(!avail.is_set(small_bin_index(size)));
        }
    }

    #[test]
    fn unlink_detects_corruption() {
        let mut bins = SmallBins::new();
        bins.init();
        let mut avail = BitMap32::new();

        let mut buf = [0u8; 64];
        let c = buf.as_mut_ptr();
        unsafe {
            bins.insert(&mut avail, c, 64);
            let node: *mut ListNode = chunk::payload(c).cast();
            (*node).next = core::ptr::null_mut();
            assert!(!bins.unlink(&mut avail, c, 64));
        }
    }
}
