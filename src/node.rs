//! Payload-region overlays for free chunks (`spec.md` §3).
//!
//! When a chunk is free, its payload is reused to store bookkeeping: a small
//! free chunk only needs `next`/`previous` (threading it through its small
//! bin's ring, see [`crate::llist::ListNode`]); a chunk large enough to live
//! in a tree bin additionally needs `child[0]`, `child[1]`, `parent`, and
//! `index`. Both overlays start with the same two words so a tree node can
//! be threaded into a same-size chain with the ordinary list operations.

use core::ptr::NonNull;

/// The payload-overlay of a tree-bin-resident free chunk (`spec.md` §3,
/// "Tree-chunk"). `next`/`previous` thread the same-size chain; only the
/// chain head has `parent` set and is reachable by trie descent.
#[repr(C)]
pub(crate) struct TreeNode {
    pub next: *mut TreeNode,
    pub previous: *mut TreeNode,
    pub child: [*mut TreeNode; 2],
    pub parent: *mut TreeNode,
    pub index: u32,
}

impl TreeNode {
    #[inline]
    pub unsafe fn from_chunk(c: *mut u8) -> *mut TreeNode {
        crate::chunk::payload(c).cast()
    }

    #[inline]
    pub unsafe fn to_chunk(n: *mut TreeNode) -> *mut u8 {
        crate::chunk::chunk_from_payload(n.cast())
    }

    #[inline]
    pub unsafe fn is_chain_head(n: *mut TreeNode) -> bool {
        !(*n).parent.is_null()
    }

    /// Whether `n` is the sole member of its same-size chain.
    #[inline]
    pub unsafe fn is_chain_singleton(n: *mut TreeNode) -> bool {
        (*n).next == n
    }

    #[inline]
    pub unsafe fn init_singleton_chain(n: *mut TreeNode) {
        (*n).next = n;
        (*n).previous = n;
    }

    /// Splice `n` into the same-size ring anchored at `head`, as a non-head
    /// member (so `n.parent` stays null).
    #[inline]
    pub unsafe fn splice_into_chain(head: *mut TreeNode, n: *mut TreeNode) {
        let next = (*head).next;
        (*n).previous = head;
        (*n).next = next;
        (*next).previous = n;
        (*head).next = n;
        (*n).parent = core::ptr::null_mut();
        (*n).child = [core::ptr::null_mut(); 2];
    }

    /// Remove `n` from its same-size ring. `n` must not be the chain head.
    /// Returns `false` (and leaves the structure untouched) if the ring
    /// pointers are inconsistent, signalling corruption to the caller.
    #[inline]
    #[must_use]
    pub unsafe fn unlink_from_chain(n: *mut TreeNode) -> bool {
        let next = (*n).next;
        let previous = (*n).previous;
        if (*next).previous != n || (*previous).next != n {
            return false;
        }
        (*previous).next = next;
        (*next).previous = previous;
        true
    }
}

/// A non-null, typed handle over a [`TreeNode`]'s chunk pointer, used where
/// an `Option<NonNull<_>>` reads more clearly than a raw pointer.
pub(crate) type NodePtr = NonNull<TreeNode>;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layout_starts_with_list_pair() {
        assert_eq!(core::mem::offset_of!(TreeNode, next), 0);
        assert_eq!(core::mem::offset_of!(TreeNode, previous), size_of::<usize>());
    }
}
