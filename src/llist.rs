//! An intrusive, circular, doubly-linked list node, used to anchor each
//! small bin's chunk ring (`spec.md` §3, §4.2).
//!
//! The list is:
//!  * **Intrusive**, to avoid separate list-node allocation.
//!  * **Circular**, with a homogeneous sentinel node embedded in the bin
//!    array itself, so every bin's ring is non-empty in representation
//!    (the sentinel just isn't a real chunk and is never itself iterated).
//!  * **Doubly linked**, so that `unlink` does not need to search the list.
//!
//! # Safety
//! [`ListNode`]s are referentially dependent on one another and must never be
//! moved once linked. This type is not thread-safe; callers must hold
//! whatever lock guards the heap.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct ListNode {
    pub next: *mut ListNode,
    pub prev: *mut ListNode,
}

impl ListNode {
    /// Initialize `node` as a sentinel: a list of length zero, linked only to itself.
    ///
    /// # Safety
    /// `node` must be valid for writes and properly aligned.
    #[inline]
    pub unsafe fn init_sentinel(node: *mut Self) {
        node.write(Self { prev: node, next: node });
    }

    /// Returns whether the ring anchored at sentinel `node` is empty.
    ///
    /// # Safety
    /// `node` must be a valid, initialized sentinel.
    #[inline]
    pub unsafe fn is_empty(node: *mut Self) -> bool {
        (*node).next == node
    }

    /// Insert `node` immediately after `after` (typically the sentinel, for a LIFO push).
    ///
    /// # Safety
    /// `node` must be writable; `after` must be a valid, linked node.
    #[inline]
    pub unsafe fn insert_after(after: *mut Self, node: *mut Self) {
        let next = (*after).next;
        node.write(Self { prev: after, next });
        (*next).prev = node;
        (*after).next = node;
    }

    /// Remove `node` from whatever list it is linked into.
    ///
    /// # Safety
    /// `node` (and its current neighbors) must be valid and linked.
    /// Returns `false` without modifying anything if the list is structurally
    /// inconsistent (`node.next.prev != node`), signalling corruption to the caller.
    #[inline]
    #[must_use]
    pub unsafe fn try_unlink(node: *mut Self) -> bool {
        let prev = (*node).prev;
        let next = (*node).next;

        if (*next).prev != node || (*prev).next != node {
            return false;
        }

        (*prev).next = next;
        (*next).prev = prev;
        true
    }

    /// Iterate the ring anchored at `sentinel`, excluding the sentinel itself.
    ///
    /// # Safety
    /// The list must remain valid for the duration of iteration.
    #[inline]
    pub unsafe fn iter(sentinel: *mut Self) -> ListIter {
        ListIter { sentinel, cur: (*sentinel).next }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ListIter {
    sentinel: *mut ListNode,
    cur: *mut ListNode,
}

impl Iterator for ListIter {
    type Item = *mut ListNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.sentinel {
            None
        } else {
            let ret = self.cur;
            self.cur = unsafe { (*self.cur).next };
            Some(ret)
        }
    }
}
