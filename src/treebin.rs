//! C3: the tree-bin array (`spec.md` §3 "Tree bins", §4.3).
//!
//! 32 digital search tries, each keyed by the high bits of a free chunk's
//! size, holding chunks too large for the small bins. Nodes of identical
//! size are not distinct trie nodes; they're threaded into a circular chain
//! off the chain head (see [`crate::node::TreeNode`]), so the trie itself
//! never has more than one node per distinct size.

use core::ptr::null_mut;

use crate::bitfield::BitMap32;
use crate::node::TreeNode;

pub const TREE_BIN_COUNT: u32 = 32;

/// Smallest size eligible for a tree bin (one above the largest small-bin
/// size, `spec.md` §3).
pub const MIN_TREE_CHUNK_SIZE: usize = 256;

const USIZE_BITS: u32 = usize::BITS;

/// `compute_tree_index` (`spec.md` §4.3): returns the bin index for `size`.
#[inline]
pub fn compute_tree_index(size: usize) -> u32 {
    let x = size >> 8;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        TREE_BIN_COUNT - 1
    } else {
        // `x` fits in 17 bits by construction (<= 0xFFFF).
        let k = 31 - (x as u32).leading_zeros();
        let bin = (k << 1) | ((size >> (k + 7)) & 1) as u32;
        bin.min(TREE_BIN_COUNT - 1)
    }
}

/// The bit position size is shifted left by so that, at trie depth `i`, the
/// discriminating bit lands in the sign position (`spec.md` §4.3
/// `left_shift`).
#[inline]
fn left_shift_for_tree_index(bin: u32) -> u32 {
    if bin == TREE_BIN_COUNT - 1 {
        0
    } else {
        (USIZE_BITS - 1) - ((bin >> 1) + 8 - 2)
    }
}

pub(crate) struct TreeBins {
    roots: [*mut TreeNode; TREE_BIN_COUNT as usize],
}

impl TreeBins {
    pub const fn new() -> Self {
        Self { roots: [null_mut(); TREE_BIN_COUNT as usize] }
    }

    pub fn init(&mut self) {
        self.roots = [null_mut(); TREE_BIN_COUNT as usize];
    }

    #[inline]
    pub fn root(&self, bin: u32) -> *mut TreeNode {
        self.roots[bin as usize]
    }

    /// Insert chunk `c` (size `size`) into the trie. `bin` must equal
    /// `compute_tree_index(size)`.
    ///
    /// # Safety
    /// `c`'s payload must be writable for the tree-node fields
    /// ([`MIN_TREE_CHUNK_SIZE`] guarantees this).
    pub unsafe fn insert(&mut self, avail: &mut BitMap32, c: *mut u8, size: usize, bin: u32) {
        let x = TreeNode::from_chunk(c);
        (*x).index = bin;
        (*x).child = [null_mut(); 2];

        if self.roots[bin as usize].is_null() {
            avail.set(bin);
            self.roots[bin as usize] = x;
            (*x).parent = (&mut self.roots[bin as usize]) as *mut *mut TreeNode as *mut TreeNode;
            TreeNode::init_singleton_chain(x);
            return;
        }

        let mut t = self.roots[bin as usize];
        let mut k = size << left_shift_for_tree_index(bin);

        loop {
            if crate::chunk::chunk_size(TreeNode::to_chunk(t)) != size {
                let dir = (k >> (USIZE_BITS - 1)) & 1;
                let child_slot = &mut (*t).child[dir as usize] as *mut *mut TreeNode;
                k <<= 1;
                if !(*child_slot).is_null() {
                    t = *child_slot;
                } else {
                    *child_slot = x;
                    (*x).parent = t;
                    TreeNode::init_singleton_chain(x);
                    return;
                }
            } else {
                TreeNode::splice_into_chain(t, x);
                return;
            }
        }
    }

    /// Unlink `x` from the trie (or its same-size chain). Returns `false`
    /// (corruption) if a back-pointer doesn't point where expected.
    ///
    /// # Safety
    /// `x` must currently be linked into one of `self`'s tries.
    #[must_use]
    pub unsafe fn unlink(&mut self, avail: &mut BitMap32, x: *mut TreeNode) -> bool {
        if !TreeNode::is_chain_head(x) {
            return TreeNode::unlink_from_chain(x);
        }

        // x is the chain head; find a replacement to take its trie slot.
        let replacement = if !TreeNode::is_chain_singleton(x) {
            // hand the trie slot to the next chain member.
            let r = (*x).next;
            if (*r).previous != x {
                return false;
            }
            if !TreeNode::unlink_from_chain(x) {
                return false;
            }
            (*r).child = (*x).child;
            (*r).parent = (*x).parent;
            if !(*r).child[0].is_null() {
                (*(*r).child[0]).parent = r;
            }
            if !(*r).child[1].is_null() {
                (*(*r).child[1]).parent = r;
            }
            r
        } else {
            self.find_leaf_replacement(x)
        };

        let parent = (*x).parent;
        let bin = (*x).index;
        if parent == (&mut self.roots[bin as usize]) as *mut *mut TreeNode as *mut TreeNode {
            self.roots[bin as usize] = replacement;
        } else if (*parent).child[0] == x {
            (*parent).child[0] = replacement;
        } else {
            debug_assert_eq!((*parent).child[1], x);
            (*parent).child[1] = replacement;
        }

        if replacement.is_null() {
            if self.roots[bin as usize].is_null() {
                avail.clear(bin);
            }
        } else if TreeNode::is_chain_singleton(replacement) || !(*replacement).parent.is_null() {
            (*replacement).index = bin;
        }

        true
    }

    /// Descend from `x` (its chain already spliced out) to find the
    /// rightmost-then-leftmost leaf to promote into its trie slot,
    /// detaching the leaf from its parent along the way (`spec.md` §4.3
    /// `unlink_large`).
    unsafe fn find_leaf_replacement(&mut self, x: *mut TreeNode) -> *mut TreeNode {
        let mut r = null_mut();
        let mut rp: *mut *mut TreeNode = core::ptr::null_mut();

        let mut t = x;
        loop {
            let c1 = (*t).child[1];
            if !c1.is_null() {
                r = c1;
                rp = &mut (*t).child[1];
                t = c1;
                continue;
            }
            let c0 = (*t).child[0];
            if !c0.is_null() {
                r = c0;
                rp = &mut (*t).child[0];
                t = c0;
                continue;
            }
            break;
        }

        if !r.is_null() {
            // r is a leaf descendant of x; detach it and give it x's children/parent.
            *rp = null_mut();
            (*r).child = (*x).child;
            (*r).parent = (*x).parent;
            if !(*r).child[0].is_null() {
                (*(*r).child[0]).parent = r;
            }
            if !(*r).child[1].is_null() {
                (*(*r).child[1]).parent = r;
            }
        }

        r
    }

    /// Find the smallest-size fit `>= required_size` in `bin`'s trie,
    /// tracking the best remainder seen along the descent path
    /// (`tree_allocate_large`). Returns the winning node, if any.
    ///
    /// # Safety
    /// `bin` must be a valid, non-empty tree bin index.
    pub unsafe fn find_best_fit(&self, bin: u32, required_size: usize) -> Option<*mut TreeNode> {
        let mut t = self.roots[bin as usize];
        if t.is_null() {
            return None;
        }

        let mut best: *mut TreeNode = null_mut();
        let mut best_size = usize::MAX;
        let mut k = required_size << left_shift_for_tree_index(bin);

        loop {
            let size = crate::chunk::chunk_size(TreeNode::to_chunk(t));
            if size >= required_size && size < best_size {
                best = t;
                best_size = size;
                if size == required_size {
                    return Some(best);
                }
            }

            let dir = (k >> (USIZE_BITS - 1)) & 1;
            let child = (*t).child[dir as usize];
            let next = if !child.is_null() {
                child
            } else {
                (*t).child[1 - dir as usize]
            };

            if next.is_null() {
                break;
            }
            t = next;
            k <<= 1;
        }

        if best.is_null() { None } else { Some(best) }
    }

    /// Find the leftmost (smallest) node in `bin`'s trie; used when no exact
    /// or path-local fit was found and a larger bin must be raided wholesale
    /// (`spec.md` §4.3).
    ///
    /// # Safety
    /// `bin` must be a valid, non-empty tree bin index.
    pub unsafe fn find_leftmost(&self, bin: u32) -> *mut TreeNode {
        let mut t = self.roots[bin as usize];
        debug_assert!(!t.is_null());
        loop {
            let next = if !(*t).child[0].is_null() { (*t).child[0] } else { (*t).child[1] };
            if next.is_null() {
                return t;
            }
            t = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_tree_index_boundaries() {
        assert_eq!(compute_tree_index(0), 0);
        assert_eq!(compute_tree_index(255), 0);
        assert_eq!(compute_tree_index(256), 2);
        assert_eq!(compute_tree_index(usize::MAX), TREE_BIN_COUNT - 1);
    }

    #[test]
    fn compute_tree_index_monotonic_in_size() {
        let mut last = 0;
        for shift in 8..40 {
            let size = 1usize << shift;
            let idx = compute_tree_index(size);
            assert!(idx >= last);
            last = idx;
        }
    }
}
