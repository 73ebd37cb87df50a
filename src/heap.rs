//! C1/C4-C8: the top-level [`Heap`], tying every other module into the
//! public contract (`spec.md` §4, §6).
//!
//! One `struct` holding every piece of allocator state behind a `&mut self`
//! API, with the backing allocator supplied as a generic parameter
//! ([`crate::backing::Backing`]) rather than as separate
//! `allocate_cb`/`free_cb` function pointers.

use core::ptr::{null_mut, NonNull};

use crate::backing::Backing;
use crate::bitfield::BitMap32;
use crate::chunk;
use crate::error::{AlignedAllocError, Corruption, CorruptionHandler};
use crate::node::TreeNode;
use crate::ptr_utils;
use crate::segment::{Segment, SegmentList};
use crate::smallbin::{self, SmallBins};
use crate::span::Span;
use crate::treebin::{self, TreeBins};

#[cfg(feature = "counters")]
use crate::counters::Counters;
#[cfg(feature = "tag-stats")]
use crate::stats::{StatsNode, StatsTree, TagStats};

/// Physical space reserved for a fence-post. Fence-posts only ever encode a
/// one-word logical size (`chunk::write_fence_post`), but the header cast in
/// [`chunk`] always reads/writes all four header words, so a full header's
/// worth of space must be reserved regardless.
const FENCE_SIZE: usize = chunk::HEADER_SIZE;

/// Largest chunk size actually reachable through the small bins, given
/// `chunk::ALIGN`-granularity sizing (only even small-bin indices are ever
/// populated; see `smallbin`'s module docs).
const MAX_SMALL_CHUNK_SIZE_ALIGNED: usize = {
    let max = smallbin::MAX_SMALL_CHUNK_SIZE;
    max - (max % chunk::ALIGN)
};

/// `spec.md`'s `MAX_SMALL_REQUEST`: the largest caller-requested size still
/// serviceable from the small bins.
pub const MAX_SMALL_REQUEST: usize = MAX_SMALL_CHUNK_SIZE_ALIGNED - chunk::HEADER_SIZE;

/// `spec.md`'s `MIN_REQUEST`: the largest caller-requested size that still
/// maps onto exactly `chunk::MIN_CHUNK_SIZE`.
pub const MIN_REQUEST: usize = chunk::MIN_CHUNK_SIZE - chunk::HEADER_SIZE;

/// An upper bound on any single request, chosen so that
/// `size + chunk::HEADER_SIZE + chunk::ALIGN` never overflows `usize`.
pub const MAX_REQUEST: usize = (isize::MAX as usize) - chunk::ALIGN * 4;

/// Requests at or above this size bypass the bin system entirely and are
/// backed by their own dedicated segment (`spec.md` §4.4).
pub const DEFAULT_DIRECT_ALLOCATION_THRESHOLD: usize = 256 * 1024;

/// Default number of `free` calls between `release_unused_segments` scans.
pub const DEFAULT_RELEASE_CHECK_INTERVAL: usize = 4000;

/// Smallest chunk size the small bins are capable of representing; the
/// floor for `min_expand`/`granularity`.
pub const DEFAULT_MIN_EXPAND: usize = 64 * 1024;
pub const DEFAULT_GRANULARITY: usize = chunk::ALIGN * 4096;

/// Runtime configuration flags (`spec.md` §6 `Initialize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFlags(u32);

impl HeapFlags {
    pub const NONE: Self = Self(0);
    /// Maintain the per-tag statistics side table ([`crate::stats`]).
    pub const COLLECT_TAG_STATISTICS: Self = Self(1 << 0);
    /// Forbid `release_unused_segments` from returning partial segments even
    /// when the backing allocator would support it.
    pub const NO_PARTIAL_FREES: Self = Self(1 << 1);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for HeapFlags {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for HeapFlags {
    fn default() -> Self {
        Self::NONE
    }
}

/// Where a free region currently lives, used while resolving consolidation
/// during `free` and in-place growth during `reallocate`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Home {
    Top,
    Dv,
    Bin,
}

/// The dlmalloc-family heap described by `spec.md`: boundary-tagged chunks,
/// small bins, tree bins, a top wilderness chunk, a designated-victim
/// fast-path cache, a segment list, and (optionally) per-tag statistics.
///
/// # Safety / pinning
/// Once [`Heap::initialize`] has been called, `self` must never move: the
/// XOR footer key is derived from the heap's own address
/// (`previous_footer = heap_address ^ tag`, `spec.md` §4.1), and the first
/// segment/statistics-node records live inline in `self` and are linked to
/// by pointer from the structures they seed.
pub struct Heap<B: Backing> {
    backing: B,
    corruption_handler: Option<CorruptionHandler<B>>,
    flags: HeapFlags,

    min_expand: usize,
    granularity: usize,
    footprint_limit: usize,
    direct_allocation_threshold: usize,
    release_check_interval: usize,
    release_check_counter: usize,

    /// `heap_address`, captured once at `initialize` time (see pinning note
    /// above), XORed with a tag to produce each chunk's footer key.
    identity: usize,
    stats_tag: u32,

    small_bins: SmallBins,
    small_map: BitMap32,
    tree_bins: TreeBins,
    tree_map: BitMap32,

    top: *mut u8,
    top_size: usize,
    top_segment: *mut Segment,

    dv: *mut u8,
    dv_size: usize,

    segments: SegmentList,
    first_segment: Segment,
    previous_expansion_size: usize,
    footprint: usize,

    /// Sum of every byte reachable via a small bin, a tree bin, the top, or
    /// the designated victim (`spec.md` §8 "`free_list_size` equals...").
    free_list_size: usize,
    failed_allocations: usize,

    #[cfg(feature = "tag-stats")]
    stats: StatsTree,
    #[cfg(feature = "tag-stats")]
    first_stats_node: StatsNode,

    #[cfg(feature = "counters")]
    counters: Counters,

    initialized: bool,
    destroyed: bool,
}

// SAFETY: a `Heap` contains only raw pointers into memory it exclusively
// owns (or into itself); it carries no thread-affine state.
unsafe impl<B: Backing + Send> Send for Heap<B> {}

impl<B: Backing> core::fmt::Debug for Heap<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("backing", &self.backing)
            .field("top_size", &self.top_size)
            .field("dv_size", &self.dv_size)
            .field("free_list_size", &self.free_list_size)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl<B: Backing> Heap<B> {
    /// Construct an uninitialized heap. Call [`Heap::initialize`] before use.
    pub const fn new(backing: B) -> Self {
        Self {
            backing,
            corruption_handler: None,
            flags: HeapFlags::NONE,
            min_expand: DEFAULT_MIN_EXPAND,
            granularity: DEFAULT_GRANULARITY,
            footprint_limit: usize::MAX,
            direct_allocation_threshold: DEFAULT_DIRECT_ALLOCATION_THRESHOLD,
            release_check_interval: DEFAULT_RELEASE_CHECK_INTERVAL,
            release_check_counter: DEFAULT_RELEASE_CHECK_INTERVAL,
            identity: 0,
            stats_tag: u32::MAX - 2,
            small_bins: SmallBins::new(),
            small_map: BitMap32::new(),
            tree_bins: TreeBins::new(),
            tree_map: BitMap32::new(),
            top: null_mut(),
            top_size: 0,
            top_segment: null_mut(),
            dv: null_mut(),
            dv_size: 0,
            segments: SegmentList::new(),
            first_segment: Segment::new(Span::empty(), false, false),
            previous_expansion_size: 0,
            footprint: 0,
            free_list_size: 0,
            failed_allocations: 0,
            #[cfg(feature = "tag-stats")]
            stats: StatsTree::new(),
            #[cfg(feature = "tag-stats")]
            first_stats_node: StatsNode::EMPTY,
            #[cfg(feature = "counters")]
            counters: Counters::new(),
            initialized: false,
            destroyed: false,
        }
    }

    /// `spec.md` §6 `Initialize(heap, allocate_cb, free_cb, corruption_cb,
    /// min_expand, granularity, tag, flags)`. `allocate_cb`/`free_cb` are
    /// supplied at construction time via the `B: Backing` generic rather
    /// than as separate function pointers (see [`DESIGN.md`'s grounding
    /// ledger](../DESIGN.md) for the rationale).
    ///
    /// # Safety
    /// `self` must not move for the remainder of its lifetime after this
    /// call (see the struct-level pinning note).
    pub unsafe fn initialize(
        &mut self,
        corruption_handler: Option<CorruptionHandler<B>>,
        min_expand: usize,
        granularity: usize,
        stats_tag: u32,
        flags: HeapFlags,
    ) {
        debug_assert!(!self.initialized, "Heap::initialize called twice");
        self.corruption_handler = corruption_handler;
        self.flags = flags;
        self.min_expand = min_expand.max(chunk::MIN_CHUNK_SIZE);
        self.granularity = granularity.max(chunk::ALIGN);
        self.stats_tag = stats_tag;
        self.identity = self as *mut Self as usize;

        self.small_bins.init();
        self.tree_bins.init();

        #[cfg(feature = "tag-stats")]
        if flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            let node: *mut StatsNode = &mut self.first_stats_node;
            StatsNode::init(node, stats_tag);
            self.stats.insert(node);
        }
    }

    /// `spec.md` §6 `Destroy(heap)`. Frees every owned (non-external)
    /// segment; detects re-destroy.
    pub fn destroy(&mut self) {
        if self.destroyed {
            self.report_corruption(Corruption::DoubleDestroy, None);
            return;
        }
        self.destroyed = true;

        let mut cur = self.segments.head;
        while !cur.is_null() {
            let (next, base, size, external) = unsafe {
                let seg = &*cur;
                (seg.next, seg.span.base(), seg.span.size(), seg.external)
            };
            if !external {
                if let Some(nn) = NonNull::new(base) {
                    unsafe { self.backing.free(nn, size) };
                }
            }
            cur = next;
        }

        self.segments.head = null_mut();
        self.top = null_mut();
        self.top_size = 0;
        self.top_segment = null_mut();
        self.dv = null_mut();
        self.dv_size = 0;
        self.free_list_size = 0;
    }

    /// Donate caller-owned memory directly, without going through the
    /// backing allocator. The heap will never call `Backing::free` on it.
    ///
    /// # Safety
    /// `span` must describe memory the caller exclusively owns for the
    /// lifetime of the heap, aligned to [`chunk::ALIGN`].
    pub unsafe fn claim(&mut self, span: Span) -> bool {
        let Some((base, acme)) = span.get_base_acme() else { return false };
        if !ptr_utils::is_aligned_to(base, chunk::ALIGN) {
            return false;
        }
        let raw_size = acme as usize - base as usize;
        if raw_size < self.min_expand.max(chunk::MIN_CHUNK_SIZE + FENCE_SIZE * 2) {
            return false;
        }
        unsafe { self.absorb_new_region(base, raw_size, true) };
        true
    }

    /// `spec.md` §6 `Allocate(heap, size, tag) -> pointer or null`.
    pub fn allocate(&mut self, size: usize, tag: u32) -> Option<NonNull<u8>> {
        if self.destroyed {
            return None;
        }
        if !chunk::is_valid_tag(tag) {
            self.report_corruption(Corruption::CorruptStructures, None);
            return None;
        }
        if size >= MAX_REQUEST {
            self.failed_allocations += 1;
            #[cfg(feature = "counters")]
            self.counters.account_failed_allocation();
            return None;
        }

        let need = required_chunk_size(size);

        if let Some(p) = self.try_fulfill(need, size, tag) {
            return Some(p);
        }

        match unsafe { self.expand_and_allocate(need, size, tag) } {
            Some(p) => Some(p),
            None => {
                self.failed_allocations += 1;
                #[cfg(feature = "counters")]
                self.counters.account_failed_allocation();
                None
            }
        }
    }

    /// `spec.md` §6 `Free(heap, ptr)`.
    pub fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        let c = unsafe { chunk::chunk_from_payload(ptr.as_ptr()) };

        let tag = unsafe { chunk::tag_of(c) };
        if tag == chunk::FREE_MAGIC || unsafe { !chunk::is_current_in_use(c) } {
            self.report_corruption(Corruption::DoubleFree, Some(ptr));
            return;
        }

        let size = unsafe { chunk::chunk_size(c) };
        let footer_key = self.footer_key(tag);
        if !unsafe { chunk::decode_footer(c.add(size), footer_key) } {
            self.report_corruption(Corruption::BufferOverrun, Some(ptr));
            return;
        }

        self.record_free(tag, size);
        #[cfg(feature = "counters")]
        self.counters.account_dealloc(size);

        if unsafe { chunk::is_direct(c) } {
            self.free_direct(c, size);
            return;
        }

        unsafe { chunk::set_tag(c, chunk::FREE_MAGIC) };
        self.free_list_size += size;

        let prev_in_use = unsafe { chunk::is_previous_in_use(c) };
        let mut base = c;
        let mut merged = size;
        let mut came_from_dv = false;

        if !prev_in_use {
            let prev = unsafe { chunk::previous_chunk(c) };
            let prev_size = unsafe { chunk::chunk_size(prev) };
            if prev == self.dv {
                came_from_dv = true;
            } else if !unsafe { self.unlink_free_chunk(prev, prev_size) } {
                self.report_corruption(Corruption::CorruptStructures, unsafe {
                    NonNull::new(chunk::payload(prev))
                });
                return;
            }
            base = prev;
            merged += prev_size;
        }

        let base_prev_in_use = unsafe { chunk::is_previous_in_use(base) };
        // Absorbing a free left neighbor can only move `base` downward; the
        // right boundary of the freed region is always `c`'s own successor.
        let right = unsafe { chunk::next_chunk(c) };

        if right == self.top {
            unsafe {
                chunk::set_free_and_size(base, merged + self.top_size, base_prev_in_use);
                chunk::write_free_footer(base, merged + self.top_size);
            }
            self.top = base;
            self.top_size += merged;
            if came_from_dv {
                self.dv = null_mut();
                self.dv_size = 0;
            }
            self.maybe_trim_top();
            self.decrement_release_check();
            return;
        }

        if right == self.dv && !self.dv.is_null() {
            unsafe {
                chunk::set_free_and_size(base, merged + self.dv_size, base_prev_in_use);
                chunk::write_free_footer(base, merged + self.dv_size);
            }
            self.dv = base;
            self.dv_size += merged;
            self.decrement_release_check();
            return;
        }

        let right_free = unsafe { !chunk::is_current_in_use(right) };
        if right_free {
            let right_size = unsafe { chunk::chunk_size(right) };
            if !unsafe { self.unlink_free_chunk(right, right_size) } {
                self.report_corruption(Corruption::CorruptStructures, unsafe {
                    NonNull::new(chunk::payload(right))
                });
                return;
            }
            merged += right_size;
        } else {
            unsafe { chunk::clear_previous_in_use_bit(right) };
        }

        unsafe {
            chunk::set_free_and_size(base, merged, base_prev_in_use);
            chunk::write_free_footer(base, merged);
        }

        if came_from_dv {
            self.dv = base;
            self.dv_size = merged;
        } else {
            unsafe { self.bin_insert_raw(base, merged) };
        }

        self.decrement_release_check();
    }

    /// `spec.md` §6 `Reallocate(heap, ptr, new_size, tag) -> pointer or
    /// null`. Size 0 frees; a null pointer allocates.
    pub fn reallocate(&mut self, ptr: Option<NonNull<u8>>, new_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else { return self.allocate(new_size, tag) };
        if new_size == 0 {
            self.free(Some(ptr));
            return None;
        }
        if !chunk::is_valid_tag(tag) {
            self.report_corruption(Corruption::CorruptStructures, Some(ptr));
            return None;
        }
        if new_size >= MAX_REQUEST {
            self.failed_allocations += 1;
            return None;
        }

        let c = unsafe { chunk::chunk_from_payload(ptr.as_ptr()) };
        let old_size = unsafe { chunk::chunk_size(c) };
        let old_tag = unsafe { chunk::tag_of(c) };
        let footer_key = self.footer_key(old_tag);
        if !unsafe { chunk::decode_footer(c.add(old_size), footer_key) } {
            self.report_corruption(Corruption::BufferOverrun, Some(ptr));
            return None;
        }

        let need = required_chunk_size(new_size);

        if unsafe { chunk::is_direct(c) } {
            return self.reallocate_direct(c, old_size, old_tag, new_size, need, tag);
        }

        #[cfg(not(feature = "disable-realloc-in-place"))]
        if need <= old_size {
            return Some(self.shrink_in_place(c, old_size, need, old_tag, new_size, tag));
        }

        #[cfg(not(any(feature = "disable-grow-in-place", feature = "disable-realloc-in-place")))]
        if let Some(p) = self.try_grow_in_place(c, old_size, need, old_tag, new_size, tag) {
            return Some(p);
        }

        let new_ptr = self.allocate(new_size, tag)?;
        let copy_len = (old_size - chunk::HEADER_SIZE).min(new_size);
        unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len) };
        self.free(Some(ptr));
        Some(new_ptr)
    }

    /// `spec.md` §6 `AlignedAllocate(heap, out_ptr, alignment, size, tag) ->
    /// status`. Returns the aligned payload pointer (playing the role of the
    /// C signature's `out_ptr` parameter) or the failure reason.
    pub fn aligned_allocate(&mut self, alignment: usize, size: usize, tag: u32) -> Result<NonNull<u8>, AlignedAllocError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(AlignedAllocError::InvalidAlignment);
        }
        let alignment = alignment.max(chunk::MIN_CHUNK_SIZE).next_power_of_two();
        if alignment <= chunk::ALIGN {
            return self.allocate(size, tag).ok_or(AlignedAllocError::InsufficientResources);
        }
        if size >= MAX_REQUEST {
            return Err(AlignedAllocError::InsufficientResources);
        }

        let over_size = size + alignment + chunk::MIN_CHUNK_SIZE;
        let raw = self
            .allocate(over_size, tag)
            .ok_or(AlignedAllocError::InsufficientResources)?;

        let mut c = unsafe { chunk::chunk_from_payload(raw.as_ptr()) };
        let mut csize = unsafe { chunk::chunk_size(c) };

        let aligned_payload = ptr_utils::align_up_by(raw.as_ptr(), alignment - 1);
        if aligned_payload != raw.as_ptr() {
            let aligned_chunk = unsafe { chunk::chunk_from_payload(aligned_payload) };
            let front_size = aligned_chunk as usize - c as usize;
            if front_size >= chunk::MIN_CHUNK_SIZE {
                let tag_here = unsafe { chunk::tag_of(c) };
                let prev_in_use = unsafe { chunk::is_previous_in_use(c) };
                unsafe {
                    chunk::set_free_and_size(c, front_size, prev_in_use);
                    chunk::write_free_footer(c, front_size);
                    let new_size = csize - front_size;
                    chunk::set_in_use(aligned_chunk, new_size, true, tag_here);
                    chunk::mark_in_use_footer(aligned_chunk, new_size, self.footer_key(tag_here));
                    self.bin_insert_raw(c, front_size);
                }
                self.free_list_size += front_size;
                c = aligned_chunk;
                csize -= front_size;
            }
        }

        let need = required_chunk_size(size);
        if csize - need >= chunk::MIN_CHUNK_SIZE {
            let tag_here = unsafe { chunk::tag_of(c) };
            let (issued, rem) = unsafe { self.carve(c, csize, need, tag_here) };
            if let Some((rp, rs)) = rem {
                unsafe { self.bin_insert_raw(rp, rs) };
                self.free_list_size += rs;
            }
            c = issued;
        }

        self.record_resize(tag, over_size, size);
        #[cfg(feature = "counters")]
        self.counters.account_resize(over_size, size);

        Ok(unsafe { NonNull::new_unchecked(chunk::payload(c)) })
    }

    /// `spec.md` §6 `Validate(heap, optional_callback)` / §4.8.
    ///
    /// Returns `true` if no inconsistency was found. A provided `callback`
    /// overrides the heap's own corruption handler for the duration of the
    /// call.
    pub fn validate(&self, callback: Option<CorruptionHandler<B>>) -> bool {
        let mut ok = true;
        let report = |code: Corruption, ptr: Option<NonNull<u8>>| {
            if let Some(cb) = callback.or(self.corruption_handler) {
                cb(self, code, ptr);
            }
        };

        // small bins: every chunk in bin i has size exactly 8*i.
        for bin in 0..smallbin::SMALL_BIN_COUNT {
            if !self.small_map.is_set(bin) {
                continue;
            }
            let expected = smallbin::small_bin_size(bin);
            let sentinel = unsafe { self.small_bins.sentinel_for_validate(bin) };
            for node in unsafe { crate::llist::ListNode::iter(sentinel) } {
                let c = unsafe { chunk::chunk_from_payload(node.cast()) };
                if unsafe { chunk::chunk_size(c) } != expected {
                    ok = false;
                    report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
                }
            }
        }

        // tree bins: every node's computed index matches its stored index.
        for bin in 0..treebin::TREE_BIN_COUNT {
            if !self.tree_map.is_set(bin) {
                continue;
            }
            let root = self.tree_bins.root(bin);
            if root.is_null() {
                continue;
            }
            if !unsafe { self.validate_tree_node(root, bin, &report) } {
                ok = false;
            }
        }

        // no two consecutive free chunks, walked chunk-by-chunk per segment.
        for seg in self.segments.iter() {
            let span = unsafe { (*seg).span };
            let Some((base, acme)) = span.get_base_acme() else { continue };
            let mut c = unsafe { base.add(FENCE_SIZE) };
            let chunk_end = acme.wrapping_sub(FENCE_SIZE);
            let mut prev_free = false;
            while c < chunk_end {
                let cur_free = unsafe { !chunk::is_current_in_use(c) };
                if prev_free && cur_free {
                    ok = false;
                    report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
                }
                let size = unsafe { chunk::chunk_size(c) };
                if size < chunk::HEADER_SIZE {
                    ok = false;
                    report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
                    break;
                }
                c = unsafe { c.add(size) };
                prev_free = cur_free;
            }
        }

        // free_list_size accounting.
        let recomputed = self.recompute_free_list_size();
        if recomputed != self.free_list_size {
            ok = false;
            report(Corruption::CorruptStructures, None);
        }

        // top sits at its segment's tail.
        if !self.top.is_null() && !self.top_segment.is_null() {
            let acme = unsafe { (*self.top_segment).span.acme() };
            let expected = acme as usize - self.top as usize - FENCE_SIZE;
            if expected != self.top_size {
                ok = false;
                report(Corruption::CorruptStructures, None);
            }
        }

        ok
    }

    #[cfg(feature = "tag-stats")]
    pub fn tag_stats(&self, tag: u32) -> Option<TagStats> {
        unsafe { self.stats.find(tag).map(|n| (*n).stats) }
    }

    #[cfg(feature = "counters")]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn free_list_size(&self) -> usize {
        self.free_list_size
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn failed_allocations(&self) -> usize {
        self.failed_allocations
    }

    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.footprint_limit = limit;
    }

    pub fn set_direct_allocation_threshold(&mut self, threshold: usize) {
        self.direct_allocation_threshold = threshold;
    }

    // ---- internal helpers ----------------------------------------------

    #[inline]
    fn footer_key(&self, tag: u32) -> usize {
        self.identity ^ (tag as usize)
    }

    fn report_corruption(&self, code: Corruption, ptr: Option<NonNull<u8>>) {
        if let Some(cb) = self.corruption_handler {
            cb(self, code, ptr);
        }
    }

    #[cfg(feature = "tag-stats")]
    fn record_alloc(&mut self, tag: u32, size: usize) {
        if !self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            return;
        }
        if let Some(node) = self.find_or_create_stats_node(tag) {
            unsafe { (*node).stats.account_alloc(size) };
        }
    }
    #[cfg(not(feature = "tag-stats"))]
    fn record_alloc(&mut self, _tag: u32, _size: usize) {}

    #[cfg(feature = "tag-stats")]
    fn record_free(&mut self, tag: u32, size: usize) {
        if !self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            return;
        }
        if let Some(node) = unsafe { self.stats.find(tag) } {
            unsafe { (*node).stats.account_free(size) };
        }
    }
    #[cfg(not(feature = "tag-stats"))]
    fn record_free(&mut self, _tag: u32, _size: usize) {}

    #[cfg(feature = "tag-stats")]
    fn record_resize(&mut self, tag: u32, old_size: usize, new_size: usize) {
        if !self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            return;
        }
        if let Some(node) = self.find_or_create_stats_node(tag) {
            unsafe { (*node).stats.account_resize(old_size, new_size) };
        }
    }
    #[cfg(not(feature = "tag-stats"))]
    fn record_resize(&mut self, _tag: u32, _old_size: usize, _new_size: usize) {}

    /// Find the statistics node for `tag`, allocating one (under the
    /// pre-inserted statistics tag) if absent. The allocation this performs
    /// recurses into `allocate` -> `record_alloc(self.stats_tag, ...)` ->
    /// this same function, but for `self.stats_tag` the node was already
    /// planted at `initialize` time, so the recursion is bounded to one
    /// level (`spec.md` §9).
    #[cfg(feature = "tag-stats")]
    fn find_or_create_stats_node(&mut self, tag: u32) -> Option<*mut StatsNode> {
        if let Some(n) = unsafe { self.stats.find(tag) } {
            return Some(n);
        }
        let payload = self.allocate(core::mem::size_of::<StatsNode>(), self.stats_tag)?;
        let node: *mut StatsNode = payload.as_ptr().cast();
        unsafe {
            StatsNode::init(node, tag);
            self.stats.insert(node);
        }
        Some(node)
    }

    fn decrement_release_check(&mut self) {
        if self.release_check_counter == 0 {
            self.release_check_counter = self.release_check_interval;
            return;
        }
        self.release_check_counter -= 1;
        if self.release_check_counter == 0 {
            self.release_unused_segments();
            self.release_check_counter = self.release_check_interval;
        }
    }

    /// Place `c` (of `size` bytes) into the appropriate bin. Purely
    /// structural: does not touch `free_list_size`.
    unsafe fn bin_insert_raw(&mut self, c: *mut u8, size: usize) {
        if size < treebin::MIN_TREE_CHUNK_SIZE {
            unsafe { self.small_bins.insert(&mut self.small_map, c, size) };
        } else {
            let bin = treebin::compute_tree_index(size);
            unsafe { self.tree_bins.insert(&mut self.tree_map, c, size, bin) };
        }
    }

    /// Unlink `c` (of `size` bytes) from whichever bin holds it. Purely
    /// structural: does not touch `free_list_size`. Returns `false` on
    /// detected corruption.
    #[must_use]
    unsafe fn unlink_free_chunk(&mut self, c: *mut u8, size: usize) -> bool {
        if size < treebin::MIN_TREE_CHUNK_SIZE {
            unsafe { self.small_bins.unlink(&mut self.small_map, c, size) }
        } else {
            let node = TreeNode::from_chunk(c);
            unsafe { self.tree_bins.unlink(&mut self.tree_map, node) }
        }
    }

    /// Split `c` (of `csize` free bytes) into an in-use chunk of `need`
    /// bytes plus an optional free remainder. Purely structural: writes
    /// chunk headers but never touches `free_list_size` or any bin/top/dv
    /// bookkeeping — callers decide where the remainder (if any) lives.
    unsafe fn carve(&mut self, c: *mut u8, csize: usize, need: usize, tag: u32) -> (*mut u8, Option<(*mut u8, usize)>) {
        debug_assert!(csize >= need);
        let remainder = csize - need;
        let prev_in_use = unsafe { chunk::is_previous_in_use(c) };

        if remainder >= chunk::MIN_CHUNK_SIZE {
            unsafe {
                chunk::set_in_use(c, need, prev_in_use, tag);
                chunk::mark_in_use_footer(c, need, self.footer_key(tag));
                let rem = c.add(need);
                chunk::set_free_and_size(rem, remainder, true);
                chunk::write_free_footer(rem, remainder);
            }
            (c, Some((unsafe { c.add(need) }, remainder)))
        } else {
            unsafe {
                chunk::set_in_use(c, csize, prev_in_use, tag);
                chunk::mark_in_use_footer(c, csize, self.footer_key(tag));
                let succ = c.add(csize);
                chunk::set_previous_in_use_bit(succ);
            }
            (c, None)
        }
    }

    fn finish_alloc(&mut self, c: *mut u8, tag: u32, req_size: usize) -> NonNull<u8> {
        #[cfg(feature = "counters")]
        self.counters.account_alloc(req_size);
        self.record_alloc(tag, req_size);
        unsafe { NonNull::new_unchecked(chunk::payload(c)) }
    }

    /// Replace the designated victim with `(c, size)`, flushing whatever
    /// was previously there into a bin (structurally: those bytes were
    /// already counted in `free_list_size` via `dv_size`, so the move is
    /// neutral).
    fn set_dv(&mut self, c: *mut u8, size: usize) {
        if !self.dv.is_null() && self.dv_size > 0 {
            unsafe { self.bin_insert_raw(self.dv, self.dv_size) };
        }
        self.dv = c;
        self.dv_size = size;
    }

    /// Steps 1/3/4/5 of `spec.md` §4.4's allocation algorithm: small/tree
    /// bins, then the designated victim, then the top. Does not expand.
    fn try_fulfill(&mut self, need: usize, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        if need <= MAX_SMALL_CHUNK_SIZE_ALIGNED {
            if let Some(p) = self.allocate_small(need, req_size, tag) {
                return Some(p);
            }
        } else if !self.tree_map.is_empty() {
            if let Some(p) = self.allocate_from_tree_large(need, req_size, tag) {
                return Some(p);
            }
        }

        if need <= self.dv_size {
            return Some(self.split_dv(need, req_size, tag));
        }
        if need <= self.top_size {
            return Some(self.split_top(need, req_size, tag));
        }
        None
    }

    fn allocate_small(&mut self, need: usize, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let bin = smallbin::small_bin_index(need);

        if self.small_map.is_set(bin) {
            let c = unsafe { self.small_bins.pop_front(&mut self.small_map, bin) };
            self.free_list_size -= need;
            let (issued, _rem) = unsafe { self.carve(c, need, need, tag) };
            return Some(self.finish_alloc(issued, tag, req_size));
        }

        let larger = self.small_map.scan_from(bin + 1);
        if larger < smallbin::SMALL_BIN_COUNT {
            let c = unsafe { self.small_bins.pop_front(&mut self.small_map, larger) };
            let csize = smallbin::small_bin_size(larger);
            let (issued, rem) = unsafe { self.carve(c, csize, need, tag) };
            self.free_list_size -= need;
            if let Some((rp, rs)) = rem {
                self.set_dv(rp, rs);
            }
            return Some(self.finish_alloc(issued, tag, req_size));
        }

        if !self.tree_map.is_empty() {
            return self.tree_allocate_small(req_size, tag);
        }
        None
    }

    /// `spec.md` §4.2 `tree_allocate_small`.
    fn tree_allocate_small(&mut self, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let bin = self.tree_map.lowest_set();
        if bin >= treebin::TREE_BIN_COUNT {
            return None;
        }
        let node = unsafe { self.tree_bins.find_leftmost(bin) };
        let c = unsafe { TreeNode::to_chunk(node) };
        let csize = unsafe { chunk::chunk_size(c) };
        let need = required_chunk_size(req_size);

        if !unsafe { self.tree_bins.unlink(&mut self.tree_map, node) } {
            self.report_corruption(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
            return None;
        }

        let (issued, rem) = unsafe { self.carve(c, csize, need, tag) };
        self.free_list_size -= csize - rem.map_or(0, |(_, s)| s);
        if let Some((rp, rs)) = rem {
            if rs < treebin::MIN_TREE_CHUNK_SIZE {
                self.set_dv(rp, rs);
            } else {
                unsafe { self.bin_insert_raw(rp, rs) };
            }
        }
        Some(self.finish_alloc(issued, tag, req_size))
    }

    /// `spec.md` §4.3 `tree_allocate_large`.
    fn allocate_from_tree_large(&mut self, need: usize, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let bin = treebin::compute_tree_index(need);
        let node = if self.tree_map.is_set(bin) {
            unsafe { self.tree_bins.find_best_fit(bin, need) }
        } else {
            None
        };
        let node = match node {
            Some(n) => n,
            None => {
                let next_bin = self.tree_map.scan_from(bin + 1);
                if next_bin >= treebin::TREE_BIN_COUNT {
                    return None;
                }
                unsafe { self.tree_bins.find_leftmost(next_bin) }
            }
        };

        let c = unsafe { TreeNode::to_chunk(node) };
        let csize = unsafe { chunk::chunk_size(c) };
        if csize < need {
            return None;
        }
        if !unsafe { self.tree_bins.unlink(&mut self.tree_map, node) } {
            self.report_corruption(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
            return None;
        }

        let (issued, rem) = unsafe { self.carve(c, csize, need, tag) };
        self.free_list_size -= csize - rem.map_or(0, |(_, s)| s);
        if let Some((rp, rs)) = rem {
            unsafe { self.bin_insert_raw(rp, rs) };
        }
        Some(self.finish_alloc(issued, tag, req_size))
    }

    fn split_dv(&mut self, need: usize, req_size: usize, tag: u32) -> NonNull<u8> {
        let c = self.dv;
        let csize = self.dv_size;
        let (issued, rem) = unsafe { self.carve(c, csize, need, tag) };
        self.free_list_size -= csize - rem.map_or(0, |(_, s)| s);
        match rem {
            Some((rp, rs)) => {
                self.dv = rp;
                self.dv_size = rs;
            }
            None => {
                self.dv = null_mut();
                self.dv_size = 0;
            }
        }
        self.finish_alloc(issued, tag, req_size)
    }

    fn split_top(&mut self, need: usize, req_size: usize, tag: u32) -> NonNull<u8> {
        let c = self.top;
        let csize = self.top_size;
        let (issued, rem) = unsafe { self.carve(c, csize, need, tag) };
        self.free_list_size -= csize - rem.map_or(0, |(_, s)| s);
        match rem {
            Some((rp, rs)) => {
                self.top = rp;
                self.top_size = rs;
            }
            None => {
                self.top = null_mut();
                self.top_size = 0;
            }
        }
        self.finish_alloc(issued, tag, req_size)
    }

    /// Establish a fresh top chunk from raw backing memory (never from a
    /// split — those are handled by `carve`/`split_top`). `size` bytes
    /// become newly tracked free capacity.
    unsafe fn establish_top(&mut self, base: *mut u8, size: usize, prev_in_use: bool, segment: *mut Segment) {
        self.top = base;
        self.top_size = size;
        self.top_segment = segment;
        if size > 0 {
            unsafe {
                chunk::set_free_and_size(base, size, prev_in_use);
                chunk::write_free_footer(base, size);
                chunk::write_fence_post(base.add(size), false);
            }
            self.free_list_size += size;
        }
    }

    /// `spec.md` §4.4 `expand_and_allocate`.
    unsafe fn expand_and_allocate(&mut self, need: usize, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        if self.initialized && req_size >= self.direct_allocation_threshold {
            return self.allocate_direct(req_size, tag);
        }

        let min_needed = chunk::align_up(need + FENCE_SIZE * 2 + core::mem::size_of::<Segment>());
        let mut request = min_needed.max(self.min_expand);
        request = request.max(self.previous_expansion_size.saturating_mul(2));
        if self.footprint < self.footprint_limit {
            request = request.min(self.footprint_limit - self.footprint);
        } else {
            request = 0;
        }
        request = chunk::align_up(request.max(min_needed));
        request = round_up_to(request, self.granularity);

        if request < min_needed {
            return None;
        }

        let mut try_size = request;
        loop {
            if let Some(base) = self.backing.alloc(try_size, tag) {
                unsafe { self.absorb_new_region(base.as_ptr(), try_size, false) };
                return self.try_fulfill(need, req_size, tag);
            }
            if try_size <= min_needed {
                return None;
            }
            try_size = round_up_to((try_size / 2).max(min_needed), chunk::ALIGN);
        }
    }

    /// Folds a freshly obtained `[base, base+raw_size)` region into the
    /// segment/top state, per the four cases of `spec.md` §4.4's
    /// `expand_and_allocate` disposition rules.
    unsafe fn absorb_new_region(&mut self, base: *mut u8, raw_size: usize, external: bool) {
        self.footprint += raw_size;
        self.previous_expansion_size = raw_size;
        #[cfg(feature = "counters")]
        self.counters.account_segment(raw_size);
        let acme = unsafe { base.add(raw_size) };

        if self.segments.head.is_null() {
            self.init_first_segment(base, acme, external);
            return;
        }

        if !self.top.is_null() && base == unsafe { (*self.top_segment).span.acme() } {
            self.extend_top_segment(acme);
            return;
        }

        if let Some(seg) = unsafe { self.segments.find_starting_at(acme) } {
            self.prepend_region(seg, base);
            return;
        }

        if let Some(seg) = unsafe { self.segments.find_ending_at(base) } {
            self.extend_other_segment(seg, acme);
            return;
        }

        self.add_new_segment(base, acme, external);
    }

    unsafe fn init_first_segment(&mut self, base: *mut u8, acme: *mut u8, external: bool) {
        self.first_segment = Segment::new(Span::new(base, acme), external, false);
        self.segments.head = &mut self.first_segment as *mut Segment;

        unsafe { chunk::write_fence_post(base, true) };
        let chunk_start = unsafe { base.add(FENCE_SIZE) };
        let size = acme as usize - chunk_start as usize - FENCE_SIZE;
        unsafe { self.establish_top(chunk_start, size, true, self.segments.head) };
        self.initialized = true;
    }

    unsafe fn extend_top_segment(&mut self, new_acme: *mut u8) {
        let seg = self.top_segment;
        let base = unsafe { (*seg).span.base() };
        unsafe { (*seg).span = Span::new(base, new_acme) };
        let prev_in_use = unsafe { chunk::is_previous_in_use(self.top) };
        let size = new_acme as usize - self.top as usize - FENCE_SIZE;
        unsafe { self.establish_top(self.top, size, prev_in_use, seg) };
    }

    /// New memory immediately precedes an existing segment's base: widen
    /// that segment downward and register the new space as an ordinary
    /// free region (merging with the segment's first chunk if it is free).
    unsafe fn prepend_region(&mut self, seg: *mut Segment, new_base: *mut u8) {
        let old_base = unsafe { (*seg).span.base() };
        let acme = unsafe { (*seg).span.acme() };
        unsafe { (*seg).span = Span::new(new_base, acme) };

        unsafe { chunk::write_fence_post(new_base, true) };
        let region_base = unsafe { new_base.add(FENCE_SIZE) };
        let region_acme = old_base.wrapping_add(FENCE_SIZE);

        let first_chunk = region_acme;
        let first_is_free = unsafe { !chunk::is_current_in_use(first_chunk) };

        if first_is_free {
            let first_size = unsafe { chunk::chunk_size(first_chunk) };
            if !unsafe { self.unlink_free_chunk(first_chunk, first_size) } {
                self.report_corruption(Corruption::CorruptStructures, None);
                return;
            }
            let merged_size = first_size + (region_acme as usize - region_base as usize);
            unsafe {
                chunk::set_free_and_size(region_base, merged_size, true);
                chunk::write_free_footer(region_base, merged_size);
            }
            self.free_list_size += region_acme as usize - region_base as usize;
            if first_chunk == self.dv {
                self.dv = region_base;
                self.dv_size = merged_size;
            } else if first_chunk == self.top {
                self.top = region_base;
                self.top_size = merged_size;
            } else {
                unsafe { self.bin_insert_raw(region_base, merged_size) };
            }
        } else {
            let size = region_acme as usize - region_base as usize;
            unsafe {
                chunk::set_free_and_size(region_base, size, true);
                chunk::write_free_footer(region_base, size);
                chunk::clear_previous_in_use_bit(first_chunk);
                self.bin_insert_raw(region_base, size);
            }
            self.free_list_size += size;
        }
    }

    /// New memory immediately follows a non-top-hosting segment's acme:
    /// widen it and register the new space, merging with the segment's old
    /// last chunk if that was free (detected via the old high fence-post's
    /// previous-in-use bit, which is always kept accurate).
    unsafe fn extend_other_segment(&mut self, seg: *mut Segment, new_acme: *mut u8) {
        let base = unsafe { (*seg).span.base() };
        let old_acme = unsafe { (*seg).span.acme() };
        unsafe { (*seg).span = Span::new(base, new_acme) };

        let old_fence = old_acme.wrapping_sub(FENCE_SIZE);
        let prev_free = unsafe { !chunk::is_previous_in_use(old_fence) };
        let new_region_end = new_acme.wrapping_sub(FENCE_SIZE);

        if prev_free {
            let prev = unsafe { chunk::previous_chunk(old_fence) };
            let prev_size = unsafe { chunk::chunk_size(prev) };
            if prev == self.dv {
                let merged = new_region_end as usize - prev as usize;
                unsafe {
                    chunk::set_free_and_size(prev, merged, unsafe { chunk::is_previous_in_use(prev) });
                    chunk::write_free_footer(prev, merged);
                    chunk::write_fence_post(new_region_end, false);
                }
                self.dv_size = merged;
                self.free_list_size += new_region_end as usize - old_fence as usize;
                return;
            }
            if !unsafe { self.unlink_free_chunk(prev, prev_size) } {
                self.report_corruption(Corruption::CorruptStructures, None);
                return;
            }
            let merged = new_region_end as usize - prev as usize;
            let prev_in_use = unsafe { chunk::is_previous_in_use(prev) };
            unsafe {
                chunk::set_free_and_size(prev, merged, prev_in_use);
                chunk::write_free_footer(prev, merged);
                chunk::write_fence_post(new_region_end, false);
                self.bin_insert_raw(prev, merged);
            }
            self.free_list_size += new_region_end as usize - old_fence as usize;
        } else {
            let size = new_region_end as usize - old_fence as usize;
            unsafe {
                chunk::set_free_and_size(old_fence, size, true);
                chunk::write_free_footer(old_fence, size);
                chunk::write_fence_post(new_region_end, false);
                self.bin_insert_raw(old_fence, size);
            }
            self.free_list_size += size;
        }
    }

    /// A brand-new, non-contiguous segment: demote the old top (if any)
    /// into an ordinary free chunk and make the new region the top.
    unsafe fn add_new_segment(&mut self, base: *mut u8, acme: *mut u8, external: bool) {
        if !self.top.is_null() && self.top_size > 0 {
            unsafe { self.bin_insert_raw(self.top, self.top_size) };
        }

        let seg_record_size = chunk::align_up(core::mem::size_of::<Segment>());
        let new_fence = acme.wrapping_sub(FENCE_SIZE);
        let seg_record_base = new_fence.wrapping_sub(seg_record_size);

        unsafe { chunk::write_fence_post(base, true) };
        let chunk_start = unsafe { base.add(FENCE_SIZE) };

        let seg: *mut Segment = seg_record_base.cast();
        unsafe { seg.write(Segment::new(Span::new(base, acme), external, false)) };
        unsafe { self.segments.push_front(seg) };

        let size = seg_record_base as usize - chunk_start as usize;
        unsafe { self.establish_top(chunk_start, size, true, seg) };
    }

    fn maybe_trim_top(&mut self) {
        if self.flags.contains(HeapFlags::NO_PARTIAL_FREES) {
            return;
        }
        if self.top.is_null() || self.top_segment.is_null() {
            return;
        }
        if unsafe { (*self.top_segment).external } {
            return;
        }
        if self.top_size <= self.granularity {
            return;
        }
        let excess = self.top_size - self.granularity;
        let trim = (excess / self.granularity) * self.granularity;
        if trim == 0 {
            return;
        }

        let seg = self.top_segment;
        let acme = unsafe { (*seg).span.acme() };
        let trim_base = acme.wrapping_sub(trim);
        let trim_base = crate::ptr_utils::align_down_by(trim_base, self.granularity - 1);
        let actual_trim = acme as usize - trim_base as usize;
        if actual_trim == 0 || actual_trim >= self.top_size {
            return;
        }

        if let Some(nn) = NonNull::new(trim_base) {
            if unsafe { self.backing.free(nn, actual_trim) } {
                unsafe { (*seg).span = Span::new((*seg).span.base(), trim_base) };
                self.top_size -= actual_trim;
                self.footprint -= actual_trim;
                #[cfg(feature = "counters")]
                self.counters.account_segment_released(actual_trim);
                unsafe {
                    chunk::set_free_and_size(self.top, self.top_size, chunk::is_previous_in_use(self.top));
                    chunk::write_free_footer(self.top, self.top_size);
                    chunk::write_fence_post(trim_base, false);
                }
            }
        }
    }

    /// `spec.md` §4.5's "walk segments calling `release_unused_segments`":
    /// releases any segment whose entirety is a single free chunk back to
    /// the backing allocator.
    fn release_unused_segments(&mut self) {
        if self.flags.contains(HeapFlags::NO_PARTIAL_FREES) {
            return;
        }
        let mut cur = self.segments.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            let external = unsafe { (*cur).external };
            let is_top_segment = cur == self.top_segment;
            if !external && !is_top_segment {
                unsafe { self.try_release_segment(cur) };
            }
            cur = next;
        }
    }

    unsafe fn try_release_segment(&mut self, seg: *mut Segment) {
        let base = unsafe { (*seg).span.base() };
        let acme = unsafe { (*seg).span.acme() };
        let chunk_start = unsafe { base.add(FENCE_SIZE) };
        let chunk_end = acme.wrapping_sub(FENCE_SIZE);
        if chunk_start >= chunk_end {
            return;
        }
        if unsafe { chunk::is_current_in_use(chunk_start) } {
            return;
        }
        let size = unsafe { chunk::chunk_size(chunk_start) };
        if chunk_start.wrapping_add(size) != chunk_end {
            return;
        }

        if chunk_start == self.dv {
            // single free chunk filling the whole segment, currently the dv
        } else if !unsafe { self.unlink_free_chunk(chunk_start, size) } {
            self.report_corruption(Corruption::CorruptStructures, None);
            return;
        }

        let Some(nn) = NonNull::new(base) else { return };
        if unsafe { self.backing.free(nn, acme as usize - base as usize) } {
            unsafe { self.segments.remove(seg) };
            self.free_list_size -= size;
            self.footprint -= acme as usize - base as usize;
            #[cfg(feature = "counters")]
            self.counters.account_segment_released(acme as usize - base as usize);
            if chunk_start == self.dv {
                self.dv = null_mut();
                self.dv_size = 0;
            }
        } else if chunk_start != self.dv {
            unsafe { self.bin_insert_raw(chunk_start, size) };
        }
    }

    unsafe fn allocate_direct(&mut self, req_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let chunk_size = chunk::align_up(req_size + chunk::HEADER_SIZE);
        let seg_record_size = chunk::align_up(core::mem::size_of::<Segment>());
        let raw_size = chunk::align_up(FENCE_SIZE * 2 + chunk_size + seg_record_size);

        let base = self.backing.alloc(raw_size, tag)?.as_ptr();
        self.footprint += raw_size;
        #[cfg(feature = "counters")]
        self.counters.account_segment(raw_size);
        let acme = unsafe { base.add(raw_size) };

        unsafe { chunk::write_fence_post(base, true) };
        let c = unsafe { base.add(FENCE_SIZE) };
        unsafe {
            chunk::set_in_use(c, chunk_size, true, tag);
            chunk::set_direct_bit(c);
            chunk::mark_in_use_footer(c, chunk_size, self.footer_key(tag));
        }

        let seg_base = acme.wrapping_sub(FENCE_SIZE).wrapping_sub(seg_record_size);
        let seg: *mut Segment = seg_base.cast();
        unsafe {
            seg.write(Segment::new(Span::new(base, acme), false, true));
            self.segments.push_front(seg);
            chunk::write_fence_post(acme.wrapping_sub(FENCE_SIZE), true);
        }

        Some(self.finish_alloc(c, tag, req_size))
    }

    fn free_direct(&mut self, c: *mut u8, _size: usize) {
        let Some(seg) = (unsafe { self.segments.containing(c) }) else {
            self.report_corruption(Corruption::CorruptStructures, None);
            return;
        };
        let base = unsafe { (*seg).span.base() };
        let acme = unsafe { (*seg).span.acme() };
        let region_size = acme as usize - base as usize;
        let Some(nn) = NonNull::new(base) else { return };
        if unsafe { self.backing.free(nn, region_size) } {
            unsafe { self.segments.remove(seg) };
            self.footprint -= region_size;
            #[cfg(feature = "counters")]
            self.counters.account_segment_released(region_size);
        }
    }

    fn reallocate_direct(
        &mut self,
        c: *mut u8,
        old_size: usize,
        old_tag: u32,
        new_size: usize,
        _need: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        // Directly-allocated (mmap-style) chunks never grow or shrink in
        // place (`spec.md` §4.6).
        let new_ptr = self.allocate(new_size, tag)?;
        let old_ptr = unsafe { chunk::payload(c) };
        let copy_len = (old_size - chunk::HEADER_SIZE).min(new_size);
        unsafe { core::ptr::copy_nonoverlapping(old_ptr, new_ptr.as_ptr(), copy_len) };
        let _ = old_tag;
        self.free(unsafe { NonNull::new(old_ptr) });
        Some(new_ptr)
    }

    #[cfg_attr(feature = "disable-realloc-in-place", allow(dead_code))]
    fn shrink_in_place(
        &mut self,
        c: *mut u8,
        old_size: usize,
        need: usize,
        old_tag: u32,
        new_req_size: usize,
        new_tag: u32,
    ) -> NonNull<u8> {
        let remainder = old_size - need;
        if remainder >= chunk::MIN_CHUNK_SIZE {
            let prev_in_use = unsafe { chunk::is_previous_in_use(c) };
            unsafe {
                chunk::set_in_use(c, need, prev_in_use, new_tag);
                chunk::mark_in_use_footer(c, need, self.footer_key(new_tag));
            }
            let rem = unsafe { c.add(need) };
            let right = unsafe { c.add(old_size) };

            if right == self.top {
                let merged = remainder + self.top_size;
                unsafe {
                    chunk::set_free_and_size(rem, merged, true);
                    chunk::write_free_footer(rem, merged);
                }
                self.top = rem;
                self.top_size = merged;
                self.free_list_size += remainder;
            } else if right == self.dv {
                unsafe {
                    chunk::set_free_and_size(rem, remainder + self.dv_size, true);
                    chunk::write_free_footer(rem, remainder + self.dv_size);
                }
                self.dv = rem;
                self.dv_size += remainder;
            } else {
                let right_free = unsafe { !chunk::is_current_in_use(right) };
                if right_free {
                    let right_size = unsafe { chunk::chunk_size(right) };
                    if unsafe { self.unlink_free_chunk(right, right_size) } {
                        let merged = remainder + right_size;
                        unsafe {
                            chunk::set_free_and_size(rem, merged, true);
                            chunk::write_free_footer(rem, merged);
                            self.bin_insert_raw(rem, merged);
                        }
                        self.free_list_size += remainder;
                    }
                } else {
                    unsafe {
                        chunk::set_free_and_size(rem, remainder, true);
                        chunk::write_free_footer(rem, remainder);
                        chunk::clear_previous_in_use_bit(right);
                        self.bin_insert_raw(rem, remainder);
                    }
                    self.free_list_size += remainder;
                }
            }
        } else {
            unsafe { chunk::set_tag(c, new_tag) };
        }

        self.record_resize(old_tag, old_size - chunk::HEADER_SIZE, new_req_size);
        #[cfg(feature = "counters")]
        self.counters.account_resize(old_size, new_req_size);
        unsafe { NonNull::new_unchecked(chunk::payload(c)) }
    }

    #[cfg_attr(any(feature = "disable-grow-in-place", feature = "disable-realloc-in-place"), allow(dead_code))]
    fn try_grow_in_place(
        &mut self,
        c: *mut u8,
        old_size: usize,
        need: usize,
        old_tag: u32,
        new_req_size: usize,
        new_tag: u32,
    ) -> Option<NonNull<u8>> {
        let right = unsafe { chunk::next_chunk(c) };
        let (right_size, home) = if right == self.top {
            (self.top_size, Home::Top)
        } else if right == self.dv {
            (self.dv_size, Home::Dv)
        } else if unsafe { !chunk::is_current_in_use(right) } {
            (unsafe { chunk::chunk_size(right) }, Home::Bin)
        } else {
            return None;
        };

        if old_size + right_size < need {
            return None;
        }

        match home {
            Home::Bin => {
                if !unsafe { self.unlink_free_chunk(right, right_size) } {
                    self.report_corruption(Corruption::CorruptStructures, None);
                    return None;
                }
            }
            Home::Top | Home::Dv => {}
        }

        let combined = old_size + right_size;
        let prev_in_use = unsafe { chunk::is_previous_in_use(c) };
        let consumed_from_free = if combined - need >= chunk::MIN_CHUNK_SIZE {
            need - old_size
        } else {
            right_size
        };

        let _ = prev_in_use;
        let (issued, rem) = unsafe { self.carve(c, combined, need, new_tag) };

        match (home, rem) {
            (Home::Top, Some((rp, rs))) => {
                self.top = rp;
                self.top_size = rs;
            }
            (Home::Top, None) => {
                self.top = null_mut();
                self.top_size = 0;
            }
            (Home::Dv, Some((rp, rs))) => {
                self.dv = rp;
                self.dv_size = rs;
            }
            (Home::Dv, None) => {
                self.dv = null_mut();
                self.dv_size = 0;
            }
            (Home::Bin, Some((rp, rs))) => unsafe { self.bin_insert_raw(rp, rs) },
            (Home::Bin, None) => {}
        }
        self.free_list_size -= consumed_from_free;

        self.record_resize(old_tag, old_size - chunk::HEADER_SIZE, new_req_size);
        #[cfg(feature = "counters")]
        self.counters.account_resize(old_size, new_req_size);
        Some(unsafe { NonNull::new_unchecked(chunk::payload(issued)) })
    }

    fn recompute_free_list_size(&self) -> usize {
        let mut total = self.top_size + self.dv_size;
        for bin in 0..smallbin::SMALL_BIN_COUNT {
            if !self.small_map.is_set(bin) {
                continue;
            }
            let sentinel = unsafe { self.small_bins.sentinel_for_validate(bin) };
            for node in unsafe { crate::llist::ListNode::iter(sentinel) } {
                let c = unsafe { chunk::chunk_from_payload(node.cast()) };
                total += unsafe { chunk::chunk_size(c) };
            }
        }
        for bin in 0..treebin::TREE_BIN_COUNT {
            let root = self.tree_bins.root(bin);
            if root.is_null() {
                continue;
            }
            total += unsafe { self.sum_tree(root) };
        }
        total
    }

    unsafe fn sum_tree(&self, node: *mut TreeNode) -> usize {
        let mut total = 0usize;
        let mut stack = [null_mut::<TreeNode>(); 64];
        let mut len = 1;
        stack[0] = node;
        while len > 0 {
            len -= 1;
            let t = stack[len];
            let chain_head = t;
            let mut chain_size = 0usize;
            let mut cur = chain_head;
            loop {
                chain_size += unsafe { chunk::chunk_size(TreeNode::to_chunk(cur)) };
                cur = unsafe { (*cur).next };
                if cur == chain_head {
                    break;
                }
            }
            total += chain_size;
            unsafe {
                if !(*t).child[0].is_null() {
                    stack[len] = (*t).child[0];
                    len += 1;
                }
                if !(*t).child[1].is_null() {
                    stack[len] = (*t).child[1];
                    len += 1;
                }
            }
        }
        total
    }

    unsafe fn validate_tree_node(
        &self,
        node: *mut TreeNode,
        bin: u32,
        report: &dyn Fn(Corruption, Option<NonNull<u8>>),
    ) -> bool {
        let c = unsafe { TreeNode::to_chunk(node) };
        let size = unsafe { chunk::chunk_size(c) };
        let mut ok = true;
        if treebin::compute_tree_index(size) != bin {
            ok = false;
            report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(c)) });
        }

        // Same-size chain: exactly `node` (the chain head) may have
        // `parent != null`, and the ring must close back on itself.
        let mut cur = node;
        loop {
            if cur != node && !unsafe { (*cur).parent.is_null() } {
                ok = false;
                let cc = unsafe { TreeNode::to_chunk(cur) };
                report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(cc)) });
            }
            let next = unsafe { (*cur).next };
            if unsafe { (*next).previous } != cur {
                ok = false;
                let cc = unsafe { TreeNode::to_chunk(cur) };
                report(Corruption::CorruptStructures, unsafe { NonNull::new(chunk::payload(cc)) });
                break;
            }
            cur = next;
            if cur == node {
                break;
            }
        }

        unsafe {
            if !(*node).child[0].is_null() {
                if (*(*node).child[0]).parent != node {
                    ok = false;
                    let cc = TreeNode::to_chunk((*node).child[0]);
                    report(Corruption::CorruptStructures, NonNull::new(chunk::payload(cc)));
                }
                if !self.validate_tree_node((*node).child[0], bin, report) {
                    ok = false;
                }
            }
            if !(*node).child[1].is_null() {
                if (*(*node).child[1]).parent != node {
                    ok = false;
                    let cc = TreeNode::to_chunk((*node).child[1]);
                    report(Corruption::CorruptStructures, NonNull::new(chunk::payload(cc)));
                }
                if !self.validate_tree_node((*node).child[1], bin, report) {
                    ok = false;
                }
            }
        }
        ok
    }
}

#[inline]
fn required_chunk_size(size: usize) -> usize {
    chunk::align_up(size + chunk::HEADER_SIZE).max(chunk::MIN_CHUNK_SIZE)
}

#[inline]
fn round_up_to(n: usize, granularity: usize) -> usize {
    if granularity == 0 {
        return n;
    }
    (n + granularity - 1) / granularity * granularity
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread_local;

    use super::*;
    use crate::backing::test_support::StdBacking;

    const STATS_SENTINEL_TAG: u32 = 0x5354_4154; // "STAT"
    const TAG_A: u32 = 0x4141_4141;
    const TAG_B: u32 = 0x4242_4242;

    thread_local! {
        static LAST_CORRUPTION: Cell<Option<Corruption>> = Cell::new(None);
    }

    fn record_corruption(_heap: &Heap<StdBacking>, code: Corruption, _ptr: Option<NonNull<u8>>) {
        LAST_CORRUPTION.with(|c| c.set(Some(code)));
    }

    fn last_corruption() -> Option<Corruption> {
        LAST_CORRUPTION.with(|c| c.get())
    }

    /// Builds a heap over a leaked arena, so tests don't have to juggle the
    /// arena's lifetime alongside the heap's.
    fn new_heap(arena_size: usize, corruption_handler: Option<CorruptionHandler<StdBacking>>) -> Heap<StdBacking> {
        LAST_CORRUPTION.with(|c| c.set(None));
        // Allocated (and deliberately leaked) at `chunk::ALIGN`, exactly what
        // `Heap::claim` requires of donated memory -- a `Vec<u8>`'s layout
        // alignment of 1 wouldn't guarantee that.
        let layout = std::alloc::Layout::from_size_align(arena_size, chunk::ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null());

        let mut heap = Heap::new(StdBacking);
        unsafe {
            heap.initialize(corruption_handler, DEFAULT_MIN_EXPAND, chunk::ALIGN, STATS_SENTINEL_TAG, HeapFlags::COLLECT_TAG_STATISTICS);
            assert!(heap.claim(Span::from_base_size(base, arena_size)));
        }
        heap
    }

    #[test]
    fn single_allocation_then_free() {
        let mut heap = new_heap(64 * 1024, None);

        let ptr = heap.allocate(24, TAG_A).expect("a 24-byte allocation must succeed on a fresh heap");
        assert_eq!(ptr.as_ptr() as usize % chunk::ALIGN, 0, "payload must be chunk::ALIGN-aligned");
        assert!(heap.validate(None));

        #[cfg(feature = "tag-stats")]
        {
            let stats = heap.tag_stats(TAG_A).expect("tag should have a stats entry after allocating");
            assert_eq!(stats.active_count, 1);
            assert_eq!(stats.lifetime_allocation_size, 24);
        }

        heap.free(Some(ptr));
        assert!(heap.validate(None));
        assert!(last_corruption().is_none());

        #[cfg(feature = "tag-stats")]
        {
            let stats = heap.tag_stats(TAG_A).expect("tag's stats entry should survive the free");
            assert_eq!(stats.active_count, 0);
            assert_eq!(stats.active_size, 0);
        }
    }

    #[test]
    fn freeing_many_small_chunks_merges_into_a_tree_bin_chunk_reused_without_growing() {
        let mut heap = new_heap(64 * 1024, None);

        let blocks: Vec<_> = (0..20).map(|_| heap.allocate(32, TAG_A).expect("small allocation should succeed")).collect();
        // Keeps the freed run from merging straight back into `top`.
        let guard = heap.allocate(32, TAG_A).expect("guard allocation should succeed");

        for ptr in blocks {
            heap.free(Some(ptr));
        }
        assert!(heap.validate(None));
        assert!(last_corruption().is_none());

        let footprint_before = heap.footprint();
        let big = heap.allocate(500, TAG_B).expect("a 500-byte allocation should be served from the merged free run");
        assert_eq!(heap.footprint(), footprint_before, "reusing freed memory must not grow the heap's footprint");
        assert!(heap.validate(None));

        heap.free(Some(big));
        heap.free(Some(guard));
        assert!(heap.validate(None));
    }

    #[test]
    fn designated_victim_handoff() {
        let mut heap = new_heap(64 * 1024, None);

        // Carved straight from `top`: leaves a 272-byte chunk once freed,
        // large enough to be tree-bin-resident (>= MIN_TREE_CHUNK_SIZE).
        let p0 = heap.allocate(240, TAG_A).expect("240-byte allocation should succeed");
        // Keeps `p0`'s freed chunk from coalescing straight back into `top`.
        let guard = heap.allocate(8, TAG_A).expect("guard allocation should succeed");

        heap.free(Some(p0));
        assert!(heap.validate(None));

        // Pulled from the tree bin; its ~192-byte remainder becomes the
        // designated victim rather than going back to a bin.
        let p1 = heap.allocate(48, TAG_A).expect("48-byte allocation should succeed from the freed tree chunk");
        // Served straight from the designated victim established above.
        let p2 = heap.allocate(48, TAG_A).expect("second 48-byte allocation should succeed from the designated victim");

        assert_ne!(p1, p2);
        assert!(heap.validate(None));

        heap.free(Some(guard));
        heap.free(Some(p1));
        heap.free(Some(p2));
        assert!(heap.validate(None));
    }

    #[test]
    fn double_free_is_reported_and_does_not_corrupt_the_heap() {
        let mut heap = new_heap(64 * 1024, Some(record_corruption));

        let ptr = heap.allocate(64, TAG_A).expect("allocation should succeed");
        heap.free(Some(ptr));
        assert!(last_corruption().is_none());

        heap.free(Some(ptr));
        assert_eq!(last_corruption(), Some(Corruption::DoubleFree));
        assert!(heap.validate(None), "a detected double-free must not leave the heap inconsistent");
    }

    #[test]
    fn buffer_overrun_is_detected_on_free() {
        let mut heap = new_heap(64 * 1024, Some(record_corruption));

        let ptr = heap.allocate(16, TAG_A).expect("allocation should succeed");
        // Stomp well past the usable payload capacity of a 16-byte request,
        // corrupting the XOR-encoded footer word in the following chunk's
        // header.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xAA, 16 + MIN_CHUNK_OVERRUN_PROBE);
        }

        heap.free(Some(ptr));
        assert_eq!(last_corruption(), Some(Corruption::BufferOverrun));
    }

    #[test]
    fn aligned_allocate_returns_aligned_pointer_and_frees_cleanly() {
        let mut heap = new_heap(256 * 1024, None);

        let ptr = heap
            .aligned_allocate(4096, 100, TAG_A)
            .expect("a 4096-aligned allocation should succeed against a 256 KiB arena");
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        assert!(heap.validate(None));

        #[cfg(feature = "tag-stats")]
        assert_eq!(heap.tag_stats(TAG_A).unwrap().active_count, 1);

        heap.free(Some(ptr));
        assert!(heap.validate(None));

        #[cfg(feature = "tag-stats")]
        assert_eq!(heap.tag_stats(TAG_A).unwrap().active_size, 0);
    }

    #[test]
    fn invalid_tags_are_rejected() {
        let mut heap = new_heap(64 * 1024, Some(record_corruption));
        assert!(heap.allocate(16, 0).is_none());
        assert_eq!(last_corruption(), Some(Corruption::CorruptStructures));
    }

    /// How far past a request's requested size a write must reach to be
    /// guaranteed to land on the chunk's XOR-encoded footer word, for any
    /// rounding `required_chunk_size` might have applied.
    const MIN_CHUNK_OVERRUN_PROBE: usize = chunk::ALIGN * 8;
}
