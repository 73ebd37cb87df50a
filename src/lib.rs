//! `tagalloc`: a dlmalloc-family heap allocator with per-tag accounting and
//! corruption detection (`spec.md` §1).
//!
//! Boundary-tagged chunks, segregated small bins and large-size tries, a
//! "top" wilderness chunk, a designated-victim fast path, a segment list
//! that can extend/prepend/trim/release, and an optional red-black-tree
//! side table of per-tag statistics: one `&mut self`-driven state machine,
//! generic over how it obtains and releases backing memory.
//!
//! Start with [`Heap::new`], call [`Heap::initialize`], then either
//! [`Heap::claim`] caller-owned memory or let [`Heap::allocate`] pull
//! segments from the [`Backing`](backing::Backing) implementation supplied
//! at construction. For a `std`/`GlobalAlloc`-backed heap behind a mutex,
//! see [`locked::TagAllocLock`].
#![cfg_attr(not(any(test, feature = "error-scanning-std")), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub(crate) mod bitfield;
pub(crate) mod chunk;
pub(crate) mod llist;
pub(crate) mod node;
pub(crate) mod ptr_utils;
pub(crate) mod smallbin;
pub(crate) mod treebin;

pub mod backing;
pub mod error;
pub mod heap;
pub mod locked;
pub mod segment;
pub mod span;

#[cfg(feature = "counters")]
pub mod counters;
#[cfg(feature = "tag-stats")]
pub mod stats;

pub mod prelude {
    //! Re-exports of the types most callers need.
    pub use crate::backing::{Backing, ErrBacking, GlobalAllocBacking};
    pub use crate::error::{AlignedAllocError, Corruption, CorruptionHandler};
    pub use crate::heap::{Heap, HeapFlags};
    pub use crate::locked::TagAllocLock;
    pub use crate::span::Span;

    #[cfg(feature = "counters")]
    pub use crate::counters::Counters;
    #[cfg(feature = "tag-stats")]
    pub use crate::stats::TagStats;
}

pub use backing::{Backing, ErrBacking, GlobalAllocBacking};
pub use error::{AlignedAllocError, Corruption, CorruptionHandler};
pub use heap::{Heap, HeapFlags};
pub use locked::TagAllocLock;
pub use span::Span;

#[cfg(feature = "counters")]
pub use counters::Counters;
#[cfg(feature = "tag-stats")]
pub use stats::TagStats;
