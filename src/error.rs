//! Error and corruption taxonomy.
//!
//! Nullability is the primary allocation-failure channel (`spec.md` §7): public
//! operations return `Option`/`Result` rather than panicking. Structural
//! corruption is instead reported out-of-band through a user-supplied callback,
//! since an operation that has detected corruption cannot always safely unwind.

use core::ptr::NonNull;

/// Classification of a detected heap corruption, delivered via the
/// [`Heap`](crate::heap::Heap)'s corruption callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A linked-list or tree invariant did not hold (e.g. `c.next.previous != c`,
    /// or a tree node's parent/child back-pointer was inconsistent).
    CorruptStructures,
    /// The XOR-encoded footer failed to decode back to the heap's identity;
    /// indicates a write past the end of an allocation.
    BufferOverrun,
    /// A chunk passed to `free` already carries the `FREE_MAGIC` tag sentinel,
    /// or its current-in-use bit is already clear.
    DoubleFree,
    /// `destroy` was called on an already-destroyed heap.
    DoubleDestroy,
}

/// A corruption callback: `(heap, code, related_chunk_or_null)`. Never returns
/// a value; the caller observes the callback's side effects (e.g. logging,
/// aborting the process) out of band.
pub type CorruptionHandler<B> = fn(&crate::heap::Heap<B>, Corruption, Option<NonNull<u8>>);

/// Error returned by [`Heap::aligned_allocate`](crate::heap::Heap::aligned_allocate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignedAllocError {
    /// `alignment` was zero or not a power of two.
    InvalidAlignment,
    /// The allocation could not be satisfied (exhaustion, or an invalid tag).
    InsufficientResources,
}
