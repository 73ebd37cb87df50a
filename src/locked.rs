//! A mutex-locked [`Heap`] wrapper implementing [`GlobalAlloc`] and the
//! `allocator_api2`/nightly `Allocator` trait, for hosted use as a process's
//! global or local allocator.
//!
//! A thin [`lock_api::Mutex`] shell around the core allocator, translating the
//! fixed `(ptr, Layout)` vocabulary of [`GlobalAlloc`]/`Allocator` into the
//! `(ptr, size, tag)` vocabulary [`Heap`] actually speaks. Every allocation
//! routed through this wrapper is tagged with a single fixed
//! [`TagAllocLock::DEFAULT_TAG`], since neither trait has anywhere to carry
//! a caller-supplied tag; reach for [`Heap`] directly to use per-call tags.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator};

use crate::backing::Backing;
use crate::chunk;
use crate::error::CorruptionHandler;
use crate::heap::{Heap, HeapFlags};
use crate::ptr_utils::nonnull_slice_from_raw_parts;

/// A [`Heap`] behind a [`lock_api::Mutex`], usable as a `#[global_allocator]`.
#[derive(Debug)]
pub struct TagAllocLock<R: lock_api::RawMutex, B: Backing> {
    mutex: lock_api::Mutex<R, Heap<B>>,
}

impl<R: lock_api::RawMutex, B: Backing> TagAllocLock<R, B> {
    /// The tag recorded against every allocation made through the
    /// [`GlobalAlloc`]/`Allocator` impls, which have no tag of their own to
    /// forward.
    pub const DEFAULT_TAG: u32 = 0x5441_4700; // "TAG\0"

    /// Wrap an uninitialized [`Heap`]. Call [`Self::lock`] and
    /// [`Heap::initialize`] before use.
    pub const fn new(heap: Heap<B>) -> Self {
        Self { mutex: lock_api::Mutex::new(heap) }
    }

    /// Construct and initialize in one step.
    pub unsafe fn with_init(
        backing: B,
        corruption_handler: Option<CorruptionHandler<B>>,
        min_expand: usize,
        granularity: usize,
        flags: HeapFlags,
    ) -> Self {
        let mut heap = Heap::new(backing);
        unsafe {
            heap.initialize(corruption_handler, min_expand, granularity, Self::DEFAULT_TAG, flags)
        };
        Self::new(heap)
    }

    /// Lock the mutex and access the inner [`Heap`].
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Heap<B>> {
        self.mutex.lock()
    }

    /// Try to lock the mutex and access the inner [`Heap`].
    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<'_, R, Heap<B>>> {
        self.mutex.try_lock()
    }

    /// Unwrap the inner [`Heap`], consuming the lock.
    pub fn into_inner(self) -> Heap<B> {
        self.mutex.into_inner()
    }
}

unsafe impl<R: lock_api::RawMutex, B: Backing> GlobalAlloc for TagAllocLock<R, B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= chunk::ALIGN {
            self.lock()
                .allocate(layout.size(), Self::DEFAULT_TAG)
                .map_or(core::ptr::null_mut(), |nn| nn.as_ptr())
        } else {
            self.lock()
                .aligned_allocate(layout.align(), layout.size(), Self::DEFAULT_TAG)
                .map_or(core::ptr::null_mut(), |nn| nn.as_ptr())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().free(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        let Some(nn) = NonNull::new(ptr) else { return core::ptr::null_mut() };
        self.lock()
            .reallocate(Some(nn), new_size, Self::DEFAULT_TAG)
            .map_or(core::ptr::null_mut(), |r| r.as_ptr())
    }
}

unsafe impl<R: lock_api::RawMutex, B: Backing> Allocator for TagAllocLock<R, B> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(unsafe { nonnull_slice_from_raw_parts(NonNull::dangling(), 0) });
        }

        let result = if layout.align() <= chunk::ALIGN {
            self.lock().allocate(layout.size(), Self::DEFAULT_TAG)
        } else {
            self.lock()
                .aligned_allocate(layout.align(), layout.size(), Self::DEFAULT_TAG)
                .ok()
        };

        result.map(|nn| unsafe { nonnull_slice_from_raw_parts(nn, layout.size()) }).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.lock().free(Some(ptr));
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        // `Heap::reallocate` performs any copy itself while the lock is
        // held, so there's no separate manual copy step here to release the
        // lock around.
        let allocation = self
            .lock()
            .reallocate(Some(ptr), new_layout.size(), Self::DEFAULT_TAG)
            .ok_or(AllocError)?;

        Ok(nonnull_slice_from_raw_parts(allocation, new_layout.size()))
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let allocation = unsafe { self.grow(ptr, old_layout, new_layout)? };
        unsafe {
            (allocation.as_ptr() as *mut u8)
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }
        Ok(allocation)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                unsafe { self.deallocate(ptr, old_layout) };
            }
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        let allocation = self
            .lock()
            .reallocate(Some(ptr), new_layout.size(), Self::DEFAULT_TAG)
            .ok_or(AllocError)?;

        Ok(nonnull_slice_from_raw_parts(allocation, new_layout.size()))
    }
}

impl<B: Backing> Heap<B> {
    /// Wrap in a [`TagAllocLock`], a mutex-locked wrapper using [`lock_api`].
    pub const fn lock<R: lock_api::RawMutex>(self) -> TagAllocLock<R, B> {
        TagAllocLock::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::test_support::StdBacking;

    #[test]
    fn global_alloc_roundtrip() {
        let lock: TagAllocLock<spin::Mutex<()>, StdBacking> =
            unsafe { TagAllocLock::with_init(StdBacking, None, 64 * 1024, 4096, HeapFlags::NONE) };

        let layout = Layout::from_size_align(128, 8).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&lock, layout) };
        assert!(!ptr.is_null());
        unsafe { GlobalAlloc::dealloc(&lock, ptr, layout) };
    }

    #[test]
    fn global_alloc_aligned() {
        let lock: TagAllocLock<spin::Mutex<()>, StdBacking> =
            unsafe { TagAllocLock::with_init(StdBacking, None, 64 * 1024, 4096, HeapFlags::NONE) };

        let layout = Layout::from_size_align(256, 4096).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&lock, layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 4096, 0);
        unsafe { GlobalAlloc::dealloc(&lock, ptr, layout) };
    }
}
