//! Showcases using [`TagAllocLock`] through the
//! [`Allocator`](allocator_api2::alloc::Allocator) API, so a single heap can
//! back containers without becoming the process-wide global allocator.
//!
//! Run with:
//! `cargo run --example allocator_api`

use std::alloc::System;

use allocator_api2::vec::Vec;

use tagalloc::{GlobalAllocBacking, Heap, HeapFlags, TagAllocLock};

type Backing = GlobalAllocBacking<System>;

fn main() {
    let mut heap = Heap::new(Backing::new(System));
    unsafe {
        heap.initialize(None, 64 * 1024, 4 * 1024, 0x5645_4300, HeapFlags::COLLECT_TAG_STATISTICS);
    }
    let talck: TagAllocLock<spin::Mutex<()>, Backing> = heap.lock();

    // Allocate, grow, shrink, all through the standard `Allocator` trait.
    let mut vec = Vec::with_capacity_in(100, &talck);
    vec.extend(0..300usize);
    vec.truncate(100);
    vec.shrink_to_fit();

    vec.extend(0..50_000usize);

    vec.truncate(50);
    vec.shrink_to_fit();

    drop(vec);

    let stats = talck.lock().tag_stats(TagAllocLock::<spin::Mutex<()>, Backing>::DEFAULT_TAG);
    eprintln!("Tag stats after drop: {stats:?}");
}
