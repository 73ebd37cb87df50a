//! Using [`TagAllocLock`] as the process's `#[global_allocator]`, backed by
//! the system allocator via [`GlobalAllocBacking`] so expansion just
//! delegates to `System` rather than requiring a pre-claimed arena.
//!
//! Run with:
//! `cargo run --example global_allocator`

use std::alloc::System;

use tagalloc::{GlobalAllocBacking, Heap, HeapFlags, TagAllocLock};

#[global_allocator]
static TAGALLOC: TagAllocLock<spin::Mutex<()>, GlobalAllocBacking<System>> =
    TagAllocLock::new(Heap::new(GlobalAllocBacking::new(System)));

/// The tag the self-referential statistics tree uses for its own node
/// allocations (`spec.md` §9). Must differ from every real caller tag —
/// here, `TagAllocLock::DEFAULT_TAG`, which every `GlobalAlloc` call is
/// tagged with since that trait has no tag of its own to forward.
const STATS_SENTINEL_TAG: u32 = 0x5354_4154; // "STAT"

/// Allocations made through `TAGALLOC` before this runs still succeed (the
/// backing allocator and defaults from [`Heap::new`] are usable
/// immediately); calling `initialize` explicitly just establishes the
/// heap's own identity for the footer-XOR corruption check (`spec.md`
/// §4.1) and turns on tag-statistics collection.
fn init_tagalloc() {
    unsafe {
        TAGALLOC.lock().initialize(
            None,
            64 * 1024,
            4 * 1024,
            STATS_SENTINEL_TAG,
            HeapFlags::COLLECT_TAG_STATISTICS,
        );
    }
}

fn main() {
    init_tagalloc();

    eprint!("Doing some small allocations... ");
    let mut vec = Vec::with_capacity(100);
    vec.extend(0..300usize);
    vec.truncate(100);
    vec.shrink_to_fit();
    eprintln!("Done!");

    eprint!("Growing past the initial segment, pulling more from the system allocator... ");
    vec.extend(0..1_000_000usize);
    eprintln!("Done!");

    drop(vec);

    let stats = TAGALLOC.lock().tag_stats(
        TagAllocLock::<spin::Mutex<()>, GlobalAllocBacking<System>>::DEFAULT_TAG,
    );
    eprintln!("Tag stats after drop: {stats:?}");
}
