//! Direct, unlocked use of [`Heap`] (no global allocator, no mutex): tagged
//! allocations, live per-tag statistics, and a [`Heap::validate`] pass.
//!
//! Run with:
//! `cargo run --example system`

use std::alloc::System;

use tagalloc::{GlobalAllocBacking, Heap, HeapFlags};

const STATS_SENTINEL_TAG: u32 = 0x5354_4154; // "STAT"
const TEXTURE_TAG: u32 = 0x5445_5800; // "TEX\0"
const AUDIO_TAG: u32 = 0x4155_4400; // "AUD\0"

fn main() {
    let mut heap = Heap::new(GlobalAllocBacking::new(System));
    unsafe {
        heap.initialize(None, 64 * 1024, 4 * 1024, STATS_SENTINEL_TAG, HeapFlags::COLLECT_TAG_STATISTICS);
    }

    eprint!("Allocating under two tags... ");
    let textures: Vec<_> = (0..16).filter_map(|_| heap.allocate(4096, TEXTURE_TAG)).collect();
    let audio_clip = heap.allocate(65536, AUDIO_TAG);
    eprintln!("Done!");

    eprintln!("Texture tag stats: {:?}", heap.tag_stats(TEXTURE_TAG));
    eprintln!("Audio tag stats:   {:?}", heap.tag_stats(AUDIO_TAG));

    assert!(heap.validate(None), "heap failed self-validation");

    eprint!("Freeing the textures... ");
    for ptr in textures {
        heap.free(Some(ptr));
    }
    eprintln!("Done!");

    eprintln!("Texture tag stats after freeing: {:?}", heap.tag_stats(TEXTURE_TAG));

    heap.free(audio_clip);
    assert!(heap.validate(None), "heap failed self-validation");

    eprintln!("footprint: {} bytes, free_list_size: {} bytes", heap.footprint(), heap.free_list_size());
}
