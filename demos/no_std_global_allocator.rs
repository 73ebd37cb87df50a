//! A `no_std` global allocator backed by a single fixed-size static arena,
//! claimed up front with [`ErrBacking`] (no further expansion is possible
//! once the arena is exhausted — fitting for e.g. a microcontroller image
//! with no secondary memory source).
#![no_std]
#![no_main]

extern crate alloc;

use core::alloc::Layout;
use core::panic::PanicInfo;

use alloc::{alloc::alloc, vec::Vec};

use tagalloc::{ErrBacking, Heap, HeapFlags, Span, TagAllocLock};

static mut ARENA: [u8; 10_000] = [0; 10_000];

#[global_allocator]
static TAGALLOC: TagAllocLock<spin::Mutex<()>, ErrBacking> =
    TagAllocLock::new(Heap::new(ErrBacking));

#[no_mangle]
pub extern "C" fn main() -> isize {
    unsafe {
        let arena = Span::from_base_size(core::ptr::addr_of_mut!(ARENA).cast(), ARENA.len());
        let mut heap = TAGALLOC.lock();
        heap.initialize(None, ARENA.len(), core::mem::size_of::<usize>() * 2, 0x4e4f_5300, HeapFlags::NONE);
        assert!(heap.claim(arena));
    }

    let mut vec = Vec::with_capacity(100);
    vec.extend(0..300usize);
    vec.truncate(100);
    vec.shrink_to_fit();

    unsafe {
        let layout = Layout::from_size_align(1000, 1).unwrap();
        let ptr = alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0x2b, 1000);
            alloc::alloc::dealloc(ptr, layout);
        }
    }

    drop(vec);
    0
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}
