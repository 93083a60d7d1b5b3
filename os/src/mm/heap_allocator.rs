//! Kernel heap on the target, carved between the kernel image and the
//! first free-list page.

use buddy_system_allocator::LockedHeap;

use core::ops::Range;

#[global_allocator]
/// heap allocator instance
static HEAP_ALLOCATOR: LockedHeap<32> = LockedHeap::<32>::empty();

/// initiate heap allocator over `heap`
pub fn init_heap(heap: Range<usize>) {
    unsafe {
        HEAP_ALLOCATOR.lock().init(heap.start, heap.end - heap.start);
    }
    debug!("kernel heap: [{:#x}, {:#x})", heap.start, heap.end);
}
