//! Memory management: physical pages, Sv39 page tables and address spaces

mod address;
mod frame_allocator;
#[cfg(target_arch = "riscv64")]
mod heap_allocator;
mod memory_set;
mod mmu;
mod page_table;

pub use address::{
    round_down, round_up, wellformed, PhysAddr, PhysPageNum, PhysWindow, VirtAddr, VirtPageNum,
};
pub use frame_allocator::{FrameAllocator, FreeList};
pub use memory_set::{MemoryLayout, MemoryManager};
#[cfg(target_arch = "riscv64")]
pub use mmu::Satp;
pub use mmu::{Mmu, SoftMmu, SpaceTag};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};

/// Brings up the kernel heap and the main space of the running kernel.
#[cfg(target_arch = "riscv64")]
pub fn init() -> MemoryManager<Satp> {
    let layout = MemoryLayout::from_linker();
    heap_allocator::init_heap(layout.heap());
    let mm = MemoryManager::new(layout, PhysWindow::IDENTITY, Satp);
    // supervisor code reads and writes user pages directly
    unsafe { riscv::register::sstatus::set_sum() };
    mm
}
