//! Constants used in the kernel

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;
pub const MEGA_SIZE: usize = 0x20_0000;
pub const GIGA_SIZE: usize = 0x4000_0000;

pub const RAM_START: usize = 0x8000_0000;
pub const RAM_SIZE: usize = 8 * 1024 * 1024;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Smallest heap handed to the kernel heap allocator.
pub const KERNEL_HEAP_MIN: usize = 0x4_0000;

/// User virtual address window `[USER_START_VMA, USER_END_VMA)`.
pub const USER_START_VMA: usize = 0xC000_0000;
pub const USER_END_VMA: usize = 0x1_0000_0000;

pub const NPROC: usize = 16;
pub const PROCESS_IOMAX: usize = 16;
pub const MAX_OPEN_FILES: usize = 16;

#[cfg(feature = "board_qemu")]
pub use self::qemu::*;

#[cfg(feature = "board_qemu")]
mod qemu {
    pub const VIRTIO0_IOBASE: usize = 0x1000_1000;
    pub const VIRTIO_IOBASE_STRIDE: usize = 0x1000;
    pub const VIRTIO0_IRQNO: u32 = 1;
    pub const VIRTIO_SLOTS: usize = 8;
}
