//! virtio-mmio (version 2) transport

use alloc::rc::Rc;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result};

/// VirtIO MMIO magic ("virt" LE).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION_MODERN: u32 = 2;

// VirtIO MMIO register offsets (bytes).
pub const REG_MAGIC: usize = 0x000;
pub const REG_VERSION: usize = 0x004;
pub const REG_DEVICE_ID: usize = 0x008;
pub const REG_DEVICE_FEATURES: usize = 0x010;
pub const REG_DEVICE_FEATURES_SEL: usize = 0x014;
pub const REG_DRIVER_FEATURES: usize = 0x020;
pub const REG_DRIVER_FEATURES_SEL: usize = 0x024;
pub const REG_QUEUE_SEL: usize = 0x030;
pub const REG_QUEUE_NUM_MAX: usize = 0x034;
pub const REG_QUEUE_NUM: usize = 0x038;
pub const REG_QUEUE_READY: usize = 0x044;
pub const REG_QUEUE_NOTIFY: usize = 0x050;
pub const REG_INTERRUPT_STATUS: usize = 0x060;
pub const REG_INTERRUPT_ACK: usize = 0x064;
pub const REG_STATUS: usize = 0x070;
pub const REG_QUEUE_DESC_LOW: usize = 0x080;
pub const REG_QUEUE_DESC_HIGH: usize = 0x084;
pub const REG_QUEUE_DRIVER_LOW: usize = 0x090;
pub const REG_QUEUE_DRIVER_HIGH: usize = 0x094;
pub const REG_QUEUE_DEVICE_LOW: usize = 0x0a0;
pub const REG_QUEUE_DEVICE_HIGH: usize = 0x0a4;
pub const REG_QUEUE_RESET: usize = 0x0c0;
pub const REG_CONFIG_BASE: usize = 0x100;

// Status bits (VirtIO 1.0).
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_FAILED: u32 = 128;

// Interrupt status bits.
pub const INTR_USED_BUFFER: u32 = 1;
pub const INTR_CONFIG_CHANGE: u32 = 2;

// Device-independent feature bits (numbers, not masks).
pub const F_INDIRECT_DESC: u32 = 28;
pub const F_RING_RESET: u32 = 40;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Mask with feature bit `bit` set.
pub const fn feature(bit: u32) -> u64 {
    1 << bit
}

/// 32-bit register access to one device.
pub trait Bus {
    fn read(&self, off: usize) -> u32;
    fn write(&self, off: usize, val: u32);
}

impl<B: Bus + ?Sized> Bus for Rc<B> {
    fn read(&self, off: usize) -> u32 {
        (**self).read(off)
    }

    fn write(&self, off: usize, val: u32) {
        (**self).write(off, val)
    }
}

/// Memory-mapped register window of one virtio-mmio slot.
pub struct MmioBus {
    base: usize,
}

impl MmioBus {
    /// # Safety
    /// `base` must be the mapped register window of a virtio-mmio device and
    /// nothing else may drive it.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl Bus for MmioBus {
    fn read(&self, off: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + off) as *const u32) }
    }

    fn write(&self, off: usize, val: u32) {
        unsafe { ptr::write_volatile((self.base + off) as *mut u32, val) }
    }
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[derive(Debug)]
#[repr(C)]
pub struct VirtqAvail<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; N],
    pub used_event: u16,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

#[derive(Debug)]
#[repr(C)]
pub struct VirtqUsed<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; N],
    pub avail_event: u16,
}

/// Checks the magic, version and device id of the slot.
pub fn probe(bus: &impl Bus, device_id: u32) -> Result<()> {
    if bus.read(REG_MAGIC) != VIRTIO_MMIO_MAGIC {
        return Err(Error::NoDevice);
    }
    if bus.read(REG_VERSION) != VIRTIO_MMIO_VERSION_MODERN {
        return Err(Error::NotSupported);
    }
    if bus.read(REG_DEVICE_ID) != device_id {
        return Err(Error::NoDevice);
    }
    Ok(())
}

pub fn set_status(bus: &impl Bus, bits: u32) {
    bus.write(REG_STATUS, bus.read(REG_STATUS) | bits);
    fence(Ordering::SeqCst);
}

pub fn clear_status(bus: &impl Bus, bits: u32) {
    bus.write(REG_STATUS, bus.read(REG_STATUS) & !bits);
    fence(Ordering::SeqCst);
}

/// Enables every `needed` feature and whatever of `wanted` the device offers,
/// then sets FEATURES_OK. Returns the enabled set.
pub fn negotiate_features(bus: &impl Bus, wanted: u64, needed: u64) -> Result<u64> {
    bus.write(REG_DEVICE_FEATURES_SEL, 0);
    let lo = bus.read(REG_DEVICE_FEATURES) as u64;
    bus.write(REG_DEVICE_FEATURES_SEL, 1);
    let hi = bus.read(REG_DEVICE_FEATURES) as u64;
    let offered = hi << 32 | lo;

    if offered & needed != needed {
        debug!(
            "virtio: missing features {:#x}",
            needed & !offered
        );
        set_status(bus, STATUS_FAILED);
        return Err(Error::NotSupported);
    }
    let enabled = offered & (wanted | needed);
    bus.write(REG_DRIVER_FEATURES_SEL, 0);
    bus.write(REG_DRIVER_FEATURES, enabled as u32);
    bus.write(REG_DRIVER_FEATURES_SEL, 1);
    bus.write(REG_DRIVER_FEATURES, (enabled >> 32) as u32);

    set_status(bus, STATUS_FEATURES_OK);
    if bus.read(REG_STATUS) & STATUS_FEATURES_OK == 0 {
        set_status(bus, STATUS_FAILED);
        return Err(Error::NotSupported);
    }
    Ok(enabled)
}

fn write_addr(bus: &impl Bus, low: usize, high: usize, addr: u64) {
    bus.write(low, addr as u32);
    bus.write(high, (addr >> 32) as u32);
}

/// Hands the rings of queue `qid` to the device. The queue stays disabled
/// until [`enable_virtq`].
pub fn attach_virtq(
    bus: &impl Bus,
    qid: u32,
    len: u16,
    desc: u64,
    used: u64,
    avail: u64,
) -> Result<()> {
    bus.write(REG_QUEUE_SEL, qid);
    fence(Ordering::SeqCst);
    if bus.read(REG_QUEUE_NUM_MAX) < len as u32 {
        return Err(Error::NotSupported);
    }
    bus.write(REG_QUEUE_NUM, len as u32);
    write_addr(bus, REG_QUEUE_DESC_LOW, REG_QUEUE_DESC_HIGH, desc);
    write_addr(bus, REG_QUEUE_DRIVER_LOW, REG_QUEUE_DRIVER_HIGH, avail);
    write_addr(bus, REG_QUEUE_DEVICE_LOW, REG_QUEUE_DEVICE_HIGH, used);
    fence(Ordering::SeqCst);
    Ok(())
}

pub fn enable_virtq(bus: &impl Bus, qid: u32) {
    bus.write(REG_QUEUE_SEL, qid);
    fence(Ordering::SeqCst);
    bus.write(REG_QUEUE_READY, 1);
}

pub fn reset_virtq(bus: &impl Bus, qid: u32) {
    bus.write(REG_QUEUE_SEL, qid);
    fence(Ordering::SeqCst);
    bus.write(REG_QUEUE_RESET, 1);
}

pub fn notify_avail(bus: &impl Bus, qid: u32) {
    fence(Ordering::SeqCst);
    bus.write(REG_QUEUE_NOTIFY, qid);
}

pub fn read_config_u32(bus: &impl Bus, off: usize) -> u32 {
    bus.read(REG_CONFIG_BASE + off)
}

pub fn read_config_u64(bus: &impl Bus, off: usize) -> u64 {
    let lo = read_config_u32(bus, off) as u64;
    let hi = read_config_u32(bus, off + 4) as u64;
    hi << 32 | lo
}
