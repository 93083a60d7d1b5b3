//! virtio block device, one request in flight
//!
//! Every request is a single indirect descriptor pointing at a three-entry
//! table: request header, data buffer, status byte. The caller publishes it,
//! rings the doorbell and sleeps on `used_updated` until the used ring
//! catches up with the available ring. The interrupt handler only
//! acknowledges and broadcasts.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::alloc::Layout;
use core::cell::Cell;
use core::mem::size_of;
use core::ptr::{self, addr_of, addr_of_mut, NonNull};
use core::sync::atomic::{fence, Ordering};

use super::device::{DeviceManager, IsrTable};
use super::virtio::{self, *};
use super::InterruptController;
use crate::arch::IntrGuard;
use crate::error::{Error, Result};
use crate::io::{Io, Ioctl};
use crate::sync::Condition;

pub const VIRTIO_ID_BLOCK: u32 = 2;

// VirtIO block device feature bits (number, *not* mask)
pub const VIRTIO_BLK_F_RO: u32 = 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;

// config space offsets
const CONFIG_CAPACITY: usize = 0x00;
const CONFIG_BLK_SIZE: usize = 0x14;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_S_OK: u8 = 0;

/// Capacity and sector numbers are always in these units.
pub const SECTOR_SIZE: u64 = 512;

const DEFAULT_BLKSZ: u32 = 512;
const QUEUE_ID: u32 = 0;

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct BlkReqHeader {
    pub type_: u32,
    pub reserved: u32,
    pub sector: u64,
}

const DESC_INDIRECT: usize = 0;
const DESC_HEADER: usize = 1;
const DESC_DATA: usize = 2;
const DESC_STATUS: usize = 3;

/// Everything the device reads or writes, in one allocation.
#[repr(C, align(16))]
struct BlkQueue {
    desc: [VirtqDesc; 4],
    avail: VirtqAvail<1>,
    used: VirtqUsed<1>,
    header: BlkReqHeader,
    status: u8,
}

/// Zeroed heap memory shared with the device. Only ever accessed through
/// raw pointers.
struct Dma {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Dma {
    fn zeroed(layout: Layout) -> Self {
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, layout },
            None => handle_alloc_error(layout),
        }
    }

    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

impl Drop for Dma {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub struct VioBlk<B: Bus, C: Condition> {
    bus: B,
    irqno: u32,
    intc: Rc<dyn InterruptController>,
    used_updated: C,
    features: u64,
    readonly: bool,
    blksz: u32,
    /// bytes
    size: u64,
    queue: Dma,
    blkbuf: Dma,
    opened: Cell<bool>,
    pos: Cell<u64>,
}

impl<B: Bus, C: Condition> VioBlk<B, C> {
    const NEEDED: u64 = feature(F_RING_RESET) | feature(F_INDIRECT_DESC);
    const WANTED: u64 = feature(VIRTIO_BLK_F_BLK_SIZE)
        | feature(VIRTIO_BLK_F_TOPOLOGY)
        | feature(VIRTIO_BLK_F_RO);

    /// Initialises the device behind `bus` and leaves it ready but closed.
    pub fn attach(
        bus: B,
        irqno: u32,
        intc: Rc<dyn InterruptController>,
        used_updated: C,
    ) -> Result<Rc<Self>> {
        virtio::probe(&bus, VIRTIO_ID_BLOCK)?;
        bus.write(REG_STATUS, 0);
        set_status(&bus, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        let features = negotiate_features(&bus, Self::WANTED, Self::NEEDED)?;

        let blksz = if features & feature(VIRTIO_BLK_F_BLK_SIZE) != 0 {
            read_config_u32(&bus, CONFIG_BLK_SIZE)
        } else {
            DEFAULT_BLKSZ
        };
        if blksz == 0 || blksz as u64 % SECTOR_SIZE != 0 {
            set_status(&bus, STATUS_FAILED);
            return Err(Error::NotSupported);
        }
        let size = read_config_u64(&bus, CONFIG_CAPACITY) * SECTOR_SIZE;
        let readonly = features & feature(VIRTIO_BLK_F_RO) != 0;
        let blkbuf_layout =
            Layout::from_size_align(blksz as usize, 16).map_err(|_| Error::InvalidArgument)?;

        let dev = Self {
            bus,
            irqno,
            intc,
            used_updated,
            features,
            readonly,
            blksz,
            size,
            queue: Dma::zeroed(Layout::new::<BlkQueue>()),
            blkbuf: Dma::zeroed(blkbuf_layout),
            opened: Cell::new(false),
            pos: Cell::new(0),
        };
        dev.setup_queue()?;
        info!(
            "vioblk: irq {}, {} bytes, block size {}, {}",
            irqno,
            size,
            blksz,
            if readonly { "read-only" } else { "read-write" }
        );
        Ok(Rc::new(dev))
    }

    pub fn blksz(&self) -> u32 {
        self.blksz
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn irqno(&self) -> u32 {
        self.irqno
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    fn vq(&self) -> *mut BlkQueue {
        self.queue.ptr.as_ptr() as *mut BlkQueue
    }

    /// Fills the fixed descriptors, hands the rings over and sets DRIVER_OK.
    fn setup_queue(&self) -> Result<()> {
        let vq = self.vq();
        unsafe {
            let table = addr_of_mut!((*vq).desc) as *mut VirtqDesc;
            table.add(DESC_INDIRECT).write_volatile(VirtqDesc {
                addr: table.add(DESC_HEADER) as u64,
                len: (3 * size_of::<VirtqDesc>()) as u32,
                flags: VIRTQ_DESC_F_INDIRECT,
                next: 0,
            });
            // `next` is relative to the indirect table
            table.add(DESC_HEADER).write_volatile(VirtqDesc {
                addr: addr_of!((*vq).header) as u64,
                len: size_of::<BlkReqHeader>() as u32,
                flags: VIRTQ_DESC_F_NEXT,
                next: (DESC_DATA - 1) as u16,
            });
            table.add(DESC_DATA).write_volatile(VirtqDesc {
                addr: self.blkbuf.addr(),
                len: self.blksz,
                flags: VIRTQ_DESC_F_NEXT,
                next: (DESC_STATUS - 1) as u16,
            });
            table.add(DESC_STATUS).write_volatile(VirtqDesc {
                addr: addr_of!((*vq).status) as u64,
                len: 1,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            });
            addr_of_mut!((*vq).avail.idx).write_volatile(0);
            addr_of_mut!((*vq).used.idx).write_volatile(0);
        }
        fence(Ordering::SeqCst);
        attach_virtq(
            &self.bus,
            QUEUE_ID,
            1,
            self.queue.addr(),
            unsafe { addr_of!((*vq).used) } as u64,
            unsafe { addr_of!((*vq).avail) } as u64,
        )?;
        set_status(&self.bus, STATUS_DRIVER_OK);
        Ok(())
    }

    /// Arms the queue and the interrupt line. Only one handle may be open.
    pub fn open(self: &Rc<Self>) -> Result<VioBlkIo<B, C>> {
        if self.opened.get() {
            return Err(Error::Busy);
        }
        if self.bus.read(REG_STATUS) & STATUS_DRIVER_OK == 0 {
            // closed before: bring the device back up
            self.bus.write(REG_STATUS, 0);
            set_status(&self.bus, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
            negotiate_features(&self.bus, self.features, self.features)?;
            self.setup_queue()?;
        }
        enable_virtq(&self.bus, QUEUE_ID);
        self.intc.enable_irq(self.irqno);
        self.opened.set(true);
        self.pos.set(0);
        Ok(VioBlkIo {
            dev: self.clone(),
            closed: false,
        })
    }

    /// Every transfer waits for its completion, so nothing is in flight here.
    fn close(&self) {
        if !self.opened.get() {
            return;
        }
        reset_virtq(&self.bus, QUEUE_ID);
        self.opened.set(false);
        self.intc.disable_irq(self.irqno);
        clear_status(
            &self.bus,
            STATUS_DRIVER_OK | STATUS_DRIVER | STATUS_ACKNOWLEDGE | STATUS_FEATURES_OK,
        );
    }

    /// Interrupt handler.
    pub fn isr(&self) {
        let status = self.bus.read(REG_INTERRUPT_STATUS);
        if status & INTR_USED_BUFFER != 0 {
            self.bus.write(REG_INTERRUPT_ACK, INTR_USED_BUFFER);
            self.used_updated.broadcast();
        }
        if status & INTR_CONFIG_CHANGE != 0 {
            self.bus.write(REG_INTERRUPT_ACK, INTR_CONFIG_CHANGE);
        }
    }

    /// Runs one request for block `blkno` through the queue and waits for it.
    fn transfer(&self, type_: u32, blkno: u64) -> Result<()> {
        let vq = self.vq();
        let data_flags = if type_ == VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };
        unsafe {
            addr_of_mut!((*vq).desc[DESC_DATA].flags).write_volatile(data_flags);
            addr_of_mut!((*vq).header).write_volatile(BlkReqHeader {
                type_,
                reserved: 0,
                sector: blkno * (self.blksz as u64 / SECTOR_SIZE),
            });
            addr_of_mut!((*vq).status).write_volatile(0xff);
        }
        fence(Ordering::SeqCst);

        let guard = IntrGuard::new();
        let avail_idx = unsafe {
            addr_of_mut!((*vq).avail.ring[0]).write_volatile(DESC_INDIRECT as u16);
            let idx = addr_of!((*vq).avail.idx).read_volatile().wrapping_add(1);
            addr_of_mut!((*vq).avail.idx).write_volatile(idx);
            idx
        };
        notify_avail(&self.bus, QUEUE_ID);
        while unsafe { addr_of!((*vq).used.idx).read_volatile() } != avail_idx {
            self.used_updated.wait();
        }
        drop(guard);
        fence(Ordering::SeqCst);

        match unsafe { addr_of!((*vq).status).read_volatile() } {
            VIRTIO_BLK_S_OK => Ok(()),
            status => {
                debug!("vioblk: block {} failed with status {}", blkno, status);
                Err(Error::Io)
            }
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let blksz = self.blksz as u64;
        let pos = self.pos.get();
        let n = (buf.len() as u64).min(self.size.saturating_sub(pos)) as usize;
        let mut done = 0;
        while done < n {
            let at = self.pos.get();
            self.transfer(VIRTIO_BLK_T_IN, at / blksz)?;
            let off = (at % blksz) as usize;
            let len = (self.blksz as usize - off).min(n - done);
            unsafe {
                ptr::copy_nonoverlapping(
                    self.blkbuf.ptr.as_ptr().add(off),
                    buf[done..].as_mut_ptr(),
                    len,
                )
            };
            done += len;
            self.pos.set(at + len as u64);
        }
        Ok(done)
    }

    /// Whole blocks only; a misaligned request moves nothing.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.readonly {
            return Err(Error::NotSupported);
        }
        let blksz = self.blksz as u64;
        let pos = self.pos.get();
        if buf.len() as u64 % blksz != 0 || pos % blksz != 0 {
            debug!("vioblk: unaligned write of {} bytes at {}", buf.len(), pos);
            return Err(Error::InvalidArgument);
        }
        let room = (self.size - pos) / blksz * blksz;
        let n = (buf.len() as u64).min(room) as usize;
        for chunk in buf[..n].chunks(self.blksz as usize) {
            unsafe {
                ptr::copy_nonoverlapping(chunk.as_ptr(), self.blkbuf.ptr.as_ptr(), chunk.len())
            };
            let at = self.pos.get();
            self.transfer(VIRTIO_BLK_T_OUT, at / blksz)?;
            self.pos.set(at + blksz);
        }
        Ok(n)
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<u64> {
        match cmd {
            Ioctl::GetLen => Ok(self.size),
            Ioctl::GetPos => Ok(self.pos.get()),
            Ioctl::SetPos(pos) => {
                if pos > self.size || pos % self.blksz as u64 != 0 {
                    return Err(Error::InvalidArgument);
                }
                self.pos.set(pos);
                Ok(0)
            }
            Ioctl::GetBlkSz => Ok(self.blksz as u64),
            Ioctl::SetLen(_) | Ioctl::Flush => Err(Error::NotSupported),
        }
    }
}

impl<B: Bus + 'static, C: Condition + 'static> VioBlk<B, C> {
    /// Publishes the device as the next `blk` instance and hooks its
    /// interrupt line.
    pub fn register(self: &Rc<Self>, devices: &mut DeviceManager, isrs: &mut IsrTable) -> usize {
        let dev = self.clone();
        isrs.register(self.irqno, Box::new(move || dev.isr()));
        let dev = self.clone();
        devices.register("blk", move || {
            dev.open()
                .map(|io| Box::new(io) as Box<dyn Io>)
        })
    }
}

/// The open handle of a [`VioBlk`].
pub struct VioBlkIo<B: Bus, C: Condition> {
    dev: Rc<VioBlk<B, C>>,
    closed: bool,
}

impl<B: Bus, C: Condition> Io for VioBlkIo<B, C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::BadDescriptor);
        }
        self.dev.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::BadDescriptor);
        }
        self.dev.write(buf)
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u64> {
        if self.closed {
            return Err(Error::BadDescriptor);
        }
        self.dev.ioctl(cmd)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.dev.close();
        }
    }
}

impl<B: Bus, C: Condition> Drop for VioBlkIo<B, C> {
    fn drop(&mut self) {
        self.close();
    }
}
