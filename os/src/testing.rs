//! Host stand-ins for RAM, the MMU and devices used by unit tests

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr;

use crate::config::{PAGE_SIZE, RAM_END, RAM_SIZE, RAM_START, USER_END_VMA, USER_START_VMA};
use crate::drivers::vioblk::{BlkReqHeader, VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_RO, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT};
use crate::drivers::virtio::*;
use crate::drivers::InterruptController;
use crate::fs::layout::{BootBlock, DirEntry, Inode, BLOCK_SIZE};
use crate::mm::{MemoryLayout, MemoryManager, PhysAddr, PhysPageNum, PhysWindow, SoftMmu};
use crate::sync::Condition;

/// Kernel image of the test layout: text, rodata and data inside the first
/// 64 KiB of RAM.
pub fn test_layout() -> MemoryLayout {
    MemoryLayout {
        ram: RAM_START..RAM_END,
        text: RAM_START..RAM_START + 0x8000,
        rodata: RAM_START + 0x8000..RAM_START + 0xC000,
        data: RAM_START + 0xC000..RAM_START + 0x1_0000,
        user: USER_START_VMA..USER_END_VMA,
    }
}

/// `RAM_SIZE` bytes of page-aligned host memory posing as physical RAM at
/// `RAM_START`.
pub struct TestRam {
    base: *mut u8,
    layout: Layout,
}

impl TestRam {
    pub fn new() -> Self {
        let layout = Layout::from_size_align(RAM_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn window(&self) -> PhysWindow {
        PhysWindow::with_offset((self.base as usize).wrapping_sub(RAM_START))
    }

    /// First page past the test kernel heap.
    pub fn first_ppn(&self) -> PhysPageNum {
        PhysAddr::from(test_layout().heap().end).floor()
    }

    pub fn memory_manager(&self) -> MemoryManager<SoftMmu> {
        MemoryManager::new(test_layout(), self.window(), SoftMmu::new())
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Records which interrupt lines are enabled.
#[derive(Default)]
pub struct TestIntc {
    enabled: RefCell<Vec<u32>>,
}

impl TestIntc {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn enabled(&self, irqno: u32) -> bool {
        self.enabled.borrow().contains(&irqno)
    }
}

impl InterruptController for TestIntc {
    fn enable_irq(&self, irqno: u32) {
        self.enabled.borrow_mut().push(irqno);
    }

    fn disable_irq(&self, irqno: u32) {
        self.enabled.borrow_mut().retain(|&n| n != irqno);
    }
}

/// Waiting lets the mock device finish whatever it was notified about.
pub struct TestCondition {
    dev: Rc<MockBlk>,
}

impl TestCondition {
    pub fn new(dev: Rc<MockBlk>) -> Self {
        Self { dev }
    }
}

impl Condition for TestCondition {
    fn wait(&self) {
        self.dev.waits.set(self.dev.waits.get() + 1);
        self.dev.complete();
    }

    fn broadcast(&self) {
        self.dev.broadcasts.set(self.dev.broadcasts.get() + 1);
    }
}

/// A virtio-mmio block device over an in-memory disk.
///
/// Requests are served when the queue is notified, or on the next
/// [`Condition::wait`] when completion is deferred.
pub struct MockBlk {
    disk: RefCell<Vec<u8>>,
    offered: Cell<u64>,
    blk_size: u32,
    status: Cell<u32>,
    features_sel: Cell<u32>,
    driver_sel: Cell<u32>,
    driver_features: Cell<u64>,
    desc: Cell<u64>,
    avail: Cell<u64>,
    used: Cell<u64>,
    ready: Cell<u32>,
    interrupt_status: Cell<u32>,
    deferred: Cell<bool>,
    pending: Cell<bool>,
    fail_after: Cell<Option<usize>>,
    requests: Cell<usize>,
    last_sector: Cell<u64>,
    waits: Cell<usize>,
    broadcasts: Cell<usize>,
}

impl MockBlk {
    /// `blk_size` of zero leaves BLK_SIZE unoffered.
    pub fn new(disk: Vec<u8>, blk_size: u32) -> Rc<Self> {
        let mut offered = feature(F_RING_RESET) | feature(F_INDIRECT_DESC);
        if blk_size != 0 {
            offered |= feature(VIRTIO_BLK_F_BLK_SIZE);
        }
        Rc::new(Self {
            disk: RefCell::new(disk),
            offered: Cell::new(offered),
            blk_size,
            status: Cell::new(0),
            features_sel: Cell::new(0),
            driver_sel: Cell::new(0),
            driver_features: Cell::new(0),
            desc: Cell::new(0),
            avail: Cell::new(0),
            used: Cell::new(0),
            ready: Cell::new(0),
            interrupt_status: Cell::new(0),
            deferred: Cell::new(false),
            pending: Cell::new(false),
            fail_after: Cell::new(None),
            requests: Cell::new(0),
            last_sector: Cell::new(0),
            waits: Cell::new(0),
            broadcasts: Cell::new(0),
        })
    }

    pub fn set_readonly(&self) {
        self.offered.set(self.offered.get() | feature(VIRTIO_BLK_F_RO));
    }

    pub fn defer_completion(&self, deferred: bool) {
        self.deferred.set(deferred);
    }

    /// Requests after the first `n` complete with an I/O error.
    pub fn fail_after(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    pub fn raise(&self, bits: u32) {
        self.interrupt_status.set(self.interrupt_status.get() | bits);
    }

    pub fn disk(&self) -> Vec<u8> {
        self.disk.borrow().clone()
    }

    pub fn status(&self) -> u32 {
        self.status.get()
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status.get()
    }

    pub fn requests(&self) -> usize {
        self.requests.get()
    }

    pub fn last_sector(&self) -> u64 {
        self.last_sector.get()
    }

    pub fn waits(&self) -> usize {
        self.waits.get()
    }

    pub fn broadcasts(&self) -> usize {
        self.broadcasts.get()
    }

    fn complete(&self) {
        if self.pending.replace(false) {
            self.process();
        }
    }

    fn set_half(cell: &Cell<u64>, high: bool, val: u32) {
        let old = cell.get();
        cell.set(if high {
            old & 0xffff_ffff | (val as u64) << 32
        } else {
            old & !0xffff_ffff | val as u64
        });
    }

    /// Drains the available ring.
    fn process(&self) {
        if self.ready.get() == 0 {
            return;
        }
        unsafe {
            let avail = self.avail.get() as *const u16;
            let used = self.used.get() as *mut u16;
            let avail_idx = ptr::read_volatile(avail.add(1));
            let mut used_idx = ptr::read_volatile(used.add(1));
            while used_idx != avail_idx {
                let head = ptr::read_volatile(avail.add(2)) as usize;
                let len = self.serve(head);
                let elem = (used as *mut u8).add(4) as *mut VirtqUsedElem;
                ptr::write_volatile(elem, VirtqUsedElem { id: head as u32, len });
                used_idx = used_idx.wrapping_add(1);
                ptr::write_volatile(used.add(1), used_idx);
            }
        }
        self.raise(INTR_USED_BUFFER);
    }

    /// Executes the request whose indirect descriptor is `head`.
    unsafe fn serve(&self, head: usize) -> u32 {
        let table = self.desc.get() as *const VirtqDesc;
        let indirect = ptr::read_volatile(table.add(head));
        assert_ne!(indirect.flags & VIRTQ_DESC_F_INDIRECT, 0);
        assert_eq!(indirect.len as usize, 3 * core::mem::size_of::<VirtqDesc>());
        let chain = indirect.addr as *const VirtqDesc;
        let hdr = ptr::read_volatile(chain);
        let data = ptr::read_volatile(chain.add(hdr.next as usize));
        let status = ptr::read_volatile(chain.add(data.next as usize));
        assert_ne!(status.flags & VIRTQ_DESC_F_WRITE, 0);
        let req = ptr::read_volatile(hdr.addr as *const BlkReqHeader);

        let served = self.requests.get();
        self.requests.set(served + 1);
        self.last_sector.set(req.sector);
        let start = req.sector as usize * 512;
        let end = start + data.len as usize;
        let mut disk = self.disk.borrow_mut();
        let failed = self.fail_after.get().map_or(false, |n| served >= n);
        let ok = !failed
            && end <= disk.len()
            && match req.type_ {
                VIRTIO_BLK_T_IN => {
                    assert_ne!(data.flags & VIRTQ_DESC_F_WRITE, 0);
                    ptr::copy_nonoverlapping(
                        disk[start..end].as_ptr(),
                        data.addr as *mut u8,
                        data.len as usize,
                    );
                    true
                }
                VIRTIO_BLK_T_OUT => {
                    assert_eq!(data.flags & VIRTQ_DESC_F_WRITE, 0);
                    ptr::copy_nonoverlapping(
                        data.addr as *const u8,
                        disk[start..end].as_mut_ptr(),
                        data.len as usize,
                    );
                    true
                }
                _ => false,
            };
        ptr::write_volatile(status.addr as *mut u8, if ok { 0 } else { 1 });
        data.len + 1
    }
}

impl Bus for MockBlk {
    fn read(&self, off: usize) -> u32 {
        match off {
            REG_MAGIC => VIRTIO_MMIO_MAGIC,
            REG_VERSION => VIRTIO_MMIO_VERSION_MODERN,
            REG_DEVICE_ID => 2,
            REG_DEVICE_FEATURES => (self.offered.get() >> (32 * self.features_sel.get())) as u32,
            REG_QUEUE_NUM_MAX => 8,
            REG_QUEUE_READY => self.ready.get(),
            REG_INTERRUPT_STATUS => self.interrupt_status.get(),
            REG_STATUS => self.status.get(),
            o if o == REG_CONFIG_BASE => (self.disk.borrow().len() / 512) as u32,
            o if o == REG_CONFIG_BASE + 4 => ((self.disk.borrow().len() / 512) >> 32) as u32,
            o if o == REG_CONFIG_BASE + 0x14 => self.blk_size,
            _ => 0,
        }
    }

    fn write(&self, off: usize, val: u32) {
        match off {
            REG_DEVICE_FEATURES_SEL => self.features_sel.set(val),
            REG_DRIVER_FEATURES_SEL => self.driver_sel.set(val),
            REG_DRIVER_FEATURES => {
                Self::set_half(&self.driver_features, self.driver_sel.get() == 1, val)
            }
            REG_QUEUE_DESC_LOW => Self::set_half(&self.desc, false, val),
            REG_QUEUE_DESC_HIGH => Self::set_half(&self.desc, true, val),
            REG_QUEUE_DRIVER_LOW => Self::set_half(&self.avail, false, val),
            REG_QUEUE_DRIVER_HIGH => Self::set_half(&self.avail, true, val),
            REG_QUEUE_DEVICE_LOW => Self::set_half(&self.used, false, val),
            REG_QUEUE_DEVICE_HIGH => Self::set_half(&self.used, true, val),
            REG_QUEUE_READY => self.ready.set(val),
            REG_QUEUE_RESET => self.ready.set(0),
            REG_QUEUE_NOTIFY => {
                if self.deferred.get() {
                    self.pending.set(true);
                } else {
                    self.process();
                }
            }
            REG_INTERRUPT_ACK => self.interrupt_status.set(self.interrupt_status.get() & !val),
            REG_STATUS => {
                let mut val = val;
                if self.driver_features.get() & !self.offered.get() != 0 {
                    val &= !STATUS_FEATURES_OK;
                }
                self.status.set(val);
            }
            _ => {}
        }
    }
}

/// Builds filesystem images block by block.
pub struct ImageBuilder {
    boot: BootBlock,
    inodes: Vec<Inode>,
    data: Vec<[u8; BLOCK_SIZE]>,
    spare_blocks: usize,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            boot: BootBlock::default(),
            inodes: Vec::new(),
            data: Vec::new(),
            spare_blocks: 8,
        }
    }

    /// Free data blocks left at the end of the image.
    pub fn spare_blocks(mut self, n: usize) -> Self {
        self.spare_blocks = n;
        self
    }

    /// Adds a file. Data blocks are stored in reverse so files are never
    /// laid out in order.
    pub fn file(mut self, name: &str, contents: &[u8]) -> Self {
        let inode_no = self.inodes.len() as u32;
        let mut inode = Inode {
            length: contents.len() as u32,
            ..Inode::default()
        };
        let chunks: Vec<&[u8]> = contents.chunks(BLOCK_SIZE).collect();
        let first = self.data.len();
        for (i, chunk) in chunks.iter().enumerate().rev() {
            let mut block = [0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            inode.blocks[i] = (first + chunks.len() - 1 - i) as u32;
            self.data.push(block);
        }
        self.inodes.push(inode);
        self.boot.entries.push(DirEntry::new(name, inode_no));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.boot.num_inodes = self.inodes.len() as u32;
        self.boot.num_data_blks = self.data.len() as u32;
        let total = 1 + self.inodes.len() + self.data.len() + self.spare_blocks;
        let mut image = vec![0u8; total * BLOCK_SIZE];
        self.boot.encode(&mut image[..BLOCK_SIZE]);
        for (i, inode) in self.inodes.iter().enumerate() {
            let at = (1 + i) * BLOCK_SIZE;
            inode.encode(&mut image[at..at + BLOCK_SIZE]);
        }
        let data_start = (1 + self.inodes.len()) * BLOCK_SIZE;
        for (i, block) in self.data.iter().enumerate() {
            let at = data_start + i * BLOCK_SIZE;
            image[at..at + BLOCK_SIZE].copy_from_slice(block);
        }
        image
    }
}

/// One PT_LOAD segment of an [`elf_image`]: virtual address, p_flags,
/// file bytes and memory size.
pub struct Segment<'a> {
    pub vaddr: u64,
    pub flags: u32,
    pub data: &'a [u8],
    pub memsz: u64,
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// Minimal RISC-V ELF64 executable holding `segments`.
pub fn elf_image(entry: u64, segments: &[Segment]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHSIZE: usize = 56;
    let mut image = vec![0u8; EHSIZE + PHSIZE * segments.len()];
    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little-endian
    image[6] = 1;
    put16(&mut image, 16, 2); // ET_EXEC
    put16(&mut image, 18, 0xF3); // EM_RISCV
    put32(&mut image, 20, 1);
    put64(&mut image, 24, entry);
    put64(&mut image, 32, EHSIZE as u64);
    put16(&mut image, 52, EHSIZE as u16);
    put16(&mut image, 54, PHSIZE as u16);
    put16(&mut image, 56, segments.len() as u16);
    put16(&mut image, 58, 64);

    for (i, seg) in segments.iter().enumerate() {
        let offset = image.len() as u64;
        image.extend_from_slice(seg.data);
        let at = EHSIZE + i * PHSIZE;
        put32(&mut image, at, 1); // PT_LOAD
        put32(&mut image, at + 4, seg.flags);
        put64(&mut image, at + 8, offset);
        put64(&mut image, at + 16, seg.vaddr);
        put64(&mut image, at + 24, seg.vaddr);
        put64(&mut image, at + 32, seg.data.len() as u64);
        put64(&mut image, at + 40, seg.memsz);
        put64(&mut image, at + 48, PAGE_SIZE as u64);
    }
    image
}

fn put16(buf: &mut [u8], at: usize, val: u16) {
    buf[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

fn put64(buf: &mut [u8], at: usize, val: u64) {
    buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}
