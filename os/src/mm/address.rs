use core::fmt::{self, Debug, Formatter};

use crate::config;

use super::PageTableEntry;

const PA_WIDTH_SV39: usize = 56;
const VA_WIDTH_SV39: usize = 39;
const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - config::PAGE_SIZE_BITS;
const VPN_WIDTH_SV39: usize = VA_WIDTH_SV39 - config::PAGE_SIZE_BITS;

/// physical address
#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq)]
pub struct PhysAddr(usize);

/// virtual address
#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq)]
pub struct VirtAddr(usize);

/// physical page number
#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq)]
pub struct PhysPageNum(usize);

/// virtual page number
#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq)]
pub struct VirtPageNum(usize);

impl PhysAddr {
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / config::PAGE_SIZE)
    }

    pub fn ceil(&self) -> PhysPageNum {
        PhysPageNum((self.0 - 1 + config::PAGE_SIZE) / config::PAGE_SIZE)
    }

    pub fn page_offset(&self) -> usize {
        self.0 & (config::PAGE_SIZE - 1)
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtAddr {
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / config::PAGE_SIZE)
    }

    pub fn ceil(&self) -> VirtPageNum {
        VirtPageNum((self.0 - 1 + config::PAGE_SIZE) / config::PAGE_SIZE)
    }

    pub fn page_offset(&self) -> usize {
        self.0 & (config::PAGE_SIZE - 1)
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

/// 每个页表都用 9 位索引的，因此有 `1 << 9 = 512` 个页表项
pub const PTE_CNT: usize = 1 << 9;

impl VirtPageNum {
    /// 取出虚拟页号的三级页索引，并按照从高到低的顺序返回 `[VPN2, VPN1, VPN0]`
    pub fn indexes(&self) -> [usize; 3] {
        let mut vpn: usize = self.0;
        let mut idx = [0usize; 3];
        for i in (0..3).rev() {
            idx[i] = vpn & (PTE_CNT - 1);
            vpn >>= 9;
        }
        idx
    }
}

/// Bits 63:38 of an Sv39 virtual address must all equal bit 38.
pub fn wellformed(vma: usize) -> bool {
    let bits = (vma as isize) >> (VA_WIDTH_SV39 - 1);
    bits == 0 || bits == -1
}

pub fn round_down(addr: usize, blksz: usize) -> usize {
    addr / blksz * blksz
}

pub fn round_up(addr: usize, blksz: usize) -> usize {
    (addr + blksz - 1) / blksz * blksz
}

/// How the kernel reaches physical memory.
///
/// The kernel runs on an identity map, so on hardware the offset is zero. Host
/// tests back "physical" RAM with an ordinary allocation and shift every
/// physical address into it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhysWindow {
    offset: usize,
}

impl PhysWindow {
    pub const IDENTITY: Self = Self { offset: 0 };

    pub const fn with_offset(offset: usize) -> Self {
        Self { offset }
    }

    pub fn ptr<T>(&self, pa: PhysAddr) -> *mut T {
        pa.0.wrapping_add(self.offset) as *mut T
    }

    /// 返回一个页表项定长数组的可变引用，代表多级页表中的一个节点
    ///
    /// # Safety
    /// `ppn` must be a page-table page reachable through this window and no
    /// other live reference to it may exist.
    pub unsafe fn pte_array(&self, ppn: PhysPageNum) -> &'static mut [PageTableEntry] {
        core::slice::from_raw_parts_mut(self.ptr::<PageTableEntry>(ppn.into()), PTE_CNT)
    }

    /// 返回一个字节数组的可变引用，可以以字节为粒度对物理页帧上的数据进行访问
    ///
    /// # Safety
    /// Same contract as [`PhysWindow::pte_array`].
    pub unsafe fn bytes_array(&self, ppn: PhysPageNum) -> &'static mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr::<u8>(ppn.into()), config::PAGE_SIZE)
    }
}

impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PA_WIDTH_SV39) - 1))
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(v: PhysPageNum) -> Self {
        Self(v.0 << config::PAGE_SIZE_BITS)
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}

impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PPN_WIDTH_SV39) - 1))
    }
}

impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}

impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v & ((1 << VA_WIDTH_SV39) - 1))
    }
}

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}

impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << VPN_WIDTH_SV39) - 1))
    }
}

impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}

impl From<PhysAddr> for usize {
    fn from(v: PhysAddr) -> Self {
        v.0
    }
}

impl From<PhysPageNum> for usize {
    fn from(v: PhysPageNum) -> Self {
        v.0
    }
}

impl From<VirtAddr> for usize {
    fn from(v: VirtAddr) -> Self {
        if v.0 >= (1 << (VA_WIDTH_SV39 - 1)) {
            v.0 | (!((1 << VA_WIDTH_SV39) - 1))
        } else {
            v.0
        }
    }
}

impl From<VirtPageNum> for usize {
    fn from(v: VirtPageNum) -> Self {
        v.0
    }
}
