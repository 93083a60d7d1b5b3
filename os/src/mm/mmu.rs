//! Address-space tags and the active-space register

use core::fmt::{self, Debug, Formatter};

use super::PhysPageNum;

const SATP_MODE_SV39: usize = 8;
const SATP_MODE_SHIFT: usize = 60;
const SATP_ASID_SHIFT: usize = 44;
const SATP_ASID_MASK: usize = 0xffff;
const SATP_PPN_MASK: usize = (1 << 44) - 1;

/// Names one page-table tree: paging mode, address-space id and root page,
/// packed the way `satp` expects them.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SpaceTag(usize);

impl SpaceTag {
    pub fn sv39(asid: u16, root: PhysPageNum) -> Self {
        let ppn: usize = root.into();
        Self(
            SATP_MODE_SV39 << SATP_MODE_SHIFT
                | (asid as usize) << SATP_ASID_SHIFT
                | (ppn & SATP_PPN_MASK),
        )
    }

    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> usize {
        self.0
    }

    pub fn asid(&self) -> u16 {
        (self.0 >> SATP_ASID_SHIFT & SATP_ASID_MASK) as u16
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        (self.0 & SATP_PPN_MASK).into()
    }
}

impl Debug for SpaceTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("SpaceTag(asid={}, root={:?})", self.asid(), self.root_ppn()))
    }
}

/// The hart's translation state.
///
/// Exactly one tag is active at a time. `switch` must leave no stale
/// translation behind, so implementations flush the TLB as part of it.
pub trait Mmu {
    fn active(&self) -> SpaceTag;
    fn switch(&mut self, tag: SpaceTag);
    /// Drops every cached translation of the active space.
    fn flush(&mut self);
}

/// `Mmu` that only records what it was told. Backs the memory manager when
/// there is no paging hardware underneath.
#[derive(Debug, Default)]
pub struct SoftMmu {
    satp: usize,
    flushes: usize,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Mmu for SoftMmu {
    fn active(&self) -> SpaceTag {
        SpaceTag(self.satp)
    }

    fn switch(&mut self, tag: SpaceTag) {
        self.satp = tag.bits();
        self.flush();
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

/// The real `satp` register.
#[cfg(target_arch = "riscv64")]
pub struct Satp;

#[cfg(target_arch = "riscv64")]
impl Mmu for Satp {
    fn active(&self) -> SpaceTag {
        SpaceTag(riscv::register::satp::read().bits())
    }

    fn switch(&mut self, tag: SpaceTag) {
        use riscv::register::satp;
        let ppn: usize = tag.root_ppn().into();
        unsafe { satp::set(satp::Mode::Sv39, tag.asid() as usize, ppn) };
        self.flush();
    }

    fn flush(&mut self) {
        unsafe { core::arch::asm!("sfence.vma") };
    }
}
