use bitflags::*;

use super::address::PTE_CNT;
use super::{FrameAllocator, PhysAddr, PhysPageNum, PhysWindow, VirtAddr, VirtPageNum};

bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

impl PTEFlags {
    /// Any of these marks a leaf.
    pub const RWX: PTEFlags = PTEFlags::from_bits_truncate(0b1110);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(C)]
/// page table entry structure
///
/// SV39 分页模式下的页表项，其中 `[53 : 10]` 这 44 位是物理页号，最低的 8 位 `[7 ：0]` 则是标志位，
/// 控制页表项是否合法、控制索引到这个页表项的对应虚拟页面是否允许读/写/执行等
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: <PhysPageNum as Into<usize>>::into(ppn) << 10 | flags.bits() as usize,
        }
    }

    /// Leaf entry: the permission bits plus accessed, dirty and valid.
    pub fn leaf(ppn: PhysPageNum, rwxug: PTEFlags) -> Self {
        Self::new(ppn, rwxug | PTEFlags::A | PTEFlags::D | PTEFlags::V)
    }

    /// Pointer to a next-level table; only `G` may accompany `V`.
    pub fn table(ppn: PhysPageNum, global: bool) -> Self {
        let g = if global { PTEFlags::G } else { PTEFlags::empty() };
        Self::new(ppn, PTEFlags::V | g)
    }

    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    /// 物理页号
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }

    /// 标志位
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    /// 页表项是否合法
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    pub fn is_global(&self) -> bool {
        self.flags().contains(PTEFlags::G)
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().intersects(PTEFlags::RWX)
    }

    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
}

/// One Sv39 radix tree, addressed by its root page.
#[derive(Copy, Clone, Debug)]
pub struct PageTable {
    root_ppn: PhysPageNum,
    window: PhysWindow,
}

impl PageTable {
    pub fn from_root(root_ppn: PhysPageNum, window: PhysWindow) -> Self {
        Self { root_ppn, window }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// Entries of the table stored in `ppn`.
    pub fn entries(&self, ppn: PhysPageNum) -> &'static mut [PageTableEntry] {
        // Every table page reachable from a root lives in RAM behind `window`.
        unsafe { self.window.pte_array(ppn) }
    }

    /// The one walk shared by every lookup and mapping path.
    ///
    /// With `create` set, missing intermediate tables are allocated, zeroed and
    /// linked, and the level-0 slot is always returned. Without it the walk
    /// stops at the first leaf (which may be a mega- or gigapage) and yields
    /// `None` on a missing table. The second tuple field is the level of the
    /// returned entry, `0` being a 4 KiB page.
    fn walk(
        &self,
        vpn: VirtPageNum,
        mut create: Option<&mut dyn FrameAllocator>,
    ) -> Option<(&'static mut PageTableEntry, usize)> {
        let idxs: [usize; 3] = vpn.indexes();
        let mut ppn: PhysPageNum = self.root_ppn;
        for (i, &idx) in idxs.iter().enumerate() {
            let level = 2 - i;
            let pte: &'static mut PageTableEntry = &mut self.entries(ppn)[idx];
            if level == 0 {
                return Some((pte, 0));
            }
            if pte.is_valid() && pte.is_leaf() {
                if create.is_some() {
                    panic!("{:?} is covered by a level-{} leaf", vpn, level);
                }
                return Some((pte, level));
            }
            if !pte.is_valid() {
                let frames = create.as_deref_mut()?;
                let frame = match frames.alloc() {
                    Some(frame) => frame,
                    None => panic!("out of physical pages"),
                };
                unsafe { self.window.bytes_array(frame) }.fill(0);
                *pte = PageTableEntry::table(frame, false);
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }

    /// 在多级页表找到一个虚拟页号对应的叶子页表项，途中缺失的节点会被新建
    pub fn find_pte_create(
        &self,
        vpn: VirtPageNum,
        frames: &mut dyn FrameAllocator,
    ) -> &'static mut PageTableEntry {
        match self.walk(vpn, Some(frames)) {
            Some((pte, _)) => pte,
            None => unreachable!(),
        }
    }

    /// 当找不到合法叶子节点的时候不会新建叶子节点而是直接返回 `None`
    pub fn find_pte(&self, vpn: VirtPageNum) -> Option<(&'static mut PageTableEntry, usize)> {
        self.walk(vpn, None)
    }

    /// Translates `va` through whatever leaf maps it.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PTEFlags)> {
        let (pte, level) = self.find_pte(VirtAddr::from(va).floor())?;
        if !pte.is_valid() || !pte.is_leaf() {
            return None;
        }
        let span = 1usize << (12 + 9 * level);
        let base: usize = PhysAddr::from(pte.ppn()).into();
        Some(((base + (va & (span - 1))).into(), pte.flags()))
    }

    /// Releases every valid, non-global 4 KiB leaf whose flags satisfy `pick`
    /// and whose page is owned by the allocator, then frees tables that end up
    /// with no valid entry. Global entries and the root are never touched.
    pub fn release(
        &self,
        frames: &mut dyn FrameAllocator,
        owned: impl Fn(PhysPageNum) -> bool,
        pick: impl Fn(PTEFlags) -> bool,
    ) -> usize {
        let mut released = 0;
        let root = self.entries(self.root_ppn);
        for pte2 in root.iter_mut() {
            if !pte2.is_valid() || pte2.is_global() || pte2.is_leaf() {
                continue;
            }
            let ptab1 = self.entries(pte2.ppn());
            for pte1 in ptab1.iter_mut() {
                if !pte1.is_valid() || pte1.is_global() || pte1.is_leaf() {
                    continue;
                }
                let ptab0 = self.entries(pte1.ppn());
                for pte0 in ptab0.iter_mut() {
                    if pte0.is_valid()
                        && !pte0.is_global()
                        && pick(pte0.flags())
                        && owned(pte0.ppn())
                    {
                        unsafe { frames.dealloc(pte0.ppn()) };
                        *pte0 = PageTableEntry::empty();
                        released += 1;
                    }
                }
                if Self::free_if_empty(frames, ptab0, pte1) {
                    released += 1;
                }
            }
            if Self::free_if_empty(frames, ptab1, pte2) {
                released += 1;
            }
        }
        released
    }

    fn free_if_empty(
        frames: &mut dyn FrameAllocator,
        ptab: &[PageTableEntry],
        parent: &mut PageTableEntry,
    ) -> bool {
        if ptab.iter().any(PageTableEntry::is_valid) {
            return false;
        }
        unsafe { frames.dealloc(parent.ppn()) };
        *parent = PageTableEntry::empty();
        true
    }
}

const _: () = assert!(PTE_CNT * core::mem::size_of::<PageTableEntry>() == crate::config::PAGE_SIZE);
