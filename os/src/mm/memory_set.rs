//! Address spaces
//!
//! [`MemoryManager`] owns the page allocator, the main (kernel) space and the
//! hart's active-space register. Every other space starts as a copy of the
//! main root's global entries and is torn down with
//! [`MemoryManager::reclaim_active_space`].

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;

use crate::config::{
    GIGA_SIZE, KERNEL_HEAP_MIN, MEGA_SIZE, PAGE_SIZE, USER_END_VMA, USER_START_VMA,
};
use crate::error::{Error, Result};

use super::address::{round_down, round_up, wellformed};
use super::{
    FrameAllocator, FreeList, Mmu, PTEFlags, PageTable, PageTableEntry, PhysAddr, PhysPageNum,
    PhysWindow, SpaceTag, VirtAddr, VirtPageNum,
};

/// Where the kernel image, heap and RAM sit in physical memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub ram: Range<usize>,
    pub text: Range<usize>,
    pub rodata: Range<usize>,
    /// data and bss; its end is the end of the kernel image
    pub data: Range<usize>,
    pub user: Range<usize>,
}

impl MemoryLayout {
    pub fn kimg_end(&self) -> usize {
        self.data.end
    }

    /// Heap from the end of the image to a page boundary, never smaller than
    /// `KERNEL_HEAP_MIN`.
    pub fn heap(&self) -> Range<usize> {
        let start = self.kimg_end();
        let mut end = round_up(start, PAGE_SIZE);
        if end - start < KERNEL_HEAP_MIN {
            end += round_up(KERNEL_HEAP_MIN - (end - start), PAGE_SIZE);
        }
        start..end
    }

    /// Pages owned by the page allocator.
    pub fn free_range(&self) -> Range<usize> {
        self.heap().end..self.ram.end
    }

    /// Virtual addresses mapped onto themselves by `alloc_and_map_page`.
    pub fn identity(&self) -> Range<usize> {
        self.ram.start..self.ram.start + MEGA_SIZE
    }

    /// Layout of the running kernel, read from the linker script symbols.
    #[cfg(target_arch = "riscv64")]
    pub fn from_linker() -> Self {
        extern "C" {
            fn stext();
            fn etext();
            fn srodata();
            fn erodata();
            fn sdata();
            fn ekernel();
        }
        Self {
            ram: crate::config::RAM_START..crate::config::RAM_END,
            text: stext as usize..etext as usize,
            rodata: srodata as usize..erodata as usize,
            data: sdata as usize..ekernel as usize,
            user: USER_START_VMA..USER_END_VMA,
        }
    }
}

pub struct MemoryManager<M: Mmu> {
    layout: MemoryLayout,
    window: PhysWindow,
    frames: FreeList,
    mmu: M,
    main_tag: SpaceTag,
}

impl<M: Mmu> MemoryManager<M> {
    /// Builds the main space, fills the free list and activates main.
    ///
    /// Main maps MMIO below RAM as global RW gigapages, the first megapage of
    /// RAM as 4 KiB pages carrying the kernel image permissions, and the rest
    /// of RAM as global RW megapages.
    pub fn new(layout: MemoryLayout, window: PhysWindow, mut mmu: M) -> Self {
        let ram = layout.ram.clone();
        assert!(
            layout.kimg_end() <= ram.start + MEGA_SIZE,
            "kernel image does not fit in the first megapage"
        );
        let heap = layout.heap();
        assert!(heap.end <= ram.end, "not enough memory for the kernel heap");

        let mut frames = FreeList::new(window);
        frames.init(
            PhysAddr::from(heap.end).floor(),
            PhysAddr::from(ram.end).floor(),
        );
        let mut zeroed = || {
            let ppn = match frames.alloc() {
                Some(ppn) => ppn,
                None => panic!("out of physical pages"),
            };
            unsafe { window.bytes_array(ppn) }.fill(0);
            ppn
        };
        let (root, pt1, pt0) = (zeroed(), zeroed(), zeroed());
        let main = PageTable::from_root(root, window);
        let global_rw = PTEFlags::R | PTEFlags::W | PTEFlags::G;

        let ptab2 = main.entries(root);
        for pma in (0..ram.start).step_by(GIGA_SIZE) {
            ptab2[vpn(pma)[0]] = PageTableEntry::leaf(PhysAddr::from(pma).floor(), global_rw);
        }
        ptab2[vpn(ram.start)[0]] = PageTableEntry::table(pt1, true);

        let ptab1 = main.entries(pt1);
        ptab1[vpn(ram.start)[1]] = PageTableEntry::table(pt0, true);
        for pma in (ram.start + MEGA_SIZE..ram.end).step_by(MEGA_SIZE) {
            ptab1[vpn(pma)[1]] = PageTableEntry::leaf(PhysAddr::from(pma).floor(), global_rw);
        }

        let ptab0 = main.entries(pt0);
        let kernel_pages = [
            (layout.text.clone(), PTEFlags::R | PTEFlags::X | PTEFlags::G),
            (layout.rodata.clone(), PTEFlags::R | PTEFlags::G),
            (layout.data.start..ram.start + MEGA_SIZE, global_rw),
        ];
        for (range, flags) in kernel_pages {
            let start = round_down(range.start, PAGE_SIZE);
            for pp in (start..range.end).step_by(PAGE_SIZE) {
                ptab0[vpn(pp)[2]] = PageTableEntry::leaf(PhysAddr::from(pp).floor(), flags);
            }
        }

        let main_tag = SpaceTag::sv39(0, root);
        mmu.switch(main_tag);
        info!(
            "main space {:?}, {} pages free",
            main_tag,
            frames.free_pages()
        );
        Self {
            layout,
            window,
            frames,
            mmu,
            main_tag,
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn window(&self) -> PhysWindow {
        self.window
    }

    pub fn main_tag(&self) -> SpaceTag {
        self.main_tag
    }

    pub fn active_tag(&self) -> SpaceTag {
        self.mmu.active()
    }

    pub fn free_pages(&self) -> usize {
        self.frames.free_pages()
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    /// Makes `tag` the active space.
    pub fn switch(&mut self, tag: SpaceTag) {
        trace!("switch to {:?}", tag);
        self.mmu.switch(tag);
    }

    /// Pops a page off the free list. Running out of pages is fatal.
    pub fn alloc_page(&mut self) -> PhysPageNum {
        match self.frames.alloc() {
            Some(ppn) => ppn,
            None => panic!("out of physical pages"),
        }
    }

    /// # Safety
    /// `ppn` must come from [`MemoryManager::alloc_page`] and must not be freed
    /// twice.
    pub unsafe fn free_page(&mut self, ppn: PhysPageNum) {
        self.frames.dealloc(ppn);
    }

    fn alloc_zeroed_page(&mut self) -> PhysPageNum {
        let ppn = self.alloc_page();
        unsafe { self.window.bytes_array(ppn) }.fill(0);
        ppn
    }

    fn active_table(&self) -> PageTable {
        PageTable::from_root(self.mmu.active().root_ppn(), self.window)
    }

    /// Creates a space sharing the global mappings of the active one and
    /// switches to it.
    pub fn create_space(&mut self, asid: u16) -> SpaceTag {
        let active = self.active_table();
        let root = self.alloc_zeroed_page();
        let new = PageTable::from_root(root, self.window);
        let src = active.entries(active.root_ppn());
        let dst = new.entries(root);
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            if s.is_global() {
                *d = *s;
            }
        }
        let tag = SpaceTag::sv39(asid, root);
        debug!("create_space: {:?}", tag);
        self.switch(tag);
        tag
    }

    /// Frees every user page and table of the active space and retires it.
    ///
    /// The root page goes back to the allocator once main is active again.
    /// With main active only its non-global mappings are released.
    pub fn reclaim_active_space(&mut self) {
        let tag = self.mmu.active();
        let released = self.release_active(|_| true);
        if tag == self.main_tag {
            self.mmu.flush();
            debug!("reclaim_active_space: main, {} pages released", released);
            return;
        }
        self.switch(self.main_tag);
        unsafe { self.free_page(tag.root_ppn()) };
        debug!(
            "reclaim_active_space: {:?}, {} pages released",
            tag,
            released + 1
        );
    }

    /// Frees every user-accessible page of the active space in place.
    pub fn unmap_and_free_user(&mut self) {
        let released = self.release_active(|flags| flags.contains(PTEFlags::U));
        self.mmu.flush();
        debug!("unmap_and_free_user: {} pages released", released);
    }

    fn release_active(&mut self, pick: impl Fn(PTEFlags) -> bool) -> usize {
        let table = self.active_table();
        let owned = self.layout.free_range();
        table.release(
            &mut self.frames,
            |ppn| owned.contains(&PhysAddr::from(ppn).into()),
            pick,
        )
    }

    /// Maps the page containing `va` with `flags`, backed by the identical
    /// physical page inside the kernel megapage or by a fresh zeroed page
    /// anywhere else. An existing leaf is overwritten.
    pub fn alloc_and_map_page(&mut self, va: usize, flags: PTEFlags) -> usize {
        let va = round_down(va, PAGE_SIZE);
        let ppn = if self.layout.identity().contains(&va) {
            PhysAddr::from(va).floor()
        } else {
            self.alloc_zeroed_page()
        };
        let table = self.active_table();
        let pte = table.find_pte_create(vpn_of(va), &mut self.frames);
        *pte = PageTableEntry::leaf(ppn, flags);
        self.mmu.flush();
        va
    }

    pub fn alloc_and_map_range(&mut self, va: usize, size: usize, flags: PTEFlags) -> usize {
        let start = round_down(va, PAGE_SIZE);
        for page in (start..va + size).step_by(PAGE_SIZE) {
            self.alloc_and_map_page(page, flags);
        }
        va
    }

    /// Rewrites the permissions of an existing 4 KiB mapping.
    pub fn set_page_flags(&mut self, va: usize, flags: PTEFlags) {
        let pte = match self.active_table().find_pte(vpn_of(va)) {
            Some((pte, 0)) if pte.is_valid() => pte,
            _ => panic!("set_page_flags: {:#x} is not mapped", va),
        };
        *pte = PageTableEntry::leaf(pte.ppn(), flags);
        self.mmu.flush();
    }

    pub fn set_range_flags(&mut self, va: usize, size: usize, flags: PTEFlags) {
        let start = round_down(va, PAGE_SIZE);
        for page in (start..va + size).step_by(PAGE_SIZE) {
            self.set_page_flags(page, flags);
        }
    }

    /// Physical address and leaf flags behind `va` in the active space.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PTEFlags)> {
        if !wellformed(va) {
            return None;
        }
        self.active_table().translate(va)
    }

    /// Leaf flags of `va`, if they grant at least `flags`.
    fn granted(&self, va: usize, flags: PTEFlags) -> Option<PhysAddr> {
        match self.translate(va) {
            Some((pa, have)) if have.contains(flags | PTEFlags::V) => Some(pa),
            _ => None,
        }
    }

    /// True iff every page of `[va, va + len)` is mapped with `flags`.
    pub fn validate_region(&self, va: usize, len: usize, flags: PTEFlags) -> bool {
        let end = match va.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        (round_down(va, PAGE_SIZE)..end)
            .step_by(PAGE_SIZE)
            .all(|page| self.granted(page, flags).is_some())
    }

    /// True iff a NUL byte is reached from `va` through memory mapped with
    /// `flags`.
    pub fn validate_cstring(&self, va: usize, flags: PTEFlags) -> bool {
        self.scan_cstr(va, flags, usize::MAX, |_| {}).is_ok()
    }

    /// Walks the string at `va` a page at a time, handing each byte before the
    /// NUL to `f`. Fails on the first byte lacking `flags` or after `max`
    /// bytes without a terminator.
    fn scan_cstr(
        &self,
        va: usize,
        flags: PTEFlags,
        max: usize,
        mut f: impl FnMut(u8),
    ) -> Result<usize> {
        let mut cur = va;
        let mut len = 0;
        loop {
            let pa = self.granted(cur, flags).ok_or(Error::BadAddress)?;
            let in_page = PAGE_SIZE - VirtAddr::from(cur).page_offset();
            let bytes = unsafe {
                core::slice::from_raw_parts(self.window.ptr::<u8>(pa) as *const u8, in_page)
            };
            for &b in bytes {
                if b == 0 {
                    return Ok(len);
                }
                if len == max {
                    return Err(Error::InvalidArgument);
                }
                f(b);
                len += 1;
            }
            cur = cur.checked_add(in_page).ok_or(Error::BadAddress)?;
        }
    }

    /// Demand paging for the user window.
    ///
    /// A well-formed address inside the window with no mapping gets a fresh
    /// zeroed RW user page. Anything else is the process's fault.
    pub fn handle_page_fault(&mut self, va: usize) -> Result<()> {
        if !self.layout.user.contains(&va) || !wellformed(va) {
            warn!("page fault at {:#x} outside the user window", va);
            return Err(Error::BadAddress);
        }
        if let Some((pte, _)) = self.active_table().find_pte(vpn_of(va)) {
            if pte.is_valid() {
                warn!("protection fault at {:#x}, flags {:?}", va, pte.flags());
                return Err(Error::BadAddress);
            }
        }
        let page = self.alloc_and_map_page(va, PTEFlags::R | PTEFlags::W | PTEFlags::U);
        trace!("demand-mapped page {:#x}", page);
        Ok(())
    }

    /// Copies user memory at `va` into `buf`; every page must grant `flags`.
    pub fn copy_from_user(&self, va: usize, buf: &mut [u8], flags: PTEFlags) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va.checked_add(done).ok_or(Error::BadAddress)?;
            let pa = self.granted(cur, flags).ok_or(Error::BadAddress)?;
            let n = (PAGE_SIZE - VirtAddr::from(cur).page_offset()).min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.window.ptr::<u8>(pa) as *const u8,
                    buf[done..].as_mut_ptr(),
                    n,
                )
            };
            done += n;
        }
        Ok(())
    }

    /// Copies `data` to user memory at `va`; every page must grant `flags`.
    pub fn copy_to_user(&mut self, va: usize, data: &[u8], flags: PTEFlags) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = va.checked_add(done).ok_or(Error::BadAddress)?;
            let pa = self.granted(cur, flags).ok_or(Error::BadAddress)?;
            let n = (PAGE_SIZE - VirtAddr::from(cur).page_offset()).min(data.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), self.window.ptr::<u8>(pa), n)
            };
            done += n;
        }
        Ok(())
    }

    /// Reads the NUL-terminated string at `va`, at most `max` bytes long.
    pub fn read_user_cstr(&self, va: usize, flags: PTEFlags, max: usize) -> Result<String> {
        let mut bytes = Vec::new();
        self.scan_cstr(va, flags, max, |b| bytes.push(b))?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidArgument)
    }
}

fn vpn_of(va: usize) -> VirtPageNum {
    VirtAddr::from(va).floor()
}

fn vpn(va: usize) -> [usize; 3] {
    vpn_of(va).indexes()
}
