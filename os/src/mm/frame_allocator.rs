//! Physical page allocator
//!
//! Free pages form a singly linked list threaded through the pages
//! themselves: the first word of every free page holds the page number of the
//! next one. There is no locking. The list belongs to a single hart and must
//! not be touched from interrupt context while a normal-context call is in
//! progress.

use core::fmt::{self, Debug, Formatter};

use super::{PhysPageNum, PhysWindow};

/// 物理页帧管理器 Trait
pub trait FrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum>;
    /// # Safety
    /// `ppn` must have come from `alloc` on this allocator and must not be
    /// freed twice.
    unsafe fn dealloc(&mut self, ppn: PhysPageNum);
}

/// View of a free page. Only ever materialised inside this module.
#[repr(C)]
struct LinkedPage {
    /// page number of the next free page, `0` ends the list
    next: usize,
}

/// 链表式物理页帧管理策略
pub struct FreeList {
    head: Option<PhysPageNum>,
    free: usize,
    window: PhysWindow,
}

impl FreeList {
    pub const fn new(window: PhysWindow) -> Self {
        Self {
            head: None,
            free: 0,
            window,
        }
    }

    /// Puts every page in `[l, r)` on the list.
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        let (l, r): (usize, usize) = (l.into(), r.into());
        assert!(l != 0, "page 0 cannot be managed");
        for ppn in l..r {
            unsafe { self.dealloc(ppn.into()) };
        }
        info!("page allocator: {} pages free", self.free);
    }

    pub fn free_pages(&self) -> usize {
        self.free
    }

    fn node(&self, ppn: PhysPageNum) -> *mut LinkedPage {
        self.window.ptr::<LinkedPage>(ppn.into())
    }
}

impl FrameAllocator for FreeList {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        let ppn = self.head?;
        let next = unsafe { self.node(ppn).read().next };
        self.head = (next != 0).then(|| next.into());
        self.free -= 1;
        Some(ppn)
    }

    unsafe fn dealloc(&mut self, ppn: PhysPageNum) {
        let next = self.head.map_or(0, usize::from);
        self.node(ppn).write(LinkedPage { next });
        self.head = Some(ppn);
        self.free += 1;
    }
}

impl Debug for FreeList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "FreeList: head={:?} free={}",
            self.head, self.free
        ))
    }
}
