//! Process table
//!
//! A process owns an address space and a table of open I/O endpoints and is
//! run by exactly one kernel thread. Threads themselves belong to the
//! scheduler; this table only remembers which thread id serves each process.

use alloc::boxed::Box;

use crate::arena::{Arena, Handle};
use crate::config::{NPROC, PROCESS_IOMAX};
use crate::error::{Error, Result};
use crate::io::Io;
use crate::loader;
use crate::mm::{MemoryManager, Mmu, SpaceTag};

pub struct Process {
    pid: usize,
    tid: usize,
    tag: SpaceTag,
    iotab: [Option<Box<dyn Io>>; PROCESS_IOMAX],
}

impl Process {
    fn new(pid: usize, tid: usize, tag: SpaceTag) -> Self {
        Self {
            pid,
            tid,
            tag,
            iotab: Default::default(),
        }
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn tag(&self) -> SpaceTag {
        self.tag
    }

    fn slot(fd: isize) -> Result<usize> {
        usize::try_from(fd)
            .ok()
            .filter(|&fd| fd < PROCESS_IOMAX)
            .ok_or(Error::BadDescriptor)
    }

    /// Places `io` at `fd`, or at the lowest free descriptor if `fd` is
    /// negative, and returns the descriptor used.
    ///
    /// On failure `io` is closed.
    pub fn install(&mut self, fd: isize, mut io: Box<dyn Io>) -> Result<usize> {
        let fd = match self.reserve(fd) {
            Ok(fd) => fd,
            Err(e) => {
                io.close();
                return Err(e);
            }
        };
        self.iotab[fd] = Some(io);
        Ok(fd)
    }

    /// Checks that `fd` can take a new endpoint and resolves a negative `fd`
    /// to the lowest free one.
    pub fn reserve(&self, fd: isize) -> Result<usize> {
        if fd < 0 {
            return self
                .iotab
                .iter()
                .position(Option::is_none)
                .ok_or(Error::TooManyOpenFiles);
        }
        let fd = Self::slot(fd)?;
        match self.iotab[fd] {
            Some(_) => Err(Error::DescriptorBusy),
            None => Ok(fd),
        }
    }

    pub fn io(&mut self, fd: isize) -> Result<&mut (dyn Io + 'static)> {
        let fd = Self::slot(fd)?;
        self.iotab[fd].as_deref_mut().ok_or(Error::BadDescriptor)
    }

    pub fn close(&mut self, fd: isize) -> Result<()> {
        let fd = Self::slot(fd)?;
        let mut io = self.iotab[fd].take().ok_or(Error::BadDescriptor)?;
        io.close();
        Ok(())
    }

    fn close_all(&mut self) {
        for mut io in self.iotab.iter_mut().filter_map(Option::take) {
            io.close();
        }
    }
}

/// All live processes and the one the hart is currently serving.
pub struct ProcessManager {
    procs: Arena<Process, NPROC>,
    current: Option<Handle>,
}

impl ProcessManager {
    /// Makes the boot thread `tid` process 0, running in the main space.
    pub fn init(tid: usize, main_tag: SpaceTag) -> Self {
        let mut procs = Arena::new();
        let h = procs.insert(Process::new(0, tid, main_tag));
        Self { procs, current: h }
    }

    /// Adds a process served by thread `tid`. It starts in the main space
    /// and gets its own on its first exec.
    pub fn create(&mut self, tid: usize, main_tag: SpaceTag) -> Result<usize> {
        let pid = (0..NPROC)
            .find(|&i| self.procs.handle_at(i).is_none())
            .ok_or(Error::TooManyProcesses)?;
        let h = self
            .procs
            .insert(Process::new(pid, tid, main_tag))
            .ok_or(Error::TooManyProcesses)?;
        debug_assert_eq!(h.index(), pid);
        info!("process {} created for thread {}", pid, tid);
        Ok(pid)
    }

    pub fn get(&self, pid: usize) -> Option<&Process> {
        self.procs.handle_at(pid).and_then(|h| self.procs.get(h))
    }

    pub fn current(&self) -> Option<&Process> {
        self.current.and_then(|h| self.procs.get(h))
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.current.and_then(|h| self.procs.get_mut(h))
    }

    /// Marks `pid` as the process whose thread now runs.
    pub fn set_current(&mut self, pid: usize) -> Result<()> {
        let h = self.procs.handle_at(pid).ok_or(Error::InvalidArgument)?;
        self.current = Some(h);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    /// Replaces the image of the current process with the executable open
    /// at `fd` and returns its entry point.
    ///
    /// The first exec out of the main space builds the process its own
    /// space; later ones empty the existing space in place. The endpoint
    /// stays open.
    pub fn exec<M: Mmu>(&mut self, mm: &mut MemoryManager<M>, fd: isize) -> Result<usize> {
        let proc = self.current_mut().ok_or(Error::InvalidArgument)?;
        proc.io(fd)?;
        if proc.tag == mm.main_tag() {
            proc.tag = mm.create_space(proc.pid as u16);
        } else {
            if mm.active_tag() != proc.tag {
                mm.switch(proc.tag);
            }
            mm.unmap_and_free_user();
        }
        let pid = proc.pid;
        let io = proc.io(fd)?;
        let entry = loader::load(io, mm)?;
        info!("process {} exec, entry {:#x}", pid, entry);
        Ok(entry)
    }

    /// Closes every descriptor of `pid`, frees its memory and its slot, and
    /// returns the thread that served it. Leaves the main space active.
    pub fn terminate<M: Mmu>(&mut self, mm: &mut MemoryManager<M>, pid: usize) -> Result<usize> {
        let h = self.procs.handle_at(pid).ok_or(Error::InvalidArgument)?;
        let mut proc = self.procs.remove(h).ok_or(Error::InvalidArgument)?;
        proc.close_all();
        if mm.active_tag() != proc.tag {
            mm.switch(proc.tag);
        }
        if proc.tag == mm.main_tag() {
            mm.unmap_and_free_user();
        } else {
            mm.reclaim_active_space();
        }
        if self.current == Some(h) {
            self.current = None;
        }
        info!("process {} terminated", pid);
        Ok(proc.tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_START_VMA;
    use crate::io::MemIo;
    use crate::mm::PTEFlags;
    use crate::testing::{elf_image, Segment, TestRam, PF_R, PF_X};
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::Cell;

    /// Counts how often it was closed.
    struct Probe(Rc<Cell<usize>>);

    impl Io for Probe {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        fn ioctl(&mut self, _cmd: crate::io::Ioctl) -> Result<u64> {
            Err(Error::NotSupported)
        }

        fn close(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn empty() -> Box<dyn Io> {
        Box::new(MemIo::new(Vec::<u8>::new()))
    }

    fn program() -> Vec<u8> {
        let entry = USER_START_VMA as u64;
        elf_image(
            entry,
            &[Segment { vaddr: entry, flags: PF_R | PF_X, data: &[0x73, 0, 0, 0], memsz: 0x2000 }],
        )
    }

    #[test]
    fn descriptors_pick_lowest_free_slot() {
        let ram = TestRam::new();
        let mm = ram.memory_manager();
        let mut pm = ProcessManager::init(7, mm.main_tag());
        let proc = pm.current_mut().unwrap();
        assert_eq!(proc.install(-1, empty()), Ok(0));
        assert_eq!(proc.install(2, empty()), Ok(2));
        assert_eq!(proc.install(-1, empty()), Ok(1));
        assert_eq!(proc.reserve(-1), Ok(3));

        let closed = Rc::new(Cell::new(0));
        assert_eq!(
            proc.install(2, Box::new(Probe(closed.clone()))),
            Err(Error::DescriptorBusy)
        );
        assert_eq!(closed.get(), 1);
        assert_eq!(proc.reserve(PROCESS_IOMAX as isize), Err(Error::BadDescriptor));
        assert_eq!(proc.close(5), Err(Error::BadDescriptor));
        assert_eq!(proc.close(1), Ok(()));
        assert!(proc.io(1).is_err());
    }

    #[test]
    fn full_descriptor_table() {
        let ram = TestRam::new();
        let mm = ram.memory_manager();
        let mut pm = ProcessManager::init(0, mm.main_tag());
        let proc = pm.current_mut().unwrap();
        for fd in 0..PROCESS_IOMAX {
            assert_eq!(proc.install(-1, empty()), Ok(fd));
        }
        assert_eq!(proc.reserve(-1), Err(Error::TooManyOpenFiles));
    }

    #[test]
    fn create_fills_lowest_slot() {
        let ram = TestRam::new();
        let mm = ram.memory_manager();
        let main = mm.main_tag();
        let mut pm = ProcessManager::init(0, main);
        for pid in 1..NPROC {
            assert_eq!(pm.create(pid + 100, main), Ok(pid));
        }
        assert_eq!(pm.create(999, main), Err(Error::TooManyProcesses));
        assert_eq!(pm.get(3).map(Process::tid), Some(103));
    }

    #[test]
    fn exec_builds_private_space_then_terminate_frees_it() {
        let ram = TestRam::new();
        let mut mm = ram.memory_manager();
        let baseline = mm.free_pages();
        let mut pm = ProcessManager::init(11, mm.main_tag());
        let closed = Rc::new(Cell::new(0));
        let proc = pm.current_mut().unwrap();
        proc.install(0, Box::new(MemIo::new(program()))).unwrap();
        proc.install(1, Box::new(Probe(closed.clone()))).unwrap();

        assert_eq!(pm.exec(&mut mm, 0), Ok(USER_START_VMA));
        let tag = pm.current().unwrap().tag();
        assert_ne!(tag, mm.main_tag());
        assert_eq!(mm.active_tag(), tag);
        let (_, flags) = mm.translate(USER_START_VMA).unwrap();
        assert!(flags.contains(PTEFlags::X | PTEFlags::U));

        // exec again reuses the space
        pm.current_mut()
            .unwrap()
            .io(0)
            .unwrap()
            .ioctl(crate::io::Ioctl::SetPos(0))
            .unwrap();
        assert_eq!(pm.exec(&mut mm, 0), Ok(USER_START_VMA));
        assert_eq!(pm.current().unwrap().tag(), tag);

        assert_eq!(pm.terminate(&mut mm, 0), Ok(11));
        assert_eq!(closed.get(), 1);
        assert!(pm.current().is_none());
        assert_eq!(pm.len(), 0);
        assert_eq!(mm.active_tag(), mm.main_tag());
        assert_eq!(mm.free_pages(), baseline);
    }

    #[test]
    fn exec_of_bad_descriptor_keeps_main_space() {
        let ram = TestRam::new();
        let mut mm = ram.memory_manager();
        let baseline = mm.free_pages();
        let mut pm = ProcessManager::init(0, mm.main_tag());
        assert_eq!(pm.exec(&mut mm, 3), Err(Error::BadDescriptor));
        assert_eq!(pm.current().unwrap().tag(), mm.main_tag());
        assert_eq!(mm.free_pages(), baseline);
    }

    #[test]
    fn terminate_in_main_space_frees_user_pages() {
        let ram = TestRam::new();
        let mut mm = ram.memory_manager();
        let baseline = mm.free_pages();
        let mut pm = ProcessManager::init(0, mm.main_tag());
        mm.handle_page_fault(USER_START_VMA + 0x5000).unwrap();
        assert_eq!(pm.terminate(&mut mm, 0), Ok(0));
        assert_eq!(mm.free_pages(), baseline);
        assert_eq!(pm.terminate(&mut mm, 0), Err(Error::InvalidArgument));
    }
}
