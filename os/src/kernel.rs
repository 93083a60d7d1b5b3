//! The kernel object: memory, processes, devices and the mounted filesystem
//!
//! Everything a trap may touch hangs off one [`Kernel`]. On the target a
//! single instance lives in `KERNEL`; interrupt handlers are kept apart in
//! `ISRS` so an interrupt taken while a syscall sleeps never needs the
//! kernel borrow.

use crate::drivers::DeviceManager;
use crate::fs::FileSystem;
use crate::mm::{MemoryManager, Mmu};
use crate::task::{Process, ProcessManager};
use crate::trap::{Exception, Flow, TrapContext};

pub struct Kernel<M: Mmu> {
    pub mm: MemoryManager<M>,
    pub procs: ProcessManager,
    pub devices: DeviceManager,
    pub fs: Option<FileSystem>,
}

impl<M: Mmu> Kernel<M> {
    /// Wraps a booted memory manager; the calling thread `tid` becomes
    /// process 0.
    pub fn new(
        mm: MemoryManager<M>,
        devices: DeviceManager,
        fs: Option<FileSystem>,
        tid: usize,
    ) -> Self {
        let procs = ProcessManager::init(tid, mm.main_tag());
        Self {
            mm,
            procs,
            devices,
            fs,
        }
    }

    pub(crate) fn running(procs: &mut ProcessManager) -> &mut Process {
        match procs.current_mut() {
            Some(proc) => proc,
            None => panic!("trap without a current process"),
        }
    }

    /// Handles exception `code` raised by user code at `cx.sepc`.
    pub fn handle_exception(&mut self, code: usize, stval: usize, cx: &mut TrapContext) -> Flow {
        let excp = Exception::from_code(code);
        trace!("{} at {:#x}, stval {:#x}", excp.name(), cx.sepc, stval);
        match excp {
            Exception::UserEnvCall => self.syscall(cx),
            _ if excp.is_page_fault() => match self.mm.handle_page_fault(stval) {
                Ok(()) => Flow::Resume,
                Err(_) => {
                    warn!(
                        "{} at {:#x}, bad addr = {:#x}, process killed",
                        excp.name(),
                        cx.sepc,
                        stval
                    );
                    self.terminate_current()
                }
            },
            _ if excp.is_fatal_to_process() => {
                warn!("{} at {:#x}, process killed", excp.name(), cx.sepc);
                self.terminate_current()
            }
            _ => panic!("{} at {:#x}", excp.name(), cx.sepc),
        }
    }

    /// Tears down the current process and hands its thread back.
    pub fn terminate_current(&mut self) -> Flow {
        let pid = Self::running(&mut self.procs).pid();
        match self.procs.terminate(&mut self.mm, pid) {
            Ok(tid) => Flow::Exit(tid),
            Err(e) => panic!("terminate({}): {}", pid, e),
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use self::rt::{boot, handle_exception, handle_interrupt, retire};

#[cfg(target_arch = "riscv64")]
mod rt {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use lazy_static::*;
    use riscv::register::sie;

    use super::Kernel;
    use crate::arch::{Plic, WfiCondition};
    use crate::config::{
        USER_END_VMA, VIRTIO0_IOBASE, VIRTIO0_IRQNO, VIRTIO_IOBASE_STRIDE, VIRTIO_SLOTS,
    };
    use crate::drivers::virtio::MmioBus;
    use crate::drivers::{DeviceManager, InterruptController, IsrTable, VioBlk};
    use crate::fs::FileSystem;
    use crate::mm::{self, Satp};
    use crate::sync::UPSafeCell;
    use crate::trap::{self, Flow, TrapContext};
    use crate::{logging, sbi};

    /// supervisor external interrupt
    const IRQ_S_EXT: usize = 9;

    lazy_static! {
        static ref KERNEL: UPSafeCell<Option<Kernel<Satp>>> = unsafe { UPSafeCell::new(None) };
        static ref ISRS: UPSafeCell<IsrTable> = unsafe { UPSafeCell::new(IsrTable::new()) };
    }

    fn probe_devices(devices: &mut DeviceManager) {
        let plic: Rc<dyn InterruptController> = Rc::new(Plic);
        let mut isrs = ISRS.exclusive_access();
        for slot in 0..VIRTIO_SLOTS {
            let base = VIRTIO0_IOBASE + slot * VIRTIO_IOBASE_STRIDE;
            let irqno = VIRTIO0_IRQNO + slot as u32;
            let bus = unsafe { MmioBus::new(base) };
            let cond = WfiCondition { name: "vioblk" };
            match VioBlk::attach(bus, irqno, plic.clone(), cond) {
                Ok(dev) => {
                    let instno = dev.register(devices, &mut isrs);
                    info!("vioblk{} at {:#x}, irq {}", instno, base, irqno);
                }
                Err(e) => trace!("virtio slot {}: {}", slot, e),
            }
        }
    }

    /// Brings the kernel up and runs `init` from the first block device.
    pub fn boot(init: &str) -> ! {
        logging::init();
        let mm = mm::init();
        trap::init();
        Plic.init();
        let mut devices = DeviceManager::new();
        probe_devices(&mut devices);
        unsafe { sie::set_sext() };

        let fs = match devices.open("blk", 0).and_then(FileSystem::mount) {
            Ok(fs) => fs,
            Err(e) => panic!("mount blk0: {}", e),
        };
        let mut kernel = Kernel::new(mm, devices, Some(fs.clone()), 0);
        let entry = fs
            .open(init)
            .and_then(|file| Kernel::<Satp>::running(&mut kernel.procs).install(-1, Box::new(file)))
            .and_then(|fd| kernel.procs.exec(&mut kernel.mm, fd as isize));
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => panic!("exec {}: {}", init, e),
        };
        *KERNEL.exclusive_access() = Some(kernel);
        trap::enter_user(entry, USER_END_VMA)
    }

    pub fn handle_exception(code: usize, stval: usize, cx: &mut TrapContext) -> Flow {
        let mut kernel = KERNEL.exclusive_access();
        match kernel.as_mut() {
            Some(kernel) => kernel.handle_exception(code, stval, cx),
            None => panic!("user trap before boot"),
        }
    }

    pub fn handle_interrupt(code: usize) {
        if code != IRQ_S_EXT {
            warn!("unexpected interrupt {}", code);
            return;
        }
        let irqno = Plic.claim();
        if irqno != 0 && !ISRS.exclusive_access().dispatch(irqno) {
            warn!("no handler for irq {}", irqno);
        }
        Plic.complete(irqno);
    }

    /// With one kernel thread, a retired thread leaves nothing to run.
    pub fn retire(tid: usize) -> ! {
        info!("thread {} retired", tid);
        sbi::shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{USER_END_VMA, USER_START_VMA};
    use crate::mm::{PTEFlags, SoftMmu};
    use crate::testing::TestRam;

    fn kernel(ram: &TestRam) -> Kernel<SoftMmu> {
        Kernel::new(ram.memory_manager(), DeviceManager::new(), None, 5)
    }

    fn trap(k: &mut Kernel<SoftMmu>, code: usize, stval: usize) -> Flow {
        let mut cx = TrapContext::default();
        cx.sepc = USER_START_VMA + 0x40;
        k.handle_exception(code, stval, &mut cx)
    }

    #[test]
    fn page_fault_in_window_maps_and_resumes() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        let va = USER_END_VMA - 0x10;
        assert_eq!(trap(&mut k, 15, va), Flow::Resume);
        assert!(k.mm.validate_region(va, 0x10, PTEFlags::R | PTEFlags::W | PTEFlags::U));
    }

    #[test]
    fn bad_faults_kill_the_process() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        let baseline = k.mm.free_pages();
        assert_eq!(trap(&mut k, 13, USER_START_VMA), Flow::Resume);
        // second fault on a mapped page is a permission fault
        assert_eq!(trap(&mut k, 15, USER_START_VMA), Flow::Exit(5));
        assert_eq!(k.mm.free_pages(), baseline);
        assert!(k.procs.current().is_none());
    }

    #[test]
    fn fault_outside_user_window() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        assert_eq!(trap(&mut k, 13, 0x1000), Flow::Exit(5));
    }

    #[test]
    fn illegal_instruction_kills() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        assert_eq!(trap(&mut k, 2, 0), Flow::Exit(5));
    }

    #[test]
    #[should_panic(expected = "Breakpoint")]
    fn breakpoint_panics() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        trap(&mut k, 3, 0);
    }

    #[test]
    #[should_panic(expected = "Environment call from S mode")]
    fn supervisor_ecall_panics() {
        let ram = TestRam::new();
        let mut k = kernel(&ram);
        trap(&mut k, 9, 0);
    }
}
