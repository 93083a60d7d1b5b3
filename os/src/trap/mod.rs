//! Trap handling functionality
//!
//! Traps from user mode enter at `__alltraps`, which saves a [`TrapContext`]
//! on the kernel stack and calls [`trap_handler()`]. While the kernel runs,
//! `stvec` points at `__kerneltrap` instead, which only has to deal with
//! device interrupts taken while a thread sleeps on a condition.
//!
//! Deciding what a trap means is done by the kernel object, which answers
//! with a [`Flow`]. Acting on the flow (resuming, entering a new image,
//! retiring the thread) happens here, after every kernel borrow has ended.

mod context;

pub use self::context::TrapContext;

#[cfg(target_arch = "riscv64")]
pub use self::rt::{enter_user, init};

/// What to do with the trapped thread once a trap has been handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Return to the interrupted instruction (or past the `ecall`).
    Resume,
    /// Discard the user context and start at `entry` with stack `sp`.
    EnterUser { entry: usize, sp: usize },
    /// The process is gone; the thread `tid` must never run again.
    Exit(usize),
}

/// Synchronous exception causes (`scause` with the interrupt bit clear).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    SupervisorEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(usize),
}

impl Exception {
    pub fn from_code(code: usize) -> Self {
        match code {
            0 => Self::InstructionMisaligned,
            1 => Self::InstructionFault,
            2 => Self::IllegalInstruction,
            3 => Self::Breakpoint,
            4 => Self::LoadMisaligned,
            5 => Self::LoadFault,
            6 => Self::StoreMisaligned,
            7 => Self::StoreFault,
            8 => Self::UserEnvCall,
            9 => Self::SupervisorEnvCall,
            12 => Self::InstructionPageFault,
            13 => Self::LoadPageFault,
            15 => Self::StorePageFault,
            other => Self::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::InstructionMisaligned => "Misaligned instruction address",
            Self::InstructionFault => "Instruction access fault",
            Self::IllegalInstruction => "Illegal instruction",
            Self::Breakpoint => "Breakpoint",
            Self::LoadMisaligned => "Misaligned load address",
            Self::LoadFault => "Load access fault",
            Self::StoreMisaligned => "Misaligned store address",
            Self::StoreFault => "Store access fault",
            Self::UserEnvCall => "Environment call from U mode",
            Self::SupervisorEnvCall => "Environment call from S mode",
            Self::InstructionPageFault => "Instruction page fault",
            Self::LoadPageFault => "Load page fault",
            Self::StorePageFault => "Store page fault",
            Self::Unknown(_) => "Unknown exception",
        }
    }

    pub fn is_page_fault(&self) -> bool {
        matches!(
            self,
            Self::InstructionPageFault | Self::LoadPageFault | Self::StorePageFault
        )
    }

    /// Faults that kill the offending process rather than the kernel.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            Self::InstructionMisaligned
                | Self::InstructionFault
                | Self::IllegalInstruction
                | Self::LoadMisaligned
                | Self::LoadFault
                | Self::StoreMisaligned
                | Self::StoreFault
        )
    }
}

#[cfg(target_arch = "riscv64")]
mod rt {
    use riscv::register::{
        scause::{self, Scause},
        stval,
        stvec::{self, TrapMode},
    };

    use super::{Exception, Flow, TrapContext};
    use crate::kernel;

    core::arch::global_asm!(include_str!("trap.S"));

    extern "C" {
        fn __alltraps();
        fn __restore(cx_addr: usize) -> !;
        fn __kerneltrap();
    }

    const KERNEL_STACK_SIZE: usize = 4096 * 4;

    #[repr(align(4096))]
    struct KernelStack {
        data: [u8; KERNEL_STACK_SIZE],
    }

    static KERNEL_STACK: KernelStack = KernelStack {
        data: [0; KERNEL_STACK_SIZE],
    };

    impl KernelStack {
        fn get_sp(&self) -> usize {
            self.data.as_ptr() as usize + KERNEL_STACK_SIZE
        }

        fn push_context(&self, cx: TrapContext) -> usize {
            let cx_ptr = (self.get_sp() - core::mem::size_of::<TrapContext>()) as *mut TrapContext;
            unsafe { cx_ptr.write(cx) };
            cx_ptr as usize
        }
    }

    /// Points `stvec` at the supervisor-mode entry.
    pub fn init() {
        set_kernel_trap_entry();
    }

    fn set_kernel_trap_entry() {
        unsafe { stvec::write(__kerneltrap as usize, TrapMode::Direct) };
    }

    fn set_user_trap_entry() {
        unsafe { stvec::write(__alltraps as usize, TrapMode::Direct) };
    }

    /// Leaves the boot stack for good and starts user code at `entry`.
    pub fn enter_user(entry: usize, sp: usize) -> ! {
        let cx = KERNEL_STACK.push_context(TrapContext::app_init_context(entry, sp));
        set_user_trap_entry();
        unsafe { __restore(cx) }
    }

    #[no_mangle]
    /// handle an interrupt, exception, or system call from user space
    pub fn trap_handler(cx: &mut TrapContext) -> &mut TrapContext {
        set_kernel_trap_entry();
        let scause: Scause = scause::read();
        let flow = if scause.is_interrupt() {
            kernel::handle_interrupt(scause.code());
            Flow::Resume
        } else {
            kernel::handle_exception(scause.code(), stval::read(), cx)
        };
        match flow {
            Flow::Resume => {}
            Flow::EnterUser { entry, sp } => *cx = TrapContext::app_init_context(entry, sp),
            Flow::Exit(tid) => kernel::retire(tid),
        }
        set_user_trap_entry();
        cx
    }

    #[no_mangle]
    /// traps taken while the kernel itself runs
    pub fn kernel_trap_handler(cx: &mut TrapContext) {
        let scause: Scause = scause::read();
        if scause.is_interrupt() {
            kernel::handle_interrupt(scause.code());
            return;
        }
        let excp = Exception::from_code(scause.code());
        panic!(
            "{} at {:#x} in kernel, stval = {:#x}",
            excp.name(),
            cx.sepc,
            stval::read()
        );
    }
}
