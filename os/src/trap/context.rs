//! Registers saved across a trap from user mode

const SSTATUS_SPIE: usize = 1 << 5;
const SSTATUS_SPP: usize = 1 << 8;

/// Layout shared with `trap.S`: 32 general registers, `sstatus`, `sepc`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapContext {
    /// general regs[0..31]
    pub x: [usize; 32],
    /// CSR sstatus
    pub sstatus: usize,
    /// CSR sepc
    pub sepc: usize,
}

impl TrapContext {
    pub const A0: usize = 10;
    pub const A7: usize = 17;

    /// set stack pointer to x_2 reg (sp)
    pub fn set_sp(&mut self, sp: usize) {
        self.x[2] = sp;
    }

    /// Syscall number and its three arguments.
    pub fn syscall_args(&self) -> (usize, [usize; 3]) {
        (self.x[Self::A7], [self.x[10], self.x[11], self.x[12]])
    }

    pub fn set_return(&mut self, value: usize) {
        self.x[Self::A0] = value;
    }

    /// Context that `sret`s to `entry` in user mode with interrupts on and
    /// every other register zero.
    pub fn app_init_context(entry: usize, sp: usize) -> Self {
        let mut cx = Self {
            x: [0; 32],
            sstatus: (current_sstatus() & !SSTATUS_SPP) | SSTATUS_SPIE,
            sepc: entry,
        };
        cx.set_sp(sp);
        cx
    }
}

#[cfg(target_arch = "riscv64")]
fn current_sstatus() -> usize {
    riscv::register::sstatus::read().bits()
}

#[cfg(not(target_arch = "riscv64"))]
fn current_sstatus() -> usize {
    0
}
