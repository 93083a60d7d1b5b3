//! Hart-level primitives: interrupt enable state and the PLIC

#[cfg(not(target_arch = "riscv64"))]
mod host;
#[cfg(target_arch = "riscv64")]
mod riscv64;

#[cfg(not(target_arch = "riscv64"))]
pub use self::host::*;
#[cfg(target_arch = "riscv64")]
pub use self::riscv64::*;

/// Disables supervisor interrupts until dropped, then restores the
/// previous state.
pub struct IntrGuard {
    was_enabled: bool,
}

impl IntrGuard {
    pub fn new() -> Self {
        Self {
            was_enabled: intr_disable(),
        }
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        intr_restore(self.was_enabled);
    }
}
