#[cfg(target_arch = "riscv64")]
use core::arch::asm;

#[cfg(target_arch = "riscv64")]
const SBI_CONSOLE_PUTCHAR: usize = 1;
#[cfg(target_arch = "riscv64")]
const SBI_SHUTDOWN: usize = 8;

///  handle SBI call with `which` SBI_id and other arguments
#[cfg(target_arch = "riscv64")]
#[inline(always)]
fn sbi_call(which: usize, arg0: usize, arg1: usize, arg2: usize) -> usize {
    let mut ret;
    unsafe {
        asm!(
            "li x16, 0",
            "ecall",
            inlateout("x10") arg0 => ret,
            in("x11") arg1,
            in("x12") arg2,
            in("x17") which,
        );
    }
    ret
}

/// use sbi call to putchar in console (qemu uart handler)
#[cfg(target_arch = "riscv64")]
pub fn console_putchar(c: usize) {
    sbi_call(SBI_CONSOLE_PUTCHAR, c, 0, 0);
}

/// Host builds have no firmware console.
#[cfg(not(target_arch = "riscv64"))]
pub fn console_putchar(_c: usize) {}

/// use sbi call to shutdown the kernel
#[cfg(target_arch = "riscv64")]
pub fn shutdown() -> ! {
    sbi_call(SBI_SHUTDOWN, 0, 0, 0);
    loop {
        unsafe { asm!("wfi") };
    }
}
