use core::arch::asm;
use core::ptr;

use riscv::register::sstatus;

use crate::drivers::InterruptController;
use crate::sync::Condition;

pub fn intr_enabled() -> bool {
    sstatus::read().sie()
}

/// Clears `sstatus.SIE` and returns whether it was set.
pub fn intr_disable() -> bool {
    let was_enabled = intr_enabled();
    unsafe { sstatus::clear_sie() };
    was_enabled
}

pub fn intr_restore(was_enabled: bool) {
    if was_enabled {
        unsafe { sstatus::set_sie() };
    }
}

/// Sleeps the hart until the next interrupt.
///
/// `wfi` wakes on a pending interrupt even with `SIE` clear. The window with
/// `SIE` set lets the handler run before the caller rechecks its predicate,
/// so a completion arriving between the check and the `wfi` is never lost.
pub struct WfiCondition {
    pub name: &'static str,
}

impl Condition for WfiCondition {
    fn wait(&self) {
        unsafe {
            asm!("wfi");
            sstatus::set_sie();
            sstatus::clear_sie();
        }
    }

    /// The interrupt that ends `wfi` is the wakeup.
    fn broadcast(&self) {}
}

const PLIC_BASE: usize = 0x0c00_0000;
const PLIC_ENABLE: usize = PLIC_BASE + 0x2000;
const PLIC_CONTEXT: usize = PLIC_BASE + 0x20_0000;
/// supervisor context of hart 0
const PLIC_SCTX: usize = 1;

/// QEMU `virt` platform interrupt controller, supervisor context of hart 0.
pub struct Plic;

impl Plic {
    fn reg(off: usize) -> *mut u32 {
        off as *mut u32
    }

    /// Accepts every priority above zero.
    pub fn init(&self) {
        unsafe { ptr::write_volatile(Self::reg(PLIC_CONTEXT + PLIC_SCTX * 0x1000), 0) };
    }

    pub fn claim(&self) -> u32 {
        unsafe { ptr::read_volatile(Self::reg(PLIC_CONTEXT + PLIC_SCTX * 0x1000 + 4)) }
    }

    pub fn complete(&self, irqno: u32) {
        unsafe { ptr::write_volatile(Self::reg(PLIC_CONTEXT + PLIC_SCTX * 0x1000 + 4), irqno) };
    }

    fn enable_word(irqno: u32) -> (*mut u32, u32) {
        let word = PLIC_ENABLE + PLIC_SCTX * 0x80 + (irqno as usize / 32) * 4;
        (Self::reg(word), 1 << (irqno % 32))
    }
}

impl InterruptController for Plic {
    fn enable_irq(&self, irqno: u32) {
        let (word, bit) = Self::enable_word(irqno);
        unsafe {
            ptr::write_volatile(Self::reg(PLIC_BASE + irqno as usize * 4), 1);
            ptr::write_volatile(word, ptr::read_volatile(word) | bit);
        }
    }

    fn disable_irq(&self, irqno: u32) {
        let (word, bit) = Self::enable_word(irqno);
        unsafe { ptr::write_volatile(word, ptr::read_volatile(word) & !bit) };
    }
}
