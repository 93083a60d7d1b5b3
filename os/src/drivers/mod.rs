//! Device drivers and the registry `devopen` resolves names through

pub mod device;
pub mod vioblk;
pub mod virtio;

pub use device::{DeviceManager, IsrTable};
pub use vioblk::{VioBlk, VioBlkIo};

/// Routes one interrupt source to this hart.
pub trait InterruptController {
    fn enable_irq(&self, irqno: u32);
    fn disable_irq(&self, irqno: u32);
}
