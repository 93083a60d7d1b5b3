//! Named device instances and interrupt handlers

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::io::Io;

type Opener = Box<dyn Fn() -> Result<Box<dyn Io>>>;

struct DeviceEntry {
    name: &'static str,
    instno: usize,
    open: Opener,
}

/// Maps `(name, instance)` pairs to openers. Instances of one name are
/// numbered from zero in registration order.
#[derive(Default)]
pub struct DeviceManager {
    devices: Vec<DeviceEntry>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        open: impl Fn() -> Result<Box<dyn Io>> + 'static,
    ) -> usize {
        let instno = self.devices.iter().filter(|d| d.name == name).count();
        self.devices.push(DeviceEntry {
            name,
            instno,
            open: Box::new(open),
        });
        debug!("device {}{} registered", name, instno);
        instno
    }

    pub fn open(&self, name: &str, instno: usize) -> Result<Box<dyn Io>> {
        let dev = self
            .devices
            .iter()
            .find(|d| d.name == name && d.instno == instno)
            .ok_or(Error::NoDevice)?;
        (dev.open)()
    }
}

/// Interrupt handlers by source number.
#[derive(Default)]
pub struct IsrTable {
    handlers: Vec<(u32, Box<dyn Fn()>)>,
}

impl IsrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, irqno: u32, isr: Box<dyn Fn()>) {
        self.handlers.push((irqno, isr));
    }

    /// Runs every handler bound to `irqno`; false if there is none.
    pub fn dispatch(&self, irqno: u32) -> bool {
        let mut handled = false;
        for (_, isr) in self.handlers.iter().filter(|(n, _)| *n == irqno) {
            isr();
            handled = true;
        }
        handled
    }
}
