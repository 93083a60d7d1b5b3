//! Processes: address space, descriptor table and serving thread

mod process;

pub use self::process::{Process, ProcessManager};
