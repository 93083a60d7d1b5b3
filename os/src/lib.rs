//! The memory and process core of a small RISC-V (Sv39) kernel
//!
//! - [`mm`]: physical pages, page tables and address spaces
//! - [`task`]: processes and their descriptor tables
//! - [`trap`] and [`syscall`]: the user/kernel boundary
//! - [`drivers`] and [`fs`]: the virtio block device and the filesystem
//!   executables are loaded from
//!
//! Everything that touches the hart or the platform is compiled for
//! `riscv64` only. On any other target the crate builds as a plain library
//! whose unit tests run against simulated RAM and devices.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
mod console;

pub mod arch;
pub mod arena;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod io;
pub mod kernel;
#[cfg(all(target_arch = "riscv64", not(test)))]
mod lang_items;
pub mod loader;
pub mod logging;
pub mod mm;
pub mod sbi;
pub mod sync;
pub mod syscall;
pub mod task;
#[cfg(test)]
mod testing;
pub mod trap;
