//! Synchronization and interior mutability primitives

mod condition;
mod up;

pub use condition::Condition;
pub use up::UPSafeCell;
