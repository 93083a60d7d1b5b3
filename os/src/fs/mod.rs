//! Flat filesystem: a single directory of fixed-size inode files

mod kfs;
pub mod layout;

pub use kfs::{FileHandle, FileSystem};
