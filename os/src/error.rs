//! Kernel error codes
//!
//! Drivers, the filesystem and the process layer all report failures with
//! [`Error`]. The syscall dispatcher forwards [`Error::code`] to user space
//! unchanged.

use thiserror::Error;

pub const EINVAL: isize = 1;
pub const EBUSY: isize = 2;
pub const ENOTSUP: isize = 3;
pub const ENODEV: isize = 4;
pub const EIO: isize = 5;
pub const EBADFMT: isize = 6;
pub const ENOENT: isize = 7;
pub const EACCESS: isize = 8;
pub const EBADFD: isize = 9;
pub const EMFILE: isize = 10;
pub const EFBIG: isize = 11;
pub const ENOSPC: isize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no such file")]
    NotFound,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("file descriptor already in use")]
    DescriptorBusy,
    #[error("device busy")]
    Busy,
    #[error("I/O error")]
    Io,
    #[error("bad executable format")]
    BadFormat,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("process table full")]
    TooManyProcesses,
    #[error("file too large")]
    FileTooLarge,
    #[error("no space left on device")]
    NoSpace,
    #[error("bad user address")]
    BadAddress,
    #[error("no such device")]
    NoDevice,
}

impl Error {
    /// Negative value returned to user space.
    pub fn code(self) -> isize {
        -match self {
            Error::NotFound => ENOENT,
            Error::BadDescriptor => EBADFD,
            Error::DescriptorBusy | Error::Busy => EBUSY,
            Error::Io => EIO,
            Error::BadFormat => EBADFMT,
            Error::InvalidArgument => EINVAL,
            Error::NotSupported => ENOTSUP,
            Error::TooManyOpenFiles | Error::TooManyProcesses => EMFILE,
            Error::FileTooLarge => EFBIG,
            Error::NoSpace => ENOSPC,
            Error::BadAddress => EACCESS,
            Error::NoDevice => ENODEV,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct_for_lookup_failures() {
        assert_eq!(Error::NotFound.code(), -ENOENT);
        assert_eq!(Error::BadDescriptor.code(), -EBADFD);
        assert_ne!(Error::NotFound.code(), Error::Io.code());
        assert!(Error::NoDevice.code() < 0);
    }
}
