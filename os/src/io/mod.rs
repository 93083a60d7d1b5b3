//! The byte-stream interface shared by devices, files and descriptors

mod lit;

pub use lit::MemIo;

use crate::error::{Error, Result};

pub const IOCTL_GETLEN: usize = 1;
pub const IOCTL_SETLEN: usize = 2;
pub const IOCTL_GETPOS: usize = 3;
pub const IOCTL_SETPOS: usize = 4;
pub const IOCTL_FLUSH: usize = 5;
pub const IOCTL_GETBLKSZ: usize = 6;

/// Control requests understood by [`Io::ioctl`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ioctl {
    GetLen,
    SetLen(u64),
    GetPos,
    SetPos(u64),
    Flush,
    GetBlkSz,
}

impl Ioctl {
    /// Decodes a numeric command; `arg` is only used by the setters.
    pub fn from_raw(cmd: usize, arg: u64) -> Result<Self> {
        Ok(match cmd {
            IOCTL_GETLEN => Ioctl::GetLen,
            IOCTL_SETLEN => Ioctl::SetLen(arg),
            IOCTL_GETPOS => Ioctl::GetPos,
            IOCTL_SETPOS => Ioctl::SetPos(arg),
            IOCTL_FLUSH => Ioctl::Flush,
            IOCTL_GETBLKSZ => Ioctl::GetBlkSz,
            _ => return Err(Error::NotSupported),
        })
    }

    /// Whether the command reads its argument from the caller.
    pub fn takes_arg(cmd: usize) -> bool {
        matches!(cmd, IOCTL_SETLEN | IOCTL_SETPOS)
    }
}

/// A positioned byte stream.
///
/// `read` and `write` move the stream position by the count they return.
/// Backends that cannot resize or flush answer `SetLen`/`Flush` with
/// [`Error::NotSupported`].
pub trait Io {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// Getters return the requested value, setters return `0`.
    fn ioctl(&mut self, cmd: Ioctl) -> Result<u64>;
    /// Releases whatever the stream holds. Calling it twice is harmless.
    fn close(&mut self) {}
}

impl<T: Io + ?Sized> Io for alloc::boxed::Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u64> {
        (**self).ioctl(cmd)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub fn seek(io: &mut (impl Io + ?Sized), pos: u64) -> Result<()> {
    io.ioctl(Ioctl::SetPos(pos)).map(|_| ())
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
pub fn read_full(io: &mut (impl Io + ?Sized), buf: &mut [u8]) -> Result<usize> {
    let mut acc = 0;
    while acc < buf.len() {
        match io.read(&mut buf[acc..])? {
            0 => break,
            n => acc += n,
        }
    }
    Ok(acc)
}

/// Writes all of `buf` unless the stream stops accepting bytes.
pub fn write_full(io: &mut (impl Io + ?Sized), buf: &[u8]) -> Result<usize> {
    let mut acc = 0;
    while acc < buf.len() {
        match io.write(&buf[acc..])? {
            0 => break,
            n => acc += n,
        }
    }
    Ok(acc)
}
