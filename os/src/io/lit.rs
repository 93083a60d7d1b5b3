//! Fixed-size in-memory stream

use alloc::vec::Vec;

use super::{Io, Ioctl};
use crate::error::{Error, Result};

/// Reads and writes a byte buffer in place. The length never changes.
pub struct MemIo<B = Vec<u8>> {
    buf: B,
    pos: usize,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> MemIo<B> {
    pub fn new(buf: B) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    fn len(&self) -> usize {
        self.buf.as_ref().len()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Io for MemIo<B> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.len() - self.pos);
        buf[..n].copy_from_slice(&self.buf.as_ref()[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = buf.len().min(self.len() - self.pos);
        let pos = self.pos;
        self.buf.as_mut()[pos..pos + n].copy_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u64> {
        match cmd {
            Ioctl::GetLen => Ok(self.len() as u64),
            Ioctl::GetPos => Ok(self.pos as u64),
            Ioctl::SetPos(pos) if pos as usize <= self.len() => {
                self.pos = pos as usize;
                Ok(0)
            }
            Ioctl::SetPos(_) => Err(Error::InvalidArgument),
            Ioctl::GetBlkSz => Ok(1),
            Ioctl::SetLen(_) | Ioctl::Flush => Err(Error::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn reads_clamp_at_end() {
        let mut io = MemIo::new(b"hello".to_vec());
        io.ioctl(Ioctl::SetPos(3)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(io.read(&mut buf), Ok(0));
        assert_eq!(io.ioctl(Ioctl::GetPos), Ok(5));
    }

    #[test]
    fn writes_never_grow_the_buffer() {
        let mut io = MemIo::new(vec![0u8; 4]);
        assert_eq!(io.write(b"abcdef"), Ok(4));
        assert_eq!(io.write(b"x"), Ok(0));
        assert_eq!(io.ioctl(Ioctl::SetLen(8)), Err(Error::NotSupported));
        assert_eq!(io.ioctl(Ioctl::SetPos(5)), Err(Error::InvalidArgument));
        assert_eq!(io.into_inner(), b"abcd");
    }
}
