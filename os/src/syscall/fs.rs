//! File and device syscalls

use alloc::boxed::Box;
use alloc::vec;

use super::USER_STR_MAX;
use crate::error::{Error, Result};
use crate::io::Ioctl;
use crate::kernel::Kernel;
use crate::mm::{Mmu, PTEFlags};

impl<M: Mmu> Kernel<M> {
    fn user_str(&self, va: usize) -> Result<alloc::string::String> {
        self.mm.read_user_cstr(va, PTEFlags::R | PTEFlags::U, USER_STR_MAX)
    }

    /// Opens instance `instno` of device `name` at `fd`.
    pub(super) fn sys_devopen(&mut self, fd: isize, name: usize, instno: usize) -> Result<usize> {
        let name = self.user_str(name)?;
        let fd = Self::running(&mut self.procs).reserve(fd)?;
        let io = self.devices.open(&name, instno).map_err(|e| {
            debug!("devopen: {}{}: {}", name, instno, e);
            e
        })?;
        Self::running(&mut self.procs).install(fd as isize, io)
    }

    /// Opens file `name` of the mounted filesystem at `fd`.
    pub(super) fn sys_fsopen(&mut self, fd: isize, name: usize) -> Result<usize> {
        let name = self.user_str(name)?;
        let fd = Self::running(&mut self.procs).reserve(fd)?;
        let fs = self.fs.as_ref().ok_or(Error::NoDevice)?;
        let file = fs.open(&name).map_err(|e| {
            debug!("fsopen: {}: {}", name, e);
            e
        })?;
        Self::running(&mut self.procs).install(fd as isize, Box::new(file))
    }

    pub(super) fn sys_close(&mut self, fd: isize) -> Result<usize> {
        Self::running(&mut self.procs).close(fd)?;
        Ok(0)
    }

    /// Reads up to `len` bytes from `fd` into the user buffer at `buf`.
    pub(super) fn sys_read(&mut self, fd: isize, buf: usize, len: usize) -> Result<usize> {
        let io = Self::running(&mut self.procs).io(fd)?;
        let flags = PTEFlags::W | PTEFlags::U;
        if !self.mm.validate_region(buf, len, flags) {
            return Err(Error::BadAddress);
        }
        let mut kbuf = vec![0u8; len];
        let n = io.read(&mut kbuf)?;
        self.mm.copy_to_user(buf, &kbuf[..n], flags)?;
        Ok(n)
    }

    /// Writes `len` bytes of the user buffer at `buf` to `fd`.
    pub(super) fn sys_write(&mut self, fd: isize, buf: usize, len: usize) -> Result<usize> {
        let io = Self::running(&mut self.procs).io(fd)?;
        let flags = PTEFlags::R | PTEFlags::U;
        if !self.mm.validate_region(buf, len, flags) {
            return Err(Error::BadAddress);
        }
        let mut kbuf = vec![0u8; len];
        self.mm.copy_from_user(buf, &mut kbuf, flags)?;
        io.write(&kbuf)
    }

    /// `arg` points at the 64-bit value a getter stores or a setter takes.
    pub(super) fn sys_ioctl(&mut self, fd: isize, cmd: usize, arg: usize) -> Result<usize> {
        let io = Self::running(&mut self.procs).io(fd)?;
        let value = if Ioctl::takes_arg(cmd) {
            let mut word = [0u8; 8];
            self.mm.copy_from_user(arg, &mut word, PTEFlags::R | PTEFlags::U)?;
            u64::from_le_bytes(word)
        } else {
            0
        };
        let req = Ioctl::from_raw(cmd, value)?;
        let returns_value = matches!(req, Ioctl::GetLen | Ioctl::GetPos | Ioctl::GetBlkSz);
        let flags = PTEFlags::W | PTEFlags::U;
        if returns_value && !self.mm.validate_region(arg, 8, flags) {
            return Err(Error::BadAddress);
        }
        let out = io.ioctl(req)?;
        if returns_value {
            self.mm.copy_to_user(arg, &out.to_le_bytes(), flags)?;
        }
        Ok(0)
    }
}
