//! Implementation of syscalls
//!
//! The single entry point to all system calls, [`Kernel::syscall`], is
//! called whenever user space wishes to perform a system call using the
//! `ecall` instruction. The number is in `a7`, up to three arguments are in
//! `a0..a2`, and the result (a negative error code on failure) goes back in
//! `a0`.

mod fs;
mod process;

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::mm::Mmu;
use crate::trap::{Flow, TrapContext};

pub const SYSCALL_EXIT: usize = 0;
pub const SYSCALL_MSGOUT: usize = 1;
pub const SYSCALL_DEVOPEN: usize = 2;
pub const SYSCALL_FSOPEN: usize = 3;
pub const SYSCALL_CLOSE: usize = 4;
pub const SYSCALL_READ: usize = 5;
pub const SYSCALL_WRITE: usize = 6;
pub const SYSCALL_IOCTL: usize = 7;
pub const SYSCALL_EXEC: usize = 8;

/// Longest string accepted from user space, NUL excluded.
const USER_STR_MAX: usize = 4096;

/// Descriptor arguments are C `int`s.
fn fd_arg(raw: usize) -> isize {
    raw as i32 as isize
}

impl<M: Mmu> Kernel<M> {
    /// Runs the syscall `cx` trapped on.
    pub fn syscall(&mut self, cx: &mut TrapContext) -> Flow {
        cx.sepc += 4;
        let (id, args) = cx.syscall_args();
        let ret: Result<usize> = match id {
            SYSCALL_EXIT => return self.sys_exit(),
            SYSCALL_EXEC => match self.sys_exec(fd_arg(args[0])) {
                Ok(flow) => return flow,
                Err(e) => Err(e),
            },
            SYSCALL_MSGOUT => self.sys_msgout(args[0]),
            SYSCALL_DEVOPEN => self.sys_devopen(fd_arg(args[0]), args[1], args[2]),
            SYSCALL_FSOPEN => self.sys_fsopen(fd_arg(args[0]), args[1]),
            SYSCALL_CLOSE => self.sys_close(fd_arg(args[0])),
            SYSCALL_READ => self.sys_read(fd_arg(args[0]), args[1], args[2]),
            SYSCALL_WRITE => self.sys_write(fd_arg(args[0]), args[1], args[2]),
            SYSCALL_IOCTL => self.sys_ioctl(fd_arg(args[0]), args[1], args[2]),
            _ => {
                warn!("invalid syscall {}", id);
                Err(Error::NotSupported)
            }
        };
        match ret {
            Ok(value) => cx.set_return(value),
            Err(e) => {
                debug!("syscall {} failed: {}", id, e);
                cx.set_return(e.code() as usize);
            }
        }
        Flow::Resume
    }
}
