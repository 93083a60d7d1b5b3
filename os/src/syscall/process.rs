//! Process management syscalls

use super::USER_STR_MAX;
use crate::config::USER_END_VMA;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::mm::{Mmu, PTEFlags};
use crate::trap::Flow;

impl<M: Mmu> Kernel<M> {
    /// current process exits; its thread never returns to user space
    pub(super) fn sys_exit(&mut self) -> Flow {
        let tid = Self::running(&mut self.procs).tid();
        println!("[kernel] Thread {} exiting due to syscall", tid);
        self.terminate_current()
    }

    /// Replaces the current image with the executable open at `fd`.
    ///
    /// On success the user context is discarded: execution restarts at the
    /// new entry with an empty stack at the top of the user window.
    pub(super) fn sys_exec(&mut self, fd: isize) -> Result<Flow> {
        let entry = self.procs.exec(&mut self.mm, fd)?;
        Ok(Flow::EnterUser {
            entry,
            sp: USER_END_VMA,
        })
    }

    /// Prints a NUL-terminated message on behalf of the current thread.
    pub(super) fn sys_msgout(&mut self, msg: usize) -> Result<usize> {
        let msg = self
            .mm
            .read_user_cstr(msg, PTEFlags::R | PTEFlags::U, USER_STR_MAX)
            .map_err(|e| {
                warn!("msgout: invalid message at {:#x}", msg);
                e
            })?;
        let tid = Self::running(&mut self.procs).tid();
        println!("Thread {} says: {}", tid, msg);
        Ok(0)
    }
}
