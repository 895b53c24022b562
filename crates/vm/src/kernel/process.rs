//! Process accounting: spawn, exit, yield, wait.
//!
//! The machine is single-threaded and has no scheduler, so a spawned image
//! is validated, accounted in the handle table, and immediately recorded as
//! exited with status 0; `wait` reaps it synchronously. The argv convention
//! matches the loader's: a pointer array of `argc` entries, each addressing
//! a NUL-terminated string.

use crate::error::{ErrorKind, SyscallResult};
use crate::layout::{MAX_PATH_LEN, MAX_SPAWN_ARGS};
use crate::mem::Memory;

use super::handle::{Handle, HandleSlot};
use super::uaccess;
use super::{BasinKernel, SyscallOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawned,
    Exited,
}

#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub handle: Handle,
    pub image: String,
    pub argc: u64,
    pub state: ProcessState,
    pub exit_status: u64,
}

impl BasinKernel {
    pub(crate) fn sys_spawn(
        &mut self,
        exec_ptr: u64,
        args_ptr: u64,
        argc: u64,
        mem: &Memory,
    ) -> SyscallResult {
        if argc > MAX_SPAWN_ARGS {
            return Err(ErrorKind::InvalidArgument);
        }
        let image = uaccess::read_cstring(mem, exec_ptr, MAX_PATH_LEN)?;
        if image.is_empty() {
            // Nothing resolvable behind an empty path.
            return Err(ErrorKind::NotFound);
        }
        // The whole argv array and every string it points at must be
        // readable before a table slot is claimed.
        if argc > 0 {
            uaccess::check_range(mem, args_ptr, argc * 8)?;
            for i in 0..argc {
                let ptr = uaccess::read_u64(mem, args_ptr + i * 8)?;
                uaccess::read_cstring(mem, ptr, MAX_PATH_LEN)?;
            }
        }
        let index = self.handles.free_index().ok_or(ErrorKind::OutOfMemory)?;
        let handle = self.alloc_handle();
        log::debug!("spawn {image:?} argc={argc} -> {handle}");
        self.handles.set(
            index,
            HandleSlot::Process(ProcessEntry {
                handle,
                image,
                argc,
                state: ProcessState::Exited,
                exit_status: 0,
            }),
        );
        Ok(handle.value())
    }

    pub(crate) fn sys_exit(&mut self, status: u64) -> SyscallOutcome {
        // Status codes are 32-bit by convention; anything wider cannot be
        // reported faithfully and is refused without halting.
        if status > u64::from(u32::MAX) {
            return SyscallOutcome::Return(Err(ErrorKind::InvalidArgument));
        }
        SyscallOutcome::Exit(status)
    }

    pub(crate) fn sys_yield(&mut self) -> SyscallResult {
        self.yield_count += 1;
        Ok(0)
    }

    pub(crate) fn sys_wait(&mut self, pid: u64) -> SyscallResult {
        let handle = Handle::new(pid);
        if handle.is_invalid() {
            return Err(ErrorKind::InvalidArgument);
        }
        let entry = self.handles.process(handle).ok_or(ErrorKind::NotFound)?;
        match entry.state {
            ProcessState::Exited => {
                let status = entry.exit_status;
                self.handles.release(handle);
                Ok(status)
            }
            ProcessState::Spawned => Err(ErrorKind::WouldBlock),
        }
    }
}
