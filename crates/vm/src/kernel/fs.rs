//! File handles and the open/read/write/close syscalls.
//!
//! There is no filesystem behind these handles in this version: `open`
//! validates and records the path, `write` reports progress, `read` finds
//! nothing to return. The handle table mechanics are real and are what the
//! contracts exercise.

use bitflags::bitflags;

use crate::error::{ErrorKind, SyscallResult};
use crate::layout::MAX_PATH_LEN;
use crate::mem::Memory;

use super::handle::{FileEntry, Handle, HandleSlot};
use super::uaccess;
use super::BasinKernel;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        const READ = 1;
        const WRITE = 2;
        const CREATE = 4;
        const TRUNCATE = 8;
        const APPEND = 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Deleted,
}

impl BasinKernel {
    pub(crate) fn sys_open(&mut self, path_ptr: u64, flags: u64, mem: &Memory) -> SyscallResult {
        let flags = OpenFlags::from_bits(flags).ok_or(ErrorKind::InvalidArgument)?;
        let path = uaccess::read_cstring(mem, path_ptr, MAX_PATH_LEN)?;
        if path.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        let index = self.handles.free_index().ok_or(ErrorKind::OutOfMemory)?;
        let handle = self.alloc_handle();
        log::debug!("open {path:?} {flags:?} -> {handle}");
        self.handles.set(
            index,
            HandleSlot::File(FileEntry {
                handle,
                path,
                flags,
                state: FileState::Open,
                bytes_written: 0,
            }),
        );
        Ok(handle.value())
    }

    pub(crate) fn sys_read(&mut self, handle: u64, buf: u64, len: u64, mem: &Memory) -> SyscallResult {
        let handle = Handle::new(handle);
        if handle.is_invalid() {
            return Err(ErrorKind::InvalidArgument);
        }
        if self.handles.file(handle).is_none() {
            return Err(ErrorKind::NotFound);
        }
        uaccess::check_range(mem, buf, len)?;
        // No backing content to copy out.
        Ok(0)
    }

    pub(crate) fn sys_write(&mut self, handle: u64, buf: u64, len: u64, mem: &Memory) -> SyscallResult {
        let handle = Handle::new(handle);
        if handle.is_invalid() {
            return Err(ErrorKind::InvalidArgument);
        }
        let entry = self.handles.file_mut(handle).ok_or(ErrorKind::NotFound)?;
        uaccess::check_range(mem, buf, len)?;
        entry.bytes_written += len;
        Ok(len)
    }

    /// Close any process, file, or channel handle.
    pub(crate) fn sys_close(&mut self, handle: u64) -> SyscallResult {
        let handle = Handle::new(handle);
        if handle.is_invalid() {
            return Err(ErrorKind::InvalidArgument);
        }
        if let Some(entry) = self.handles.file_mut(handle) {
            entry.state = FileState::Deleted;
        }
        if self.handles.release(handle) {
            return Ok(0);
        }
        if self.channels.close(handle) {
            return Ok(0);
        }
        Err(ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlignmentMode;
    use crate::layout::MEMORY_BASE;

    fn setup_with_path(path: &[u8]) -> (BasinKernel, Memory) {
        let mut mem = Memory::new(2 * 1024 * 1024, AlignmentMode::Permissive);
        let mut bytes = path.to_vec();
        bytes.push(0);
        uaccess::write_bytes(&mut mem, MEMORY_BASE, &bytes).unwrap();
        (BasinKernel::new(), mem)
    }

    #[test]
    fn test_open_close_round_trip() {
        let (mut kernel, mem) = setup_with_path(b"/dev/console");
        assert_eq!(kernel.handles().in_use(), 0);
        let h = kernel
            .sys_open(MEMORY_BASE, OpenFlags::READ.bits(), &mem)
            .unwrap();
        assert_eq!(kernel.handles().in_use(), 1);
        kernel.sys_close(h).unwrap();
        assert_eq!(kernel.handles().in_use(), 0);
        assert_eq!(kernel.sys_close(h), Err(ErrorKind::NotFound));
    }

    #[test]
    fn test_handle_values_never_reused() {
        let (mut kernel, mem) = setup_with_path(b"/a");
        let first = kernel
            .sys_open(MEMORY_BASE, OpenFlags::READ.bits(), &mem)
            .unwrap();
        kernel.sys_close(first).unwrap();
        let second = kernel
            .sys_open(MEMORY_BASE, OpenFlags::READ.bits(), &mem)
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_write_reports_progress_read_finds_nothing() {
        let (mut kernel, mem) = setup_with_path(b"/log");
        let h = kernel
            .sys_open(MEMORY_BASE, (OpenFlags::WRITE | OpenFlags::CREATE).bits(), &mem)
            .unwrap();
        assert_eq!(kernel.sys_write(h, MEMORY_BASE, 100, &mem).unwrap(), 100);
        assert_eq!(kernel.sys_read(h, MEMORY_BASE, 100, &mem).unwrap(), 0);
    }

    #[test]
    fn test_open_rejects_bad_paths() {
        let (mut kernel, mem) = setup_with_path(b"");
        assert_eq!(
            kernel.sys_open(MEMORY_BASE, OpenFlags::READ.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
        // Pointer outside memory.
        assert_eq!(
            kernel.sys_open(2, OpenFlags::READ.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
        // Unknown flag bits.
        assert_eq!(
            kernel.sys_open(MEMORY_BASE, 1 << 40, &mem),
            Err(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_path_length_bound() {
        let long = vec![b'a'; MAX_PATH_LEN as usize + 1];
        let (mut kernel, mem) = setup_with_path(&long);
        assert_eq!(
            kernel.sys_open(MEMORY_BASE, OpenFlags::READ.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_stale_handle_after_close() {
        let (mut kernel, mem) = setup_with_path(b"/x");
        let h = kernel
            .sys_open(MEMORY_BASE, OpenFlags::WRITE.bits(), &mem)
            .unwrap();
        kernel.sys_close(h).unwrap();
        assert_eq!(
            kernel.sys_write(h, MEMORY_BASE, 1, &mem),
            Err(ErrorKind::NotFound)
        );
        assert_eq!(
            kernel.sys_read(h, MEMORY_BASE, 1, &mem),
            Err(ErrorKind::NotFound)
        );
    }
}
