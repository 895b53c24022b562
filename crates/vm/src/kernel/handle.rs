//! Opaque kernel handles and the process/file handle table.
//!
//! A handle is a 64-bit value, not a pointer; its validity is defined solely
//! by lookup in the owning table. Slots are reusable, handle values are not.

use crate::layout::HANDLE_TABLE_SIZE;

use super::fs::{FileState, OpenFlags};
use super::process::ProcessEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kinds a handle can refer to. Mappings and channels live in their own
/// tables; this table owns processes and files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Process,
    Mapping,
    File,
    Channel,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub handle: Handle,
    pub path: String,
    pub flags: OpenFlags,
    pub state: FileState,
    /// Progress reported by write; nothing is persisted behind it.
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub enum HandleSlot {
    Free,
    Process(ProcessEntry),
    File(FileEntry),
}

pub struct HandleTable {
    slots: [HandleSlot; HANDLE_TABLE_SIZE],
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| HandleSlot::Free),
        }
    }

    pub fn free_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, HandleSlot::Free))
    }

    pub(crate) fn set(&mut self, index: usize, slot: HandleSlot) {
        self.slots[index] = slot;
    }

    pub fn file(&self, handle: Handle) -> Option<&FileEntry> {
        self.slots.iter().find_map(|slot| match slot {
            HandleSlot::File(entry) if entry.handle == handle && entry.state == FileState::Open => {
                Some(entry)
            }
            _ => None,
        })
    }

    pub fn file_mut(&mut self, handle: Handle) -> Option<&mut FileEntry> {
        self.slots.iter_mut().find_map(|slot| match slot {
            HandleSlot::File(entry) if entry.handle == handle && entry.state == FileState::Open => {
                Some(entry)
            }
            _ => None,
        })
    }

    pub fn process(&self, handle: Handle) -> Option<&ProcessEntry> {
        self.slots.iter().find_map(|slot| match slot {
            HandleSlot::Process(entry) if entry.handle == handle => Some(entry),
            _ => None,
        })
    }

    pub fn process_mut(&mut self, handle: Handle) -> Option<&mut ProcessEntry> {
        self.slots.iter_mut().find_map(|slot| match slot {
            HandleSlot::Process(entry) if entry.handle == handle => Some(entry),
            _ => None,
        })
    }

    /// Free the slot owning `handle`. The handle value itself is burned for
    /// the VM lifetime.
    pub fn release(&mut self, handle: Handle) -> bool {
        for slot in &mut self.slots {
            let owned = match slot {
                HandleSlot::Process(entry) => entry.handle == handle,
                HandleSlot::File(entry) => entry.handle == handle,
                HandleSlot::Free => false,
            };
            if owned {
                *slot = HandleSlot::Free;
                return true;
            }
        }
        false
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, HandleSlot::Free))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(handle: u64) -> FileEntry {
        FileEntry {
            handle: Handle::new(handle),
            path: "/tmp/x".into(),
            flags: OpenFlags::READ,
            state: FileState::Open,
            bytes_written: 0,
        }
    }

    #[test]
    fn test_release_returns_slot_to_free() {
        let mut table = HandleTable::new();
        let idx = table.free_index().unwrap();
        table.set(idx, HandleSlot::File(file_entry(3)));
        assert_eq!(table.in_use(), 1);
        assert!(table.release(Handle::new(3)));
        assert_eq!(table.in_use(), 0);
        assert!(!table.release(Handle::new(3)));
    }

    #[test]
    fn test_lookup_ignores_other_handles() {
        let mut table = HandleTable::new();
        let idx = table.free_index().unwrap();
        table.set(idx, HandleSlot::File(file_entry(7)));
        assert!(table.file(Handle::new(7)).is_some());
        assert!(table.file(Handle::new(8)).is_none());
        assert!(table.process(Handle::new(7)).is_none());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut table = HandleTable::new();
        for i in 0..table.capacity() as u64 {
            let idx = table.free_index().expect("slot");
            table.set(idx, HandleSlot::File(file_entry(i + 1)));
        }
        assert!(table.free_index().is_none());
    }
}
