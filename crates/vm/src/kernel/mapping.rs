//! Mapping table and the map/unmap/protect syscalls.
//!
//! A mapping is a page-aligned, page-granular region of guest memory tracked
//! in a fixed 256-entry table. Entry lifecycle: `free → allocated` via `map`,
//! `allocated → free` via `unmap`, `allocated ↔ protected` via `protect`.
//! Released regions are not zeroed; a fresh allocation may observe stale
//! contents.

use bitflags::bitflags;

use crate::error::{ErrorKind, SyscallResult};
use crate::layout::{page_aligned, page_multiple, MAPPING_TABLE_SIZE, MMAP_SEARCH_BASE};
use crate::mem::Memory;

use super::handle::Handle;
use super::BasinKernel;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl MapFlags {
    pub const RW: MapFlags = MapFlags::READ.union(MapFlags::WRITE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Free,
    Allocated,
    Protected,
}

#[derive(Debug, Clone, Copy)]
pub struct MappingEntry {
    pub handle: Handle,
    pub base: u64,
    pub length: u64,
    pub flags: MapFlags,
    pub state: MappingState,
}

impl MappingEntry {
    const EMPTY: MappingEntry = MappingEntry {
        handle: Handle::INVALID,
        base: 0,
        length: 0,
        flags: MapFlags::empty(),
        state: MappingState::Free,
    };

    fn is_live(&self) -> bool {
        self.state != MappingState::Free
    }

    fn overlaps(&self, base: u64, length: u64) -> bool {
        !(base + length <= self.base || self.base + self.length <= base)
    }
}

pub struct MappingTable {
    entries: [MappingEntry; MAPPING_TABLE_SIZE],
}

impl MappingTable {
    pub fn new() -> Self {
        Self {
            entries: [MappingEntry::EMPTY; MAPPING_TABLE_SIZE],
        }
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    fn free_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_live())
    }

    /// True if `[base, base+length)` intersects any live entry. Protected
    /// entries still own their range and count here.
    pub fn overlaps(&self, base: u64, length: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_live() && e.overlaps(base, length))
    }

    fn find_exact_mut(&mut self, base: u64, length: u64) -> Option<&mut MappingEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.is_live() && e.base == base && e.length == length)
    }

    /// Lowest base address from `MMAP_SEARCH_BASE` upward where `size` bytes
    /// fit without overlapping a live entry and without crossing `limit`.
    /// First-fit over the live entries in address order keeps the choice
    /// deterministic.
    fn lowest_fit(&self, size: u64, limit: u64) -> Option<u64> {
        let mut live: Vec<(u64, u64)> = self
            .entries
            .iter()
            .filter(|e| e.is_live())
            .map(|e| (e.base, e.length))
            .collect();
        live.sort_unstable();

        let mut candidate = MMAP_SEARCH_BASE;
        for (base, length) in live {
            if candidate.checked_add(size)? <= base {
                break;
            }
            candidate = candidate.max(base.checked_add(length)?);
        }
        if candidate.checked_add(size)? <= limit {
            Some(candidate)
        } else {
            None
        }
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BasinKernel {
    pub(crate) fn sys_map(
        &mut self,
        addr: u64,
        size: u64,
        flags: u64,
        mem: &Memory,
    ) -> SyscallResult {
        let flags = MapFlags::from_bits(flags).ok_or(ErrorKind::InvalidArgument)?;
        if !page_multiple(size) {
            return Err(ErrorKind::InvalidArgument);
        }

        let base = if addr == 0 {
            self.mappings
                .lowest_fit(size, mem.size())
                .ok_or(ErrorKind::OutOfMemory)?
        } else {
            if !mem.in_bounds(addr, size) {
                return Err(ErrorKind::InvalidArgument);
            }
            // Overlap is reported ahead of misalignment: a request that
            // collides with a live mapping is an overlap even when its base
            // is also unaligned.
            if self.mappings.overlaps(addr, size) {
                return Err(ErrorKind::Overlap);
            }
            if !page_aligned(addr) {
                return Err(ErrorKind::InvalidArgument);
            }
            addr
        };

        let index = self.mappings.free_index().ok_or(ErrorKind::TableFull)?;
        let handle = self.alloc_handle();
        self.mappings.entries[index] = MappingEntry {
            handle,
            base,
            length: size,
            flags,
            state: MappingState::Allocated,
        };
        log::debug!("map {handle}: {base:#x}+{size:#x} {flags:?}");
        Ok(base)
    }

    /// Release exactly one allocated mapping. Partial unmaps are rejected;
    /// the region is not zeroed.
    pub(crate) fn sys_unmap(&mut self, addr: u64, size: u64) -> SyscallResult {
        let entry = self
            .mappings
            .find_exact_mut(addr, size)
            .filter(|e| e.state == MappingState::Allocated)
            .ok_or(ErrorKind::NotFound)?;
        log::debug!("unmap {}: {addr:#x}+{size:#x}", entry.handle);
        *entry = MappingEntry::EMPTY;
        Ok(0)
    }

    /// Update the flags of the mapping covering exactly `[addr, addr+size)`.
    /// Anything other than plain READ|WRITE parks the entry in `protected`;
    /// restoring READ|WRITE returns it to `allocated`.
    pub(crate) fn sys_protect(&mut self, addr: u64, size: u64, flags: u64) -> SyscallResult {
        let flags = MapFlags::from_bits(flags).ok_or(ErrorKind::InvalidArgument)?;
        if !page_multiple(size) || !page_aligned(addr) {
            return Err(ErrorKind::InvalidArgument);
        }
        let entry = self
            .mappings
            .find_exact_mut(addr, size)
            .ok_or(ErrorKind::NotFound)?;
        entry.flags = flags;
        entry.state = if flags == MapFlags::RW {
            MappingState::Allocated
        } else {
            MappingState::Protected
        };
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlignmentMode;
    use crate::layout::{DEFAULT_MEMORY_SIZE, PAGE_SIZE};

    fn setup() -> (BasinKernel, Memory) {
        (
            BasinKernel::new(),
            Memory::new(DEFAULT_MEMORY_SIZE, AlignmentMode::Permissive),
        )
    }

    #[test]
    fn test_kernel_chosen_base_is_lowest_free() {
        let (mut kernel, mem) = setup();
        let a = kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        let b = kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        assert_eq!(a, MMAP_SEARCH_BASE);
        assert_eq!(b, a + PAGE_SIZE);

        // Freeing the first page makes its base the lowest candidate again.
        kernel.sys_unmap(a, PAGE_SIZE).unwrap();
        let c = kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_map_unmap_restores_table() {
        let (mut kernel, mem) = setup();
        let before: Vec<_> = kernel
            .mappings()
            .entries()
            .iter()
            .map(|e| e.state)
            .collect();
        let base = kernel.sys_map(0, 4 * PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        kernel.sys_unmap(base, 4 * PAGE_SIZE).unwrap();
        let after: Vec<_> = kernel
            .mappings()
            .entries()
            .iter()
            .map(|e| e.state)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_fixed_overlap_rejected_without_mutation() {
        let (mut kernel, mem) = setup();
        kernel.sys_map(0x2_0000, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        let used = kernel.mappings().in_use();
        assert_eq!(
            kernel.sys_map(0x2_0000, PAGE_SIZE, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::Overlap)
        );
        assert_eq!(kernel.mappings().in_use(), used);
    }

    #[test]
    fn test_half_page_overlap_rejected() {
        let (mut kernel, mem) = setup();
        kernel.sys_map(0x1_0000, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        // 0x10800 lands inside the page mapped at 0x10000; the collision
        // wins over the misaligned base.
        assert_eq!(
            kernel.sys_map(0x1_0800, PAGE_SIZE, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::Overlap)
        );
        // An unaligned base with no collision is plain validation failure.
        assert_eq!(
            kernel.sys_map(0x3_0800, PAGE_SIZE, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_table_exhaustion() {
        let (mut kernel, mem) = setup();
        for _ in 0..MAPPING_TABLE_SIZE {
            kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        }
        assert_eq!(
            kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::TableFull)
        );
    }

    #[test]
    fn test_partial_unmap_rejected() {
        let (mut kernel, mem) = setup();
        let base = kernel.sys_map(0, 2 * PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        assert_eq!(kernel.sys_unmap(base, PAGE_SIZE), Err(ErrorKind::NotFound));
        assert_eq!(kernel.sys_unmap(base + PAGE_SIZE, PAGE_SIZE), Err(ErrorKind::NotFound));
        kernel.sys_unmap(base, 2 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn test_protect_state_transitions() {
        let (mut kernel, mem) = setup();
        let base = kernel.sys_map(0, PAGE_SIZE, MapFlags::RW.bits(), &mem).unwrap();
        kernel.sys_protect(base, PAGE_SIZE, MapFlags::READ.bits()).unwrap();
        let entry = kernel
            .mappings()
            .entries()
            .iter()
            .find(|e| e.base == base && e.is_live())
            .copied()
            .unwrap();
        assert_eq!(entry.state, MappingState::Protected);

        // Protected entries cannot be unmapped.
        assert_eq!(kernel.sys_unmap(base, PAGE_SIZE), Err(ErrorKind::NotFound));

        // Restoring plain RW returns the entry to allocated, and unmap works.
        kernel.sys_protect(base, PAGE_SIZE, MapFlags::RW.bits()).unwrap();
        kernel.sys_unmap(base, PAGE_SIZE).unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let (mut kernel, mem) = setup();
        assert_eq!(
            kernel.sys_map(0, 100, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_map(0x2_0001, PAGE_SIZE, MapFlags::RW.bits(), &mem),
            Err(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_map(0, PAGE_SIZE, 0xff, &mem),
            Err(ErrorKind::InvalidArgument)
        );
    }
}
