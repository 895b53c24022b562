//! Per-segment mapping checks and data loads.

use crate::mem::Memory;

use super::LoadError;

/// One PT_LOAD program header, reduced to what the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_offset: u64,
    pub mem_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: u32,
}

/// Responsibility two: mapping validation. The file range must sit inside
/// the image, the destination range inside guest RAM, and the in-memory
/// size can only grow relative to the file.
pub(crate) fn check(seg: &Segment, image_len: u64, mem: &Memory) -> Result<(), LoadError> {
    if seg.mem_size < seg.file_size {
        return Err(LoadError::SegmentSize {
            file_size: seg.file_size,
            mem_size: seg.mem_size,
        });
    }
    let file_end = seg
        .file_offset
        .checked_add(seg.file_size)
        .ok_or(LoadError::SegmentFileRange {
            offset: seg.file_offset,
            size: seg.file_size,
        })?;
    if file_end > image_len {
        return Err(LoadError::SegmentFileRange {
            offset: seg.file_offset,
            size: seg.file_size,
        });
    }
    if seg.mem_size > 0 && !mem.in_bounds(seg.mem_offset, seg.mem_size) {
        return Err(LoadError::SegmentMemRange {
            addr: seg.mem_offset,
            size: seg.mem_size,
        });
    }
    Ok(())
}

/// Responsibility three: the data load. Copy the file-backed bytes, zero the
/// BSS tail `[file_size, mem_size)`.
pub(crate) fn load(seg: &Segment, image: &[u8], mem: &mut Memory) -> Result<(), LoadError> {
    if seg.mem_size == 0 {
        return Ok(());
    }
    if seg.file_size > 0 {
        let src = &image[seg.file_offset as usize..(seg.file_offset + seg.file_size) as usize];
        mem.slice_mut(seg.mem_offset, seg.file_size)?.copy_from_slice(src);
    }
    let bss_len = seg.mem_size - seg.file_size;
    if bss_len > 0 {
        mem.slice_mut(seg.mem_offset + seg.file_size, bss_len)?.fill(0);
    }
    log::debug!(
        "segment {:#x}+{:#x} (file {:#x}, flags {:#x})",
        seg.mem_offset,
        seg.mem_size,
        seg.file_size,
        seg.flags
    );
    Ok(())
}
