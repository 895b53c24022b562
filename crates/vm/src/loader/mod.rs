//! RV64 ELF loading.
//!
//! Split into three responsibilities: header validation ([`ElfImage::parse`]),
//! per-segment mapping checks ([`segment::check`]), and per-segment data
//! loads ([`segment::load`]). After the segments land, the entry point goes
//! to PC, the stack pointer is parked below the top-of-memory guard, and the
//! argv block is written directly under it.

pub mod segment;

use thiserror::Error;

use crate::cpu::{abi, RegisterFile};
use crate::error::Fault;
use crate::layout::{ARG_REGION_SIZE, STACK_GUARD_SIZE};
use crate::mem::Memory;

pub use segment::Segment;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_RISCV: u16 = 243;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("image truncated before the ELF header ends")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 64-bit ELF image")]
    NotClass64,
    #[error("not a little-endian ELF image")]
    NotLittleEndian,
    #[error("machine type {0} is not RISC-V")]
    BadMachine(u16),
    #[error("object type {0} is not executable")]
    BadType(u16),
    #[error("program header table out of bounds")]
    BadProgramHeaders,
    #[error("segment file range {offset:#x}+{size:#x} outside the image")]
    SegmentFileRange { offset: u64, size: u64 },
    #[error("segment memory range {addr:#x}+{size:#x} outside guest RAM")]
    SegmentMemRange { addr: u64, size: u64 },
    #[error("segment mem_size {mem_size:#x} smaller than file_size {file_size:#x}")]
    SegmentSize { file_size: u64, mem_size: u64 },
    #[error("argument block exceeds its reserved region")]
    ArgsTooLarge,
    #[error("an image is already loaded or the VM has started")]
    VmAlreadyStarted,
    #[error("guest memory rejected a load: {0}")]
    Memory(#[from] Fault),
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, LoadError> {
    let raw: [u8; 2] = data
        .get(offset..offset + 2)
        .ok_or(LoadError::TooShort)?
        .try_into()
        .map_err(|_| LoadError::TooShort)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, LoadError> {
    let raw: [u8; 4] = data
        .get(offset..offset + 4)
        .ok_or(LoadError::TooShort)?
        .try_into()
        .map_err(|_| LoadError::TooShort)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, LoadError> {
    let raw: [u8; 8] = data
        .get(offset..offset + 8)
        .ok_or(LoadError::TooShort)?
        .try_into()
        .map_err(|_| LoadError::TooShort)?;
    Ok(u64::from_le_bytes(raw))
}

/// A validated ELF64 header over a borrowed image.
pub struct ElfImage<'a> {
    data: &'a [u8],
    entry: u64,
    phoff: usize,
    phnum: usize,
    phentsize: usize,
}

impl<'a> ElfImage<'a> {
    /// Responsibility one: header validation. Accepts ELF64, little-endian,
    /// RISC-V, ET_EXEC or ET_DYN. Section headers are never read.
    pub fn parse(data: &'a [u8]) -> Result<Self, LoadError> {
        if data.len() < EHDR_SIZE {
            return Err(LoadError::TooShort);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(LoadError::NotClass64);
        }
        if data[5] != ELFDATA2LSB {
            return Err(LoadError::NotLittleEndian);
        }
        let etype = read_u16(data, 16)?;
        if etype != ET_EXEC && etype != ET_DYN {
            return Err(LoadError::BadType(etype));
        }
        let machine = read_u16(data, 18)?;
        if machine != EM_RISCV {
            return Err(LoadError::BadMachine(machine));
        }

        let entry = read_u64(data, 24)?;
        let phoff = read_u64(data, 32)? as usize;
        let phentsize = read_u16(data, 54)? as usize;
        let phnum = read_u16(data, 56)? as usize;

        if phnum > 0 {
            if phentsize < PHDR_SIZE {
                return Err(LoadError::BadProgramHeaders);
            }
            let table_len = phnum
                .checked_mul(phentsize)
                .ok_or(LoadError::BadProgramHeaders)?;
            if phoff.checked_add(table_len).map_or(true, |end| end > data.len()) {
                return Err(LoadError::BadProgramHeaders);
            }
        }

        Ok(Self { data, entry, phoff, phnum, phentsize })
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// All PT_LOAD program headers, in table order.
    pub fn segments(&self) -> Result<Vec<Segment>, LoadError> {
        let mut segments = Vec::new();
        for i in 0..self.phnum {
            let base = self.phoff + i * self.phentsize;
            if read_u32(self.data, base)? != PT_LOAD {
                continue;
            }
            segments.push(Segment {
                flags: read_u32(self.data, base + 4)?,
                file_offset: read_u64(self.data, base + 8)?,
                mem_offset: read_u64(self.data, base + 16)?,
                file_size: read_u64(self.data, base + 32)?,
                mem_size: read_u64(self.data, base + 40)?,
            });
        }
        Ok(segments)
    }
}

/// Drive a full load: validate, check every segment, copy every segment,
/// then set PC, stack pointer, and the argv block.
pub(crate) fn load_image(
    mem: &mut Memory,
    cpu: &mut RegisterFile,
    data: &[u8],
    args: &[&str],
) -> Result<(), LoadError> {
    let image = ElfImage::parse(data)?;
    let segments = image.segments()?;

    // Check everything before loading anything; a rejected image must not
    // leave memory half-populated.
    for seg in &segments {
        segment::check(seg, data.len() as u64, mem)?;
    }
    for seg in &segments {
        segment::load(seg, data, mem)?;
    }

    let stack_top = mem.size() - STACK_GUARD_SIZE;
    let arg_base = stack_top - ARG_REGION_SIZE;
    let sp = write_args(mem, stack_top, args)?;
    cpu.set(abi::SP, sp);
    cpu.set(abi::A0, args.len() as u64);
    cpu.set(abi::A1, arg_base + 8);
    cpu.set_pc(image.entry() & !3);

    log::info!(
        "loaded ELF: entry={:#x} segments={} sp={:#x} argc={}",
        image.entry(),
        segments.len(),
        sp,
        args.len()
    );
    Ok(())
}

/// Argv convention: a fixed-size block directly below the stack top holding
/// `argc`, the pointer array (argc entries plus a NUL), then the strings.
/// a0 carries argc, a1 the pointer array address. The initial stack pointer
/// sits 16-byte aligned below the block.
fn write_args(mem: &mut Memory, stack_top: u64, args: &[&str]) -> Result<u64, LoadError> {
    let arg_base = stack_top - ARG_REGION_SIZE;
    let argc = args.len() as u64;

    let ptr_array = arg_base + 8;
    let mut string_cursor = ptr_array + (argc + 1) * 8;
    let strings_len: u64 = args.iter().map(|a| a.len() as u64 + 1).sum();
    if string_cursor + strings_len > stack_top {
        return Err(LoadError::ArgsTooLarge);
    }

    mem.store_u64(arg_base, argc)?;
    for (i, arg) in args.iter().enumerate() {
        mem.store_u64(ptr_array + (i as u64) * 8, string_cursor)?;
        let bytes = arg.as_bytes();
        mem.slice_mut(string_cursor, bytes.len() as u64 + 1)?[..bytes.len()]
            .copy_from_slice(bytes);
        mem.store_u8(string_cursor + bytes.len() as u64, 0)?;
        string_cursor += bytes.len() as u64 + 1;
    }
    mem.store_u64(ptr_array + argc * 8, 0)?;

    Ok(arg_base & !0xf)
}
