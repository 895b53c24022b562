//! Fault and syscall error taxonomy.
//!
//! Two channels exist for things going wrong, and they never mix: a [`Fault`]
//! is an internal VM error that parks the machine in the `errored` state with
//! all registers and memory preserved for post-mortem inspection, while an
//! [`ErrorKind`] travels back to the guest encoded in a0. The a0 encoding is
//! exactly reversible so the guest-side stubs and the host test harness share
//! one source of truth.

use serde::Serialize;
use thiserror::Error;

/// Internal VM fault. Raising one halts fetch and transitions the VM to
/// `errored`; no recovery is attempted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Fault {
    #[error("register index {index} out of range")]
    InvalidRegister { index: u64 },

    #[error("misaligned {width}-byte access at {addr:#x}")]
    MisalignedAddress { addr: u64, width: u64 },

    #[error("illegal instruction {word:#010x}")]
    IllegalInstruction { word: u32 },

    #[error("{len}-byte access at {addr:#x} outside guest memory")]
    MemoryOutOfRange { addr: u64, len: u64 },

    #[error("unable to decode instruction word {word:#010x}")]
    DecodeFailure { word: u32 },
}

impl Fault {
    /// The taxonomy kind matching this fault, for hosts that fold both error
    /// channels into one report.
    pub const fn kind(self) -> ErrorKind {
        match self {
            Fault::InvalidRegister { .. } => ErrorKind::InvalidRegister,
            Fault::MisalignedAddress { .. } => ErrorKind::MisalignedAddress,
            Fault::IllegalInstruction { .. } => ErrorKind::IllegalInstruction,
            Fault::MemoryOutOfRange { .. } => ErrorKind::MemoryOutOfRange,
            Fault::DecodeFailure { .. } => ErrorKind::DecodeFailure,
        }
    }
}

/// Error kinds reportable to the guest through the a0 encoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid register")]
    InvalidRegister,
    #[error("misaligned address")]
    MisalignedAddress,
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("unknown syscall")]
    UnknownSyscall,
    #[error("out of memory")]
    OutOfMemory,
    #[error("table full")]
    TableFull,
    #[error("mapping overlap")]
    Overlap,
    #[error("not found")]
    NotFound,
    #[error("would block")]
    WouldBlock,
    #[error("invalid state transition")]
    InvalidStateTransition,
    #[error("memory access out of range")]
    MemoryOutOfRange,
    #[error("decode failure")]
    DecodeFailure,
}

impl ErrorKind {
    /// Stable wire code. Codes start at 1; 0 would collide with `ok(0)`.
    pub const fn code(self) -> u64 {
        match self {
            ErrorKind::InvalidArgument => 1,
            ErrorKind::InvalidRegister => 2,
            ErrorKind::MisalignedAddress => 3,
            ErrorKind::IllegalInstruction => 4,
            ErrorKind::UnknownSyscall => 5,
            ErrorKind::OutOfMemory => 6,
            ErrorKind::TableFull => 7,
            ErrorKind::Overlap => 8,
            ErrorKind::NotFound => 9,
            ErrorKind::WouldBlock => 10,
            ErrorKind::InvalidStateTransition => 11,
            ErrorKind::MemoryOutOfRange => 12,
            ErrorKind::DecodeFailure => 13,
        }
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::InvalidArgument,
            2 => ErrorKind::InvalidRegister,
            3 => ErrorKind::MisalignedAddress,
            4 => ErrorKind::IllegalInstruction,
            5 => ErrorKind::UnknownSyscall,
            6 => ErrorKind::OutOfMemory,
            7 => ErrorKind::TableFull,
            8 => ErrorKind::Overlap,
            9 => ErrorKind::NotFound,
            10 => ErrorKind::WouldBlock,
            11 => ErrorKind::InvalidStateTransition,
            12 => ErrorKind::MemoryOutOfRange,
            13 => ErrorKind::DecodeFailure,
            _ => return None,
        })
    }
}

/// Result of a kernel syscall before a0 encoding.
pub type SyscallResult = Result<u64, ErrorKind>;

/// Encode a syscall result into a0: success is the value itself, an error is
/// the negated kind code. Success values are expected to stay below 2^63.
pub fn encode_result(result: SyscallResult) -> u64 {
    match result {
        Ok(value) => value,
        Err(kind) => (kind.code() as i64).wrapping_neg() as u64,
    }
}

/// Reverse of [`encode_result`].
pub fn decode_result(a0: u64) -> SyscallResult {
    let signed = a0 as i64;
    if signed < 0 {
        if let Some(kind) = ErrorKind::from_code(signed.unsigned_abs()) {
            return Err(kind);
        }
    }
    Ok(a0)
}
