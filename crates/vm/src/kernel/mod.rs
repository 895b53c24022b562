//! The Basin guest kernel.
//!
//! A single state machine holding three statically sized tables (handles,
//! mappings, channels) and the seventeen syscall handlers operating on them.
//! Every handler is a total function of its arguments and the current kernel
//! state: preconditions are asserted before any mutation, so a failing call
//! leaves every table untouched. Tables never resize; exhaustion is reported,
//! not deferred.

pub mod channel;
pub mod fs;
pub mod handle;
pub mod mapping;
pub mod process;
pub mod time;
pub mod uaccess;

use crate::error::{ErrorKind, SyscallResult};
use crate::mem::Memory;

use channel::ChannelTable;
use handle::{Handle, HandleTable};
use mapping::MappingTable;

/// First function ID owned by the kernel; everything below goes to SBI.
pub const KERNEL_SYSCALL_BASE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Spawn = 10,
    Exit = 11,
    Yield = 12,
    Wait = 13,
    Map = 14,
    Unmap = 15,
    Protect = 16,
    ChannelCreate = 17,
    ChannelSend = 18,
    ChannelRecv = 19,
    Open = 20,
    Read = 21,
    Write = 22,
    Close = 23,
    ClockGettime = 24,
    SleepUntil = 25,
    Sysinfo = 26,
}

impl Syscall {
    pub fn from_nr(nr: u64) -> Option<Self> {
        Some(match nr {
            10 => Syscall::Spawn,
            11 => Syscall::Exit,
            12 => Syscall::Yield,
            13 => Syscall::Wait,
            14 => Syscall::Map,
            15 => Syscall::Unmap,
            16 => Syscall::Protect,
            17 => Syscall::ChannelCreate,
            18 => Syscall::ChannelSend,
            19 => Syscall::ChannelRecv,
            20 => Syscall::Open,
            21 => Syscall::Read,
            22 => Syscall::Write,
            23 => Syscall::Close,
            24 => Syscall::ClockGettime,
            25 => Syscall::SleepUntil,
            26 => Syscall::Sysinfo,
            _ => return None,
        })
    }
}

/// What the dispatcher should do after a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Encode into a0 and advance PC.
    Return(SyscallResult),
    /// Halt the VM with this status; PC stays on the ecall.
    Exit(u64),
}

pub struct BasinKernel {
    next_handle: u64,
    pub(crate) handles: HandleTable,
    pub(crate) mappings: MappingTable,
    pub(crate) channels: ChannelTable,
    pub(crate) yield_count: u64,
    pub(crate) sleep_deadline: Option<u64>,
}

impl BasinKernel {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            handles: HandleTable::new(),
            mappings: MappingTable::new(),
            channels: ChannelTable::new(),
            yield_count: 0,
            sleep_deadline: None,
        }
    }

    /// Handles come from a VM-global monotonic counter; values are never
    /// reused, and 0 stays reserved as the invalid sentinel.
    pub(crate) fn alloc_handle(&mut self) -> Handle {
        let handle = Handle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Entry point from the ECALL dispatcher. `now_ns` is the deterministic
    /// guest clock.
    pub fn handle_syscall(
        &mut self,
        nr: u64,
        args: [u64; 4],
        mem: &mut Memory,
        now_ns: u64,
    ) -> SyscallOutcome {
        let Some(sc) = Syscall::from_nr(nr) else {
            log::debug!("unknown syscall {nr}");
            return SyscallOutcome::Return(Err(ErrorKind::UnknownSyscall));
        };
        log::trace!("syscall {sc:?} args={args:x?}");

        let result = match sc {
            Syscall::Spawn => self.sys_spawn(args[0], args[1], args[2], mem),
            Syscall::Exit => return self.sys_exit(args[0]),
            Syscall::Yield => self.sys_yield(),
            Syscall::Wait => self.sys_wait(args[0]),
            Syscall::Map => self.sys_map(args[0], args[1], args[2], mem),
            Syscall::Unmap => self.sys_unmap(args[0], args[1]),
            Syscall::Protect => self.sys_protect(args[0], args[1], args[2]),
            Syscall::ChannelCreate => self.sys_channel_create(),
            Syscall::ChannelSend => self.sys_channel_send(args[0], args[1], args[2], mem),
            Syscall::ChannelRecv => self.sys_channel_recv(args[0], args[1], args[2], mem),
            Syscall::Open => self.sys_open(args[0], args[1], mem),
            Syscall::Read => self.sys_read(args[0], args[1], args[2], mem),
            Syscall::Write => self.sys_write(args[0], args[1], args[2], mem),
            Syscall::Close => self.sys_close(args[0]),
            Syscall::ClockGettime => self.sys_clock_gettime(args[0], args[1], mem, now_ns),
            Syscall::SleepUntil => self.sys_sleep_until(args[0], now_ns),
            Syscall::Sysinfo => self.sys_sysinfo(args[0], mem, now_ns),
        };
        if let Err(kind) = result {
            log::debug!("syscall {sc:?} failed: {kind}");
        }
        SyscallOutcome::Return(result)
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// Cooperative yields observed so far.
    pub fn yield_count(&self) -> u64 {
        self.yield_count
    }

    /// Deadline recorded by the last `sleep_until`, if any.
    pub fn sleep_deadline(&self) -> Option<u64> {
        self.sleep_deadline
    }
}

impl Default for BasinKernel {
    fn default() -> Self {
        Self::new()
    }
}
