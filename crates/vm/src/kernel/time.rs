//! Guest time: clock_gettime, sleep_until, sysinfo.
//!
//! The clock is virtual and fully deterministic: it advances with the
//! retired-instruction counter, never with host wall time. `sleep_until`
//! records the requested deadline and returns immediately; nothing in this
//! machine blocks.

use crate::error::{ErrorKind, SyscallResult};
use crate::layout::{PAGE_SIZE, REALTIME_EPOCH_NS};
use crate::mem::Memory;

use super::uaccess;
use super::BasinKernel;

pub const CLOCK_MONOTONIC: u64 = 0;
pub const CLOCK_REALTIME: u64 = 1;

const NS_PER_SEC: u64 = 1_000_000_000;

impl BasinKernel {
    /// Write `{sec: u64, nsec: u64}` (16 bytes, little-endian) to `out_ptr`.
    pub(crate) fn sys_clock_gettime(
        &mut self,
        clock_id: u64,
        out_ptr: u64,
        mem: &mut Memory,
        now_ns: u64,
    ) -> SyscallResult {
        let ns = match clock_id {
            CLOCK_MONOTONIC => now_ns,
            CLOCK_REALTIME => now_ns + REALTIME_EPOCH_NS,
            _ => return Err(ErrorKind::InvalidArgument),
        };
        uaccess::check_range(mem, out_ptr, 16)?;
        uaccess::write_u64(mem, out_ptr, ns / NS_PER_SEC)?;
        uaccess::write_u64(mem, out_ptr + 8, ns % NS_PER_SEC)?;
        Ok(0)
    }

    pub(crate) fn sys_sleep_until(&mut self, timestamp_ns: u64, now_ns: u64) -> SyscallResult {
        // Deadlines in the past are already satisfied; future ones are
        // recorded for the host to observe. Neither pauses execution.
        if timestamp_ns > now_ns {
            self.sleep_deadline = Some(timestamp_ns);
        }
        Ok(0)
    }

    /// Write six u64 fields: memory_size, page_size, mappings_in_use,
    /// handles_in_use, channels_in_use, uptime_ns.
    pub(crate) fn sys_sysinfo(&mut self, out_ptr: u64, mem: &mut Memory, now_ns: u64) -> SyscallResult {
        uaccess::check_range(mem, out_ptr, 48)?;
        let fields = [
            mem.size(),
            PAGE_SIZE,
            self.mappings.in_use() as u64,
            self.handles.in_use() as u64,
            self.channels.in_use() as u64,
            now_ns,
        ];
        for (i, value) in fields.iter().enumerate() {
            uaccess::write_u64(mem, out_ptr + (i as u64) * 8, *value)?;
        }
        Ok(0)
    }
}
