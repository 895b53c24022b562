//! Channels: handle-addressed byte-message queues.
//!
//! Messages are opaque slices of at most 64 KiB, queued datagram-style with a
//! small bounded depth. A receive into a shorter buffer truncates; the
//! remainder of that message is gone.

use std::collections::VecDeque;

use crate::error::{ErrorKind, SyscallResult};
use crate::layout::{CHANNEL_QUEUE_DEPTH, CHANNEL_TABLE_SIZE, MAX_MESSAGE_SIZE};
use crate::mem::Memory;

use super::handle::Handle;
use super::uaccess;
use super::BasinKernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Slot not in use; also the post-`close` state.
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub handle: Handle,
    pub state: ChannelState,
    queue: VecDeque<Vec<u8>>,
}

impl ChannelEntry {
    fn closed() -> Self {
        Self {
            handle: Handle::INVALID,
            state: ChannelState::Closed,
            queue: VecDeque::new(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

pub struct ChannelTable {
    entries: [ChannelEntry; CHANNEL_TABLE_SIZE],
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| ChannelEntry::closed()),
        }
    }

    fn closed_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state == ChannelState::Closed)
    }

    pub fn open(&self, handle: Handle) -> Option<&ChannelEntry> {
        self.entries
            .iter()
            .find(|e| e.state == ChannelState::Open && e.handle == handle)
    }

    fn open_mut(&mut self, handle: Handle) -> Option<&mut ChannelEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.state == ChannelState::Open && e.handle == handle)
    }

    pub(crate) fn close(&mut self, handle: Handle) -> bool {
        match self.open_mut(handle) {
            Some(entry) => {
                *entry = ChannelEntry::closed();
                true
            }
            None => false,
        }
    }

    pub fn in_use(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ChannelState::Open)
            .count()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BasinKernel {
    pub(crate) fn sys_channel_create(&mut self) -> SyscallResult {
        let index = self
            .channels
            .closed_index()
            .ok_or(ErrorKind::OutOfMemory)?;
        let handle = self.alloc_handle();
        self.channels.entries[index] = ChannelEntry {
            handle,
            state: ChannelState::Open,
            queue: VecDeque::new(),
        };
        log::debug!("channel_create -> {handle}");
        Ok(handle.value())
    }

    pub(crate) fn sys_channel_send(
        &mut self,
        handle: u64,
        buf: u64,
        len: u64,
        mem: &Memory,
    ) -> SyscallResult {
        let handle = Handle::new(handle);
        if handle.is_invalid() || len > MAX_MESSAGE_SIZE {
            return Err(ErrorKind::InvalidArgument);
        }
        let entry = self
            .channels
            .open_mut(handle)
            .ok_or(ErrorKind::NotFound)?;
        uaccess::check_range(mem, buf, len)?;
        if entry.queue.len() >= CHANNEL_QUEUE_DEPTH {
            return Err(ErrorKind::WouldBlock);
        }
        let payload = uaccess::read_bytes(mem, buf, len)?;
        entry.queue.push_back(payload);
        Ok(0)
    }

    pub(crate) fn sys_channel_recv(
        &mut self,
        handle: u64,
        buf: u64,
        len: u64,
        mem: &mut Memory,
    ) -> SyscallResult {
        let handle = Handle::new(handle);
        if handle.is_invalid() || len > MAX_MESSAGE_SIZE {
            return Err(ErrorKind::InvalidArgument);
        }
        // The full declared destination range must be writable before any
        // byte lands, even if the message turns out shorter.
        uaccess::check_range(mem, buf, len)?;
        let entry = self
            .channels
            .open_mut(handle)
            .ok_or(ErrorKind::NotFound)?;
        let Some(message) = entry.queue.pop_front() else {
            return Ok(0);
        };
        let count = message.len().min(len as usize);
        uaccess::write_bytes(mem, buf, &message[..count])?;
        Ok(count as u64)
    }
}
