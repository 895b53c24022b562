//! Platform services (SBI) and the host-visible serial ring.
//!
//! From the VM's point of view SBI is a pure function of the call plus one
//! observable side effect: console output lands in a bounded ring the host
//! drains between steps. Function IDs 0..9 are reserved for this layer.

use std::collections::VecDeque;

use crate::layout::SERIAL_RING_CAPACITY;

pub const SBI_SET_TIMER: u64 = 0;
pub const SBI_CONSOLE_PUTCHAR: u64 = 1;
pub const SBI_CONSOLE_GETCHAR: u64 = 2;
pub const SBI_SYSTEM_RESET: u64 = 8;

/// Returned by console-getchar when no input is queued, and by every
/// unimplemented function.
pub const SBI_NO_VALUE: u64 = u64::MAX;

/// Bounded byte ring; writes past capacity overwrite the oldest byte.
#[derive(Debug, Clone)]
pub struct SerialRing {
    buf: VecDeque<u8>,
    capacity: usize,
    overwritten: u64,
}

impl SerialRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            overwritten: 0,
        }
    }

    pub fn push(&mut self, byte: u8) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
            self.overwritten += 1;
        }
        self.buf.push_back(byte);
    }

    pub fn drain(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes lost to overwrites since construction.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }
}

pub enum SbiOutcome {
    Ret(u64),
    Shutdown,
}

pub struct Sbi {
    serial: SerialRing,
    input: VecDeque<u8>,
    timer_deadline: Option<u64>,
}

impl Sbi {
    pub fn new() -> Self {
        Self {
            serial: SerialRing::new(SERIAL_RING_CAPACITY),
            input: VecDeque::new(),
            timer_deadline: None,
        }
    }

    pub fn handle(&mut self, fn_id: u64, arg0: u64) -> SbiOutcome {
        match fn_id {
            SBI_SET_TIMER => {
                // Recorded only; no timer interrupt exists in this machine.
                self.timer_deadline = Some(arg0);
                SbiOutcome::Ret(0)
            }
            SBI_CONSOLE_PUTCHAR => {
                self.serial.push(arg0 as u8);
                SbiOutcome::Ret(0)
            }
            SBI_CONSOLE_GETCHAR => match self.input.pop_front() {
                Some(byte) => SbiOutcome::Ret(u64::from(byte)),
                None => SbiOutcome::Ret(SBI_NO_VALUE),
            },
            SBI_SYSTEM_RESET => SbiOutcome::Shutdown,
            _ => {
                log::warn!("unimplemented SBI function {fn_id}");
                SbiOutcome::Ret(SBI_NO_VALUE)
            }
        }
    }

    pub fn serial_drain(&mut self) -> Vec<u8> {
        self.serial.drain()
    }

    pub fn serial_len(&self) -> usize {
        self.serial.len()
    }

    pub fn feed_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn timer_deadline(&self) -> Option<u64> {
        self.timer_deadline
    }
}

impl Default for Sbi {
    fn default() -> Self {
        Self::new()
    }
}
