//! The virtual machine: fetch, decode, execute, trap.
//!
//! Execution is single-threaded and deterministic; the only suspension point
//! is the `step` boundary. A fault parks the machine in `Errored` with all
//! register and memory state preserved. Halting (guest `exit` or SBI
//! system-reset) records the status for the host.

use serde::Serialize;
use thiserror::Error;

use crate::config::VmConfig;
use crate::cpu::{abi, RegisterFile};
use crate::decode::{decode, AluOp, BranchCond, Instr, LoadWidth, StoreWidth, WordOp};
use crate::ecall::{self, EcallEffect, SyscallHandler};
use crate::error::{Fault, SyscallResult};
use crate::kernel::BasinKernel;
use crate::layout::NS_PER_INSTRUCTION;
use crate::loader::{self, LoadError};
use crate::mem::Memory;
use crate::sbi::Sbi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Initialised,
    Running,
    Halted,
    Errored,
}

/// Host-level API misuse, distinct from guest-visible faults.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("operation requires state {required:?} but VM is {actual:?}")]
    InvalidState { required: VmState, actual: VmState },
    #[error(transparent)]
    Fault(#[from] Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Retired,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Halted { status: u64 },
    BudgetExhausted,
    Faulted(Fault),
}

/// Optional acceleration hook. A backend translates guest code to the host
/// ISA out of band; at each step boundary it may retire a whole block
/// directly against the register file and memory, returning the number of
/// instructions executed with PC already advanced, or `None` to let the
/// interpreter take this step.
pub trait JitBackend {
    fn execute(&mut self, cpu: &mut RegisterFile, mem: &mut Memory) -> Option<u64>;
}

enum Control {
    Next,
    Jump(u64),
    Halt,
}

pub struct Vm {
    cpu: RegisterFile,
    mem: Memory,
    kernel: BasinKernel,
    sbi: Sbi,
    config: VmConfig,
    state: VmState,
    fault: Option<Fault>,
    exit_status: Option<u64>,
    instret: u64,
    syscall_override: Option<SyscallHandler>,
    jit: Option<Box<dyn JitBackend>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            cpu: RegisterFile::new(),
            mem: Memory::new(config.memory_size, config.alignment),
            kernel: BasinKernel::new(),
            sbi: Sbi::new(),
            config,
            state: VmState::Initialised,
            fault: None,
            exit_status: None,
            instret: 0,
            syscall_override: None,
            jit: None,
        }
    }

    /// Load a guest ELF image: populate memory, set PC and the stack
    /// pointer. Only valid before `start`.
    pub fn load_elf(&mut self, image: &[u8]) -> Result<(), LoadError> {
        self.load_elf_with_args(image, &[])
    }

    pub fn load_elf_with_args(&mut self, image: &[u8], args: &[&str]) -> Result<(), LoadError> {
        if self.state != VmState::Initialised {
            return Err(LoadError::VmAlreadyStarted);
        }
        loader::load_image(&mut self.mem, &mut self.cpu, image, args)
    }

    pub fn start(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Initialised {
            return Err(VmError::InvalidState {
                required: VmState::Initialised,
                actual: self.state,
            });
        }
        self.state = VmState::Running;
        Ok(())
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Result<StepEvent, VmError> {
        if self.state != VmState::Running {
            return Err(VmError::InvalidState {
                required: VmState::Running,
                actual: self.state,
            });
        }

        if let Some(jit) = self.jit.as_mut() {
            if let Some(retired) = jit.execute(&mut self.cpu, &mut self.mem) {
                self.instret += retired;
                return Ok(StepEvent::Retired);
            }
        }

        let pc = self.cpu.pc();
        let word = match self.mem.fetch(pc) {
            Ok(word) => word,
            Err(fault) => return Err(self.raise(fault)),
        };
        let instr = match decode(word, self.config.compat_decode) {
            Ok(instr) => instr,
            Err(fault) => return Err(self.raise(fault)),
        };

        match self.execute(instr, pc, word) {
            Ok(Control::Next) => {
                self.cpu.set_pc(pc.wrapping_add(4));
                self.instret += 1;
                Ok(StepEvent::Retired)
            }
            Ok(Control::Jump(target)) => {
                self.cpu.set_pc(target);
                self.instret += 1;
                Ok(StepEvent::Retired)
            }
            Ok(Control::Halt) => {
                self.instret += 1;
                Ok(StepEvent::Halted)
            }
            Err(fault) => Err(self.raise(fault)),
        }
    }

    /// Execute up to `max_steps` instructions.
    pub fn run(&mut self, max_steps: u64) -> Result<RunOutcome, VmError> {
        for _ in 0..max_steps {
            match self.step() {
                Ok(StepEvent::Retired) => {}
                Ok(StepEvent::Halted) => {
                    return Ok(RunOutcome::Halted {
                        status: self.exit_status.unwrap_or(0),
                    })
                }
                Err(VmError::Fault(fault)) => return Ok(RunOutcome::Faulted(fault)),
                Err(other) => return Err(other),
            }
        }
        Ok(RunOutcome::BudgetExhausted)
    }

    pub fn step_n(&mut self, n: u64) -> Result<RunOutcome, VmError> {
        self.run(n)
    }

    fn raise(&mut self, fault: Fault) -> VmError {
        log::warn!("fault at pc {:#x}: {fault}", self.cpu.pc());
        self.state = VmState::Errored;
        self.fault = Some(fault);
        VmError::Fault(fault)
    }

    fn now_ns(&self) -> u64 {
        self.instret * NS_PER_INSTRUCTION
    }

    fn execute(&mut self, instr: Instr, pc: u64, word: u32) -> Result<Control, Fault> {
        match instr {
            Instr::Lui { rd, imm } => {
                self.cpu.set(rd, imm as u64);
                Ok(Control::Next)
            }
            Instr::Auipc { rd, imm } => {
                self.cpu.set(rd, pc.wrapping_add(imm as u64));
                Ok(Control::Next)
            }
            Instr::OpImm { op, rd, rs1, imm } => {
                let a = self.cpu.get(rs1);
                self.cpu.set(rd, alu(op, a, imm as u64));
                Ok(Control::Next)
            }
            Instr::OpImm32 { op, rd, rs1, imm } => {
                let a = self.cpu.get(rs1);
                self.cpu.set(rd, alu32(op, a, imm as u64));
                Ok(Control::Next)
            }
            Instr::Op { op, rd, rs1, rs2 } => {
                let (a, b) = (self.cpu.get(rs1), self.cpu.get(rs2));
                self.cpu.set(rd, alu(op, a, b));
                Ok(Control::Next)
            }
            Instr::Op32 { op, rd, rs1, rs2 } => {
                let (a, b) = (self.cpu.get(rs1), self.cpu.get(rs2));
                self.cpu.set(rd, alu32(op, a, b));
                Ok(Control::Next)
            }
            Instr::Load { width, rd, rs1, offset } => {
                let addr = self.effective_addr(rs1, offset, width.bytes());
                let value = match width {
                    LoadWidth::B => self.mem.load_u8(addr)? as i8 as i64 as u64,
                    LoadWidth::Bu => u64::from(self.mem.load_u8(addr)?),
                    LoadWidth::H => self.mem.load_u16(addr)? as i16 as i64 as u64,
                    LoadWidth::Hu => u64::from(self.mem.load_u16(addr)?),
                    LoadWidth::W => self.mem.load_u32(addr)? as i32 as i64 as u64,
                    LoadWidth::Wu => u64::from(self.mem.load_u32(addr)?),
                    LoadWidth::D => self.mem.load_u64(addr)?,
                };
                self.cpu.set(rd, value);
                Ok(Control::Next)
            }
            Instr::Store { width, rs1, rs2, offset } => {
                let addr = self.effective_addr(rs1, offset, width.bytes());
                let value = self.cpu.get(rs2);
                match width {
                    StoreWidth::B => self.mem.store_u8(addr, value as u8)?,
                    StoreWidth::H => self.mem.store_u16(addr, value as u16)?,
                    StoreWidth::W => self.mem.store_u32(addr, value as u32)?,
                    StoreWidth::D => self.mem.store_u64(addr, value)?,
                }
                Ok(Control::Next)
            }
            Instr::Branch { cond, rs1, rs2, offset } => {
                let (a, b) = (self.cpu.get(rs1), self.cpu.get(rs2));
                if branch_taken(cond, a, b) {
                    Ok(Control::Jump(jump_target(pc, offset)))
                } else {
                    Ok(Control::Next)
                }
            }
            Instr::Jal { rd, offset } => {
                self.cpu.set(rd, pc.wrapping_add(4));
                Ok(Control::Jump(jump_target(pc, offset)))
            }
            Instr::Jalr { rd, rs1, offset } => {
                // Target first: rd may alias rs1.
                let target = self.cpu.get(rs1).wrapping_add(offset as u64) & !3;
                self.cpu.set(rd, pc.wrapping_add(4));
                Ok(Control::Jump(target))
            }
            Instr::Ecall => {
                let now_ns = self.now_ns();
                let effect = ecall::dispatch(
                    &mut self.cpu,
                    &mut self.mem,
                    &mut self.kernel,
                    &mut self.sbi,
                    self.syscall_override.as_mut(),
                    now_ns,
                );
                match effect {
                    EcallEffect::Advance => Ok(Control::Next),
                    EcallEffect::Halt { status } => {
                        self.state = VmState::Halted;
                        self.exit_status = Some(status);
                        Ok(Control::Halt)
                    }
                }
            }
            Instr::Ebreak => Err(Fault::IllegalInstruction { word }),
            Instr::Fence | Instr::Nop => Ok(Control::Next),
        }
    }

    /// Effective address of a load/store, with the frame-pointer fallback:
    /// if the base is x8 and the address misses memory, retry with x2.
    fn effective_addr(&self, rs1: u8, offset: i64, width: u64) -> u64 {
        let addr = self.cpu.get(rs1).wrapping_add(offset as u64);
        if rs1 == abi::FP
            && self.config.frame_pointer_fallback
            && !self.mem.in_bounds(addr, width)
        {
            return self.cpu.get(abi::SP).wrapping_add(offset as u64);
        }
        addr
    }

    // Introspection and harness hooks.

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn pc(&self) -> u64 {
        self.cpu.pc()
    }

    /// Harness hook; guest code cannot reach this.
    pub fn set_pc(&mut self, pc: u64) {
        self.cpu.set_pc(pc);
    }

    pub fn reg_read(&self, index: u64) -> Result<u64, Fault> {
        self.cpu.read(index)
    }

    pub fn reg_write(&mut self, index: u64, value: u64) -> Result<(), Fault> {
        self.cpu.write(index, value)
    }

    pub fn exit_status(&self) -> Option<u64> {
        self.exit_status
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    pub fn instret(&self) -> u64 {
        self.instret
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn kernel(&self) -> &BasinKernel {
        &self.kernel
    }

    /// Bytes the guest pushed through SBI console-putchar since the last
    /// drain.
    pub fn serial_drain(&mut self) -> Vec<u8> {
        self.sbi.serial_drain()
    }

    /// Queue bytes for SBI console-getchar.
    pub fn serial_feed(&mut self, bytes: &[u8]) {
        self.sbi.feed_input(bytes);
    }

    /// Replace the kernel syscall handler (function IDs >= 10) for tests.
    pub fn set_syscall_handler<F>(&mut self, handler: F)
    where
        F: FnMut(u64, [u64; 4]) -> SyscallResult + 'static,
    {
        self.syscall_override = Some(Box::new(handler));
    }

    pub fn clear_syscall_handler(&mut self) {
        self.syscall_override = None;
    }

    pub fn set_jit(&mut self, backend: Box<dyn JitBackend>) {
        self.jit = Some(backend);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch and jump targets have their low two bits cleared before reaching
/// PC; compiler quirks never turn into alignment faults.
#[inline]
fn jump_target(pc: u64, offset: i64) -> u64 {
    pc.wrapping_add(offset as u64) & !3
}

fn branch_taken(cond: BranchCond, a: u64, b: u64) -> bool {
    match cond {
        BranchCond::Eq => a == b,
        BranchCond::Ne => a != b,
        BranchCond::Lt => (a as i64) < (b as i64),
        BranchCond::Ge => (a as i64) >= (b as i64),
        BranchCond::Ltu => a < b,
        BranchCond::Geu => a >= b,
    }
}

fn alu(op: AluOp, a: u64, b: u64) -> u64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a << (b & 63),
        AluOp::Slt => u64::from((a as i64) < (b as i64)),
        AluOp::Sltu => u64::from(a < b),
        AluOp::Xor => a ^ b,
        AluOp::Srl => a >> (b & 63),
        AluOp::Sra => ((a as i64) >> (b & 63)) as u64,
        AluOp::Or => a | b,
        AluOp::And => a & b,
    }
}

/// 32-bit operations; the result sign-extends into the destination.
fn alu32(op: WordOp, a: u64, b: u64) -> u64 {
    let (a32, shamt) = (a as u32, (b & 31) as u32);
    let result = match op {
        WordOp::Add => a32.wrapping_add(b as u32),
        WordOp::Sub => a32.wrapping_sub(b as u32),
        WordOp::Sll => a32 << shamt,
        WordOp::Srl => a32 >> shamt,
        WordOp::Sra => ((a32 as i32) >> shamt) as u32,
    };
    result as i32 as i64 as u64
}
