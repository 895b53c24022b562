//! ECALL routing: traps go to SBI below function ID 10, to the Basin kernel
//! at 10 and above. The result is encoded into a0 and PC advances by 4,
//! except for calls that halt the machine (exit, SBI system-reset), which
//! leave PC on the trapping instruction.

use crate::cpu::{abi, RegisterFile};
use crate::error::{encode_result, SyscallResult};
use crate::kernel::{BasinKernel, SyscallOutcome, KERNEL_SYSCALL_BASE};
use crate::mem::Memory;
use crate::sbi::{Sbi, SbiOutcome};

/// Test-harness override for the kernel half of the dispatcher.
pub type SyscallHandler = Box<dyn FnMut(u64, [u64; 4]) -> SyscallResult>;

pub(crate) enum EcallEffect {
    Advance,
    Halt { status: u64 },
}

pub(crate) fn dispatch(
    cpu: &mut RegisterFile,
    mem: &mut Memory,
    kernel: &mut BasinKernel,
    sbi: &mut Sbi,
    override_handler: Option<&mut SyscallHandler>,
    now_ns: u64,
) -> EcallEffect {
    let nr = cpu.get(abi::A7);
    let args = [
        cpu.get(abi::A0),
        cpu.get(abi::A1),
        cpu.get(abi::A2),
        cpu.get(abi::A3),
    ];

    if nr < KERNEL_SYSCALL_BASE {
        return match sbi.handle(nr, args[0]) {
            SbiOutcome::Ret(value) => {
                cpu.set(abi::A0, value);
                EcallEffect::Advance
            }
            SbiOutcome::Shutdown => EcallEffect::Halt { status: 0 },
        };
    }

    if let Some(handler) = override_handler {
        let result = handler(nr, args);
        cpu.set(abi::A0, encode_result(result));
        return EcallEffect::Advance;
    }

    match kernel.handle_syscall(nr, args, mem, now_ns) {
        SyscallOutcome::Return(result) => {
            cpu.set(abi::A0, encode_result(result));
            EcallEffect::Advance
        }
        SyscallOutcome::Exit(status) => EcallEffect::Halt { status },
    }
}
