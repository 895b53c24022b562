//! Syscall surface: guest-driven mapping scenarios plus dispatcher-level
//! contracts exercised through the public kernel API.

mod common;

use basin_vm::kernel::{BasinKernel, SyscallOutcome};
use basin_vm::layout::{MAX_MESSAGE_SIZE, MEMORY_BASE, MMAP_SEARCH_BASE, PAGE_SIZE};
use basin_vm::mem::Memory;
use basin_vm::{
    decode_result, AlignmentMode, ErrorKind, RunOutcome, SyscallResult, VmState,
};
use common::*;

/// Drive the kernel the way the dispatcher does and decode the a0 encoding,
/// so these tests cover the whole guest-visible contract.
fn call(kernel: &mut BasinKernel, mem: &mut Memory, nr: u64, args: [u64; 4]) -> SyscallResult {
    match kernel.handle_syscall(nr, args, mem, 0) {
        SyscallOutcome::Return(result) => {
            decode_result(basin_vm::encode_result(result))
        }
        SyscallOutcome::Exit(status) => panic!("unexpected exit({status})"),
    }
}

fn setup() -> (BasinKernel, Memory) {
    (
        BasinKernel::new(),
        Memory::new(32 * 1024 * 1024, AlignmentMode::Permissive),
    )
}

#[test]
fn map_write_read_unmap_remap_from_guest() {
    // The §map scenario end to end, driven by guest code:
    // B = map(0, 4096, RW); *B = sentinel; x6 = *B; unmap(B);
    // B2 = map(0, 4096, RW); if B2 != B exit(99) else exit(x6).
    let sentinel = 0x5a5;
    let program = [
        addi(17, 0, 14), // map
        addi(10, 0, 0),
        lui(11, 1), // 4096
        addi(12, 0, 3), // RW
        ECALL,
        mv(9, 10), // x9 = B
        addi(5, 0, sentinel),
        sd(5, 9, 0),
        ld(6, 9, 0),
        addi(17, 0, 15), // unmap
        mv(10, 9),
        lui(11, 1),
        ECALL,
        addi(17, 0, 14), // map again
        addi(10, 0, 0),
        lui(11, 1),
        addi(12, 0, 3),
        ECALL,
        bne(10, 9, 16), // lowest-free policy: B2 == B
        addi(17, 0, 11),
        mv(10, 6),
        ECALL,
        addi(17, 0, 11), // failure path
        addi(10, 0, 99),
        ECALL,
    ];
    let mut vm = boot_words(&program);
    let outcome = vm.run(1_000).unwrap();
    assert_eq!(outcome, RunOutcome::Halted { status: sentinel as u64 });

    // The final mapping is live at the deterministic first-fit base.
    let entries = vm.kernel().mappings();
    assert_eq!(entries.in_use(), 1);
    assert!(entries
        .entries()
        .iter()
        .any(|e| e.base == MMAP_SEARCH_BASE && e.length == PAGE_SIZE));
}

#[test]
fn unknown_syscall_number() {
    let (mut kernel, mut mem) = setup();
    assert_eq!(
        call(&mut kernel, &mut mem, 200, [0; 4]),
        Err(ErrorKind::UnknownSyscall)
    );
    assert_eq!(
        call(&mut kernel, &mut mem, 9_999, [0; 4]),
        Err(ErrorKind::UnknownSyscall)
    );
}

#[test]
fn exit_reaches_dispatcher_as_halt() {
    let (mut kernel, mut mem) = setup();
    assert_eq!(
        kernel.handle_syscall(11, [0x42, 0, 0, 0], &mut mem, 0),
        SyscallOutcome::Exit(0x42)
    );
    // Oversized status refuses to halt.
    assert_eq!(
        kernel.handle_syscall(11, [u64::MAX, 0, 0, 0], &mut mem, 0),
        SyscallOutcome::Return(Err(ErrorKind::InvalidArgument))
    );
}

#[test]
fn mapping_overlap_scenario() {
    let (mut kernel, mut mem) = setup();
    let rw = 3;
    assert_eq!(
        call(&mut kernel, &mut mem, 14, [0x1_0000, 4096, rw, 0]),
        Ok(0x1_0000)
    );
    let before = kernel.mappings().in_use();
    assert_eq!(
        call(&mut kernel, &mut mem, 14, [0x1_0800, 4096, rw, 0]),
        Err(ErrorKind::Overlap)
    );
    assert_eq!(kernel.mappings().in_use(), before);
}

#[test]
fn mapping_table_exhaustion_reports_table_full() {
    let (mut kernel, mut mem) = setup();
    for _ in 0..256 {
        call(&mut kernel, &mut mem, 14, [0, 4096, 3, 0]).unwrap();
    }
    assert_eq!(
        call(&mut kernel, &mut mem, 14, [0, 4096, 3, 0]),
        Err(ErrorKind::TableFull)
    );
}

#[test]
fn channel_send_boundary_sizes() {
    let (mut kernel, mut mem) = setup();
    let ch = call(&mut kernel, &mut mem, 17, [0; 4]).unwrap();

    // Exactly 64 KiB goes through; one byte more is invalid.
    assert_eq!(
        call(&mut kernel, &mut mem, 18, [ch, MEMORY_BASE, MAX_MESSAGE_SIZE, 0]),
        Ok(0)
    );
    assert_eq!(
        call(&mut kernel, &mut mem, 18, [ch, MEMORY_BASE, MAX_MESSAGE_SIZE + 1, 0]),
        Err(ErrorKind::InvalidArgument)
    );

    let got = call(&mut kernel, &mut mem, 19, [ch, MEMORY_BASE, MAX_MESSAGE_SIZE, 0]).unwrap();
    assert_eq!(got, MAX_MESSAGE_SIZE);
}

#[test]
fn channel_round_trip_through_guest_memory() {
    let (mut kernel, mut mem) = setup();
    let ch = call(&mut kernel, &mut mem, 17, [0; 4]).unwrap();

    mem.slice_mut(MEMORY_BASE, 5).unwrap().copy_from_slice(b"hello");
    call(&mut kernel, &mut mem, 18, [ch, MEMORY_BASE, 5, 0]).unwrap();

    let dst = MEMORY_BASE + PAGE_SIZE;
    let got = call(&mut kernel, &mut mem, 19, [ch, dst, 64, 0]).unwrap();
    assert_eq!(got, 5);
    assert_eq!(mem.slice(dst, 5).unwrap(), b"hello");

    // close, then the handle is dead.
    assert_eq!(call(&mut kernel, &mut mem, 23, [ch, 0, 0, 0]), Ok(0));
    assert_eq!(
        call(&mut kernel, &mut mem, 18, [ch, MEMORY_BASE, 1, 0]),
        Err(ErrorKind::NotFound)
    );
}

#[test]
fn file_lifecycle_through_dispatcher() {
    let (mut kernel, mut mem) = setup();
    mem.slice_mut(MEMORY_BASE, 9).unwrap().copy_from_slice(b"/var/log\0");

    let h = call(&mut kernel, &mut mem, 20, [MEMORY_BASE, 2, 0, 0]).unwrap();
    assert_ne!(h, 0);
    assert_eq!(
        call(&mut kernel, &mut mem, 22, [h, MEMORY_BASE, 128, 0]),
        Ok(128)
    );
    assert_eq!(
        call(&mut kernel, &mut mem, 21, [h, MEMORY_BASE, 128, 0]),
        Ok(0)
    );
    assert_eq!(call(&mut kernel, &mut mem, 23, [h, 0, 0, 0]), Ok(0));
    assert_eq!(
        call(&mut kernel, &mut mem, 22, [h, MEMORY_BASE, 1, 0]),
        Err(ErrorKind::NotFound)
    );
}

#[test]
fn spawn_wait_through_dispatcher() {
    let (mut kernel, mut mem) = setup();
    mem.slice_mut(MEMORY_BASE, 10).unwrap().copy_from_slice(b"/bin/init\0");

    let pid = call(&mut kernel, &mut mem, 10, [MEMORY_BASE, 0, 0, 0]).unwrap();
    assert_eq!(call(&mut kernel, &mut mem, 13, [pid, 0, 0, 0]), Ok(0));
    assert_eq!(
        call(&mut kernel, &mut mem, 13, [pid, 0, 0, 0]),
        Err(ErrorKind::NotFound)
    );
}

#[test]
fn failed_syscalls_leave_tables_unchanged() {
    let (mut kernel, mut mem) = setup();
    mem.slice_mut(MEMORY_BASE, 3).unwrap().copy_from_slice(b"/x\0");
    call(&mut kernel, &mut mem, 20, [MEMORY_BASE, 1, 0, 0]).unwrap();
    call(&mut kernel, &mut mem, 17, [0; 4]).unwrap();
    call(&mut kernel, &mut mem, 14, [0, 4096, 3, 0]).unwrap();

    let handles = kernel.handles().in_use();
    let mappings = kernel.mappings().in_use();
    let channels = kernel.channels().in_use();

    // A representative failure of each family.
    let bad: [(u64, [u64; 4]); 6] = [
        (14, [0, 100, 3, 0]),              // unaligned size
        (15, [0xdead_000, 4096, 0, 0]),    // unmap of nothing
        (18, [0, MEMORY_BASE, 8, 0]),      // invalid channel handle
        (20, [2, 1, 0, 0]),                // unreadable path
        (13, [777, 0, 0, 0]),              // wait on unknown pid
        (24, [9, MEMORY_BASE, 0, 0]),      // bad clock id
    ];
    for (nr, args) in bad {
        assert!(call(&mut kernel, &mut mem, nr, args).is_err());
    }

    assert_eq!(kernel.handles().in_use(), handles);
    assert_eq!(kernel.mappings().in_use(), mappings);
    assert_eq!(kernel.channels().in_use(), channels);
}

#[test]
fn clock_and_sysinfo_through_guest() {
    // clock_gettime(monotonic, buf); sysinfo(buf+16); exit(sec).
    let buf = 0x2_0000;
    let program = [
        addi(17, 0, 24), // clock_gettime
        addi(10, 0, 0),
        lui(11, buf >> 12),
        ECALL,
        addi(17, 0, 26), // sysinfo
        lui(10, buf >> 12),
        addi(10, 10, 64),
        ECALL,
        addi(17, 0, 11),
        addi(10, 0, 0),
        ECALL,
    ];
    let mut vm = boot_words(&program);
    assert_eq!(vm.run(100).unwrap(), RunOutcome::Halted { status: 0 });
    assert_eq!(vm.state(), VmState::Halted);

    let mem = vm.memory();
    // sysinfo field 0 is the memory size, field 1 the page size.
    assert_eq!(mem.load_u64(u64::from(buf) + 64).unwrap(), mem.size());
    assert_eq!(mem.load_u64(u64::from(buf) + 72).unwrap(), PAGE_SIZE);
}

#[test]
fn syscall_override_intercepts_kernel_calls() {
    let mut vm = boot_words(&[
        addi(17, 0, 17), // channel_create would normally allocate
        ECALL,
        addi(17, 0, 11),
        addi(10, 0, 0),
        ECALL,
    ]);
    vm.set_syscall_handler(|nr, _args| {
        assert_eq!(nr, 17);
        Ok(0x77)
    });
    vm.step_n(2).unwrap();
    assert_eq!(vm.reg_read(10).unwrap(), 0x77);
    // The kernel never saw the call.
    assert_eq!(vm.kernel().channels().in_use(), 0);

    // With the override removed, the native kernel handles exit.
    vm.clear_syscall_handler();
    assert_eq!(vm.run(10).unwrap(), RunOutcome::Halted { status: 0 });
}
