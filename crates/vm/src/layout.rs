//! Guest address-space layout constants.

/// Unit of mapping alignment and granularity.
pub const PAGE_SIZE: u64 = 4096;

/// Default guest RAM size when the host does not configure one.
pub const DEFAULT_MEMORY_SIZE: u64 = 64 * 1024 * 1024;

/// Lowest valid guest address. Accesses below this are out of range, which
/// keeps null-ish pointers faulting and gives the frame-pointer fallback a
/// window to trigger in.
pub const MEMORY_BASE: u64 = 0x1_0000;

/// Reserved region at the top of RAM; the initial stack pointer sits below it.
pub const STACK_GUARD_SIZE: u64 = 64 * 1024;

/// Region directly below the initial stack pointer holding argc/argv.
pub const ARG_REGION_SIZE: u64 = 4096;

/// First candidate base for kernel-chosen mappings (`map` with addr = 0).
pub const MMAP_SEARCH_BASE: u64 = 16 * 1024 * 1024;

/// Capacity of the host-visible serial ring.
pub const SERIAL_RING_CAPACITY: usize = 64 * 1024;

/// Largest channel message accepted by send/recv.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Messages a single channel will queue before `send` reports `would_block`.
pub const CHANNEL_QUEUE_DEPTH: usize = 16;

/// Longest path accepted by `open` and `spawn`, NUL exclusive.
pub const MAX_PATH_LEN: u64 = 256;

/// Most arguments `spawn` will marshal for a child image.
pub const MAX_SPAWN_ARGS: u64 = 64;

pub const HANDLE_TABLE_SIZE: usize = 64;
pub const MAPPING_TABLE_SIZE: usize = 256;
pub const CHANNEL_TABLE_SIZE: usize = 64;

/// Virtual nanoseconds charged per retired instruction. The guest clock is
/// derived from the instruction counter so that runs are reproducible.
pub const NS_PER_INSTRUCTION: u64 = 10;

/// Synthetic offset between the monotonic and realtime clocks.
pub const REALTIME_EPOCH_NS: u64 = 1_700_000_000_000_000_000;

/// True if `value` is a whole number of pages.
#[inline]
pub const fn page_multiple(value: u64) -> bool {
    value != 0 && value % PAGE_SIZE == 0
}

/// True if `addr` sits on a page boundary.
#[inline]
pub const fn page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}
