//! Profiling implementation - aggregated callsite stats for CPU and heap.

// CPU-only builds leave the allocation table unused
#![cfg_attr(not(feature = "heap"), allow(dead_code))]

use crate::{CallsiteSnapshot, MAX_STACK_DEPTH};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Number of callsite stats slots
const CALLSITE_CAPACITY: usize = 8192;

/// Number of allocation tracking slots
const ALLOC_TABLE_CAPACITY: usize = 256 * 1024;

/// Probe limit for the allocation table
const ALLOC_PROBE_LIMIT: usize = 1024;

/// Tombstone marker for deleted entries (allows continued probing)
const TOMBSTONE: u64 = u64::MAX;

/// FNV-1a prime used to mix frame addresses
const HASH_PRIME: u64 = 0x100000001b3;

/// Highest address a user-space frame pointer can hold
#[cfg(target_arch = "x86_64")]
const USER_SPACE_END: usize = 0x7fff_ffff_ffff;
#[cfg(not(target_arch = "x86_64"))]
const USER_SPACE_END: usize = 0xffff_ffff_ffff;

/// Aggregated stats per callsite
#[repr(C)]
struct CallsiteStats {
    /// Callsite hash (0 = unused slot)
    hash: AtomicU64,
    alloc_count: AtomicU64,
    alloc_bytes: AtomicU64,
    free_count: AtomicU64,
    free_bytes: AtomicU64,
    cpu_samples: AtomicU64,
    stack_depth: AtomicU32,
    _reserved: u32,
    /// Stack trace (stored once per callsite)
    stack: [AtomicU64; MAX_STACK_DEPTH],
}

/// Allocation tracking entry for dealloc attribution
#[repr(C)]
struct AllocEntry {
    /// Pointer address (0 = empty slot)
    ptr: AtomicU64,
    size: AtomicU64,
    callsite_hash: AtomicU64,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static IN_SIGNAL_HANDLER: AtomicBool = AtomicBool::new(false);
static TABLE_BASE: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());

const CALLSITES_SIZE: usize = CALLSITE_CAPACITY * core::mem::size_of::<CallsiteStats>();
const ALLOC_TABLE_SIZE: usize = ALLOC_TABLE_CAPACITY * core::mem::size_of::<AllocEntry>();

#[inline]
fn table_base() -> *mut u8 {
    TABLE_BASE.load(Ordering::Acquire)
}

/// Get pointer to callsite stats array
#[inline]
fn get_callsites() -> *mut CallsiteStats {
    table_base() as *mut CallsiteStats
}

/// Get pointer to alloc table array
#[inline]
fn get_alloc_table() -> *mut AllocEntry {
    unsafe { table_base().add(CALLSITES_SIZE) as *mut AllocEntry }
}

#[inline]
fn table_ready() -> bool {
    !table_base().is_null()
}

/// Whether the call-site table has been set up in this process.
pub fn is_tracking() -> bool {
    table_ready()
}

/// Mix up to `take` frames starting at `skip` into a non-zero key.
#[inline]
fn stack_key(stack: &[u64], depth: u32, skip: usize, take: usize) -> u64 {
    let skip = skip.min(depth as usize);
    let take = take.min((depth as usize).saturating_sub(skip));

    let mut key = 0u64;
    for &addr in &stack[skip..skip + take] {
        key ^= addr;
        key = key.wrapping_mul(HASH_PRIME);
    }

    // 0 marks an empty slot
    if key == 0 { 1 } else { key }
}

/// Heap events skip the allocator frames and hash the next 8.
#[cfg(feature = "heap")]
#[inline]
fn stack_key_heap(stack: &[u64], depth: u32) -> u64 {
    stack_key(stack, depth, 4, 8)
}

/// CPU stacks start with the interrupted PC, so nothing is skipped.
#[cfg(all(feature = "cpu", target_arch = "x86_64"))]
#[inline]
fn stack_key_cpu(stack: &[u64], depth: u32) -> u64 {
    stack_key(stack, depth, 0, 6)
}

/// Find or create a callsite entry.
#[inline]
fn find_or_create_callsite(
    hash: u64,
    stack: &[u64; MAX_STACK_DEPTH],
    depth: u32,
) -> *mut CallsiteStats {
    let callsites = get_callsites();
    let mut idx = (hash as usize) % CALLSITE_CAPACITY;

    for _ in 0..CALLSITE_CAPACITY {
        let entry = unsafe { callsites.add(idx) };
        let stored_hash = unsafe { (*entry).hash.load(Ordering::Acquire) };

        if stored_hash == hash {
            return entry;
        }

        if stored_hash == 0 {
            let claimed = unsafe {
                (*entry)
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            };
            if claimed {
                unsafe {
                    let depth = (depth as usize).min(MAX_STACK_DEPTH);
                    for (slot, &addr) in (*entry).stack.iter().zip(&stack[..depth]) {
                        slot.store(addr, Ordering::Relaxed);
                    }
                    (*entry).stack_depth.store(depth as u32, Ordering::Release);
                }
                return entry;
            }

            // Lost the race; the winner may have stored our hash
            if unsafe { (*entry).hash.load(Ordering::Acquire) } == hash {
                return entry;
            }
        }

        idx = (idx + 1) % CALLSITE_CAPACITY;
    }

    // Table full - aggregate into the first slot
    callsites
}

/// Find a callsite by hash only (for dealloc attribution)
#[cfg(feature = "heap")]
#[inline]
fn find_callsite(hash: u64) -> *mut CallsiteStats {
    let callsites = get_callsites();
    let mut idx = (hash as usize) % CALLSITE_CAPACITY;

    for _ in 0..CALLSITE_CAPACITY {
        let entry = unsafe { callsites.add(idx) };
        let stored_hash = unsafe { (*entry).hash.load(Ordering::Acquire) };

        if stored_hash == hash {
            return entry;
        }
        if stored_hash == 0 {
            return core::ptr::null_mut();
        }

        idx = (idx + 1) % CALLSITE_CAPACITY;
    }

    core::ptr::null_mut()
}

/// Track an allocation in the alloc table
#[cfg(feature = "heap")]
#[inline]
fn track_alloc(ptr: u64, size: u64, callsite_hash: u64) {
    let alloc_table = get_alloc_table();
    // Low bits are mostly zero from alignment
    let mut idx = ((ptr >> 4) as usize) % ALLOC_TABLE_CAPACITY;

    for _ in 0..ALLOC_PROBE_LIMIT {
        let entry = unsafe { alloc_table.add(idx) };
        let stored_ptr = unsafe { (*entry).ptr.load(Ordering::Acquire) };

        if stored_ptr == 0 || stored_ptr == TOMBSTONE {
            let claimed = unsafe {
                (*entry)
                    .ptr
                    .compare_exchange(stored_ptr, ptr, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            };
            if claimed {
                unsafe {
                    (*entry).size.store(size, Ordering::Relaxed);
                    (*entry)
                        .callsite_hash
                        .store(callsite_hash, Ordering::Release);
                }
                return;
            }
        }

        idx = (idx + 1) % ALLOC_TABLE_CAPACITY;
    }

    // Too much probing - this allocation stays unattributed on free
}

/// Untrack an allocation, returning (size, callsite_hash) if found
#[cfg(feature = "heap")]
#[inline]
fn untrack_alloc(ptr: u64) -> Option<(u64, u64)> {
    let alloc_table = get_alloc_table();
    let mut idx = ((ptr >> 4) as usize) % ALLOC_TABLE_CAPACITY;

    for _ in 0..ALLOC_PROBE_LIMIT {
        let entry = unsafe { alloc_table.add(idx) };
        let stored_ptr = unsafe { (*entry).ptr.load(Ordering::Acquire) };

        if stored_ptr == ptr {
            let size = unsafe { (*entry).size.load(Ordering::Relaxed) };
            let callsite_hash = unsafe { (*entry).callsite_hash.load(Ordering::Acquire) };
            // Tombstone, not 0, so later probes keep walking
            unsafe { (*entry).ptr.store(TOMBSTONE, Ordering::Release) };
            return Some((size, callsite_hash));
        }

        if stored_ptr == 0 {
            // Allocated before tracking started, or dropped on overflow
            return None;
        }

        idx = (idx + 1) % ALLOC_TABLE_CAPACITY;
    }

    None
}

/// Map the call-site and allocation tables.
///
/// Runs inside the allocator, so it must not allocate: the tables come
/// straight from an anonymous mapping, which the kernel hands out zeroed.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            CALLSITES_SIZE + ALLOC_TABLE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        INITIALIZED.store(false, Ordering::SeqCst);
        return;
    }

    TABLE_BASE.store(ptr as *mut u8, Ordering::Release);
}

/// Visit a snapshot of every occupied call site.
///
/// The callback may allocate: entries are copied out before it runs and
/// the table is never locked.
pub fn for_each_callsite<F: FnMut(&CallsiteSnapshot)>(mut f: F) {
    if !table_ready() {
        return;
    }

    let callsites = get_callsites();
    for idx in 0..CALLSITE_CAPACITY {
        let entry = unsafe { &*callsites.add(idx) };
        let hash = entry.hash.load(Ordering::Acquire);
        if hash == 0 {
            continue;
        }

        let mut snapshot = CallsiteSnapshot::new(hash);
        snapshot.depth = (entry.stack_depth.load(Ordering::Acquire) as usize).min(MAX_STACK_DEPTH);
        for (dst, src) in snapshot.stack.iter_mut().zip(&entry.stack[..snapshot.depth]) {
            *dst = src.load(Ordering::Relaxed);
        }
        snapshot.alloc_count = entry.alloc_count.load(Ordering::Relaxed);
        snapshot.alloc_bytes = entry.alloc_bytes.load(Ordering::Relaxed);
        snapshot.free_count = entry.free_count.load(Ordering::Relaxed);
        snapshot.free_bytes = entry.free_bytes.load(Ordering::Relaxed);
        snapshot.cpu_samples = entry.cpu_samples.load(Ordering::Relaxed);

        f(&snapshot);
    }
}

/// Read the caller's frame and stack pointers.
#[cfg(feature = "heap")]
#[inline(always)]
fn current_registers() -> (*const usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let fp: *const usize;
        let sp: usize;
        unsafe {
            core::arch::asm!(
                "mov {}, rbp",
                "mov {}, rsp",
                out(reg) fp,
                out(reg) sp,
                options(nomem, nostack, preserves_flags)
            );
        }
        (fp, sp)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let fp: *const usize;
        let sp: usize;
        unsafe {
            core::arch::asm!(
                "mov {}, x29",
                "mov {}, sp",
                out(reg) fp,
                out(reg) sp,
                options(nomem, nostack, preserves_flags)
            );
        }
        (fp, sp)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        (core::ptr::null(), 0)
    }
}

/// Farthest a frame record may sit above the stack pointer
const STACK_WINDOW: usize = 8 * 1024 * 1024;

/// Addresses a frame record must fall within: from the stack pointer up
/// to [`STACK_WINDOW`] above it.
#[derive(Clone, Copy)]
struct StackBounds {
    low: usize,
    high: usize,
}

impl StackBounds {
    fn above(sp: usize) -> Self {
        StackBounds {
            low: sp,
            high: sp.saturating_add(STACK_WINDOW).min(USER_SPACE_END),
        }
    }

    /// A two-word frame record at `fp` lies inside the window
    fn holds_record(&self, fp: usize) -> bool {
        fp & 0x7 == 0
            && fp >= self.low.max(0x1000)
            && fp
                .checked_add(2 * core::mem::size_of::<usize>())
                .is_some_and(|end| end <= self.high)
    }
}

/// How frame records are loaded
#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameRead {
    /// Plain loads. Only for stacks of code built with frame pointers.
    Direct,
    /// Through `process_vm_readv`, which reports a bad address instead of
    /// faulting. Used on interrupted contexts, where the frame pointer
    /// register may hold anything.
    #[cfg_attr(not(all(feature = "cpu", target_arch = "x86_64")), allow(dead_code))]
    Checked,
}

/// Load `[fp]` (caller's fp) and `[fp + 8]` (return address).
fn read_record(fp: usize, mode: FrameRead) -> Option<(usize, usize)> {
    match mode {
        FrameRead::Direct => {
            let fp = fp as *const usize;
            Some(unsafe { (*fp, *fp.add(1)) })
        }
        FrameRead::Checked => {
            let mut record = [0usize; 2];
            let len = core::mem::size_of_val(&record);
            let local = libc::iovec {
                iov_base: record.as_mut_ptr() as *mut libc::c_void,
                iov_len: len,
            };
            let remote = libc::iovec {
                iov_base: fp as *mut libc::c_void,
                iov_len: len,
            };
            let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
            (read == len as isize).then_some((record[0], record[1]))
        }
    }
}

/// Walk saved frame pointers from `fp`, appending return addresses after
/// the first `depth` entries. Returns the new depth.
///
/// Every record must lie within `bounds` and each caller's record must sit
/// strictly above its callee's; the walk stops at the first one that does
/// not.
#[inline(always)]
fn walk_frames(
    stack: &mut [u64; MAX_STACK_DEPTH],
    mut depth: u32,
    fp: *const usize,
    bounds: StackBounds,
    mode: FrameRead,
) -> u32 {
    let mut fp = fp as usize;

    while (depth as usize) < MAX_STACK_DEPTH && bounds.holds_record(fp) {
        let Some((next_fp, ret_addr)) = read_record(fp, mode) else {
            break;
        };
        if ret_addr == 0 {
            break;
        }

        stack[depth as usize] = ret_addr as u64;
        depth += 1;

        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }

    depth
}

/// Capture the current thread's stack using frame pointers
#[cfg(feature = "heap")]
#[inline(never)]
fn capture_stack(stack: &mut [u64; MAX_STACK_DEPTH]) -> u32 {
    let (fp, sp) = current_registers();
    walk_frames(stack, 0, fp, StackBounds::above(sp), FrameRead::Direct)
}

// =============================================================================
// Heap profiling (conditional on "heap" feature)
// =============================================================================

/// Record an allocation event
#[cfg(feature = "heap")]
#[inline(never)]
pub fn record_alloc(ptr: *mut u8, size: usize) {
    if IN_SIGNAL_HANDLER.load(Ordering::Relaxed) {
        return;
    }

    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }

    if !table_ready() {
        return;
    }

    let mut stack = [0u64; MAX_STACK_DEPTH];
    let depth = capture_stack(&mut stack);
    let hash = stack_key_heap(&stack, depth);

    let callsite = find_or_create_callsite(hash, &stack, depth);
    unsafe {
        (*callsite).alloc_count.fetch_add(1, Ordering::Relaxed);
        (*callsite)
            .alloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    track_alloc(ptr as u64, size as u64, hash);
}

/// Record a deallocation event
#[cfg(feature = "heap")]
#[inline(never)]
pub fn record_dealloc(ptr: *mut u8) {
    if IN_SIGNAL_HANDLER.load(Ordering::Relaxed) {
        return;
    }

    if !table_ready() {
        return;
    }

    if let Some((size, callsite_hash)) = untrack_alloc(ptr as u64) {
        let callsite = find_callsite(callsite_hash);
        if !callsite.is_null() {
            unsafe {
                (*callsite).free_count.fetch_add(1, Ordering::Relaxed);
                (*callsite).free_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// CPU profiling (conditional on "cpu" feature)
// =============================================================================

#[cfg(all(feature = "cpu", target_arch = "x86_64"))]
mod cpu_profiling {
    use super::*;

    /// Default sampling frequency in Hz
    const DEFAULT_FREQ_HZ: u32 = 99;

    /// Active sampling frequency, 0 when stopped
    static ACTIVE_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

    /// Signal handler for CPU sampling
    extern "C" fn cpu_sample_handler(
        _sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        // Prevent reentrant calls
        if IN_SIGNAL_HANDLER.swap(true, Ordering::SeqCst) {
            return;
        }

        if !table_ready() {
            IN_SIGNAL_HANDLER.store(false, Ordering::SeqCst);
            return;
        }

        // Interrupted registers from the ucontext
        let (rip, start_fp, sp) = if !ucontext.is_null() {
            unsafe {
                let uc = ucontext as *const libc::ucontext_t;
                const REG_RBP: usize = 10;
                const REG_RSP: usize = 15;
                const REG_RIP: usize = 16;
                let gregs = &(*uc).uc_mcontext.gregs;
                (
                    gregs[REG_RIP] as u64,
                    gregs[REG_RBP] as usize as *const usize,
                    gregs[REG_RSP] as usize,
                )
            }
        } else {
            (0, core::ptr::null(), 0)
        };

        // RIP is the first frame
        let mut stack = [0u64; MAX_STACK_DEPTH];
        let mut depth = 0u32;
        if rip != 0 {
            stack[0] = rip;
            depth = 1;
        }
        // Code without frame pointers leaves arbitrary values in RBP; such
        // samples keep only the RIP leaf
        let depth = if sp == 0 {
            depth
        } else {
            walk_frames(
                &mut stack,
                depth,
                start_fp,
                StackBounds::above(sp),
                FrameRead::Checked,
            )
        };

        let hash = stack_key_cpu(&stack, depth);
        let callsite = find_or_create_callsite(hash, &stack, depth);
        unsafe { (*callsite).cpu_samples.fetch_add(1, Ordering::Relaxed) };

        IN_SIGNAL_HANDLER.store(false, Ordering::SeqCst);
    }

    fn set_timer(period_usec: u64) {
        let interval = libc::timeval {
            tv_sec: (period_usec / 1_000_000) as libc::time_t,
            tv_usec: (period_usec % 1_000_000) as libc::suseconds_t,
        };
        let timer = libc::itimerval {
            it_interval: interval,
            it_value: interval,
        };
        unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, core::ptr::null_mut()) };
    }

    /// Start CPU profiling with timer-based sampling
    pub fn start_cpu_profiling(freq_hz: u32) {
        if !INITIALIZED.load(Ordering::Relaxed) {
            init();
        }

        unsafe {
            let mut sa: libc::sigaction = core::mem::zeroed();
            sa.sa_sigaction = cpu_sample_handler as *const () as usize;
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);

            if libc::sigaction(libc::SIGPROF, &sa, core::ptr::null_mut()) < 0 {
                return;
            }
        }

        let freq = if freq_hz == 0 {
            DEFAULT_FREQ_HZ
        } else {
            freq_hz
        };
        set_timer((1_000_000 / freq as u64).max(1));
        ACTIVE_FREQ_HZ.store(freq, Ordering::Release);
    }

    /// Stop CPU profiling
    pub fn stop_cpu_profiling() {
        set_timer(0);

        unsafe {
            let mut sa: libc::sigaction = core::mem::zeroed();
            // Ignore rather than default: a SIGPROF still in flight would kill us
            sa.sa_sigaction = libc::SIG_IGN;
            libc::sigaction(libc::SIGPROF, &sa, core::ptr::null_mut());
        }

        ACTIVE_FREQ_HZ.store(0, Ordering::Release);
    }

    /// Active CPU sampling rate in Hz, 0 when sampling is off.
    pub fn cpu_frequency() -> u32 {
        ACTIVE_FREQ_HZ.load(Ordering::Acquire)
    }
}

#[cfg(all(feature = "cpu", target_arch = "x86_64"))]
pub use cpu_profiling::{cpu_frequency, start_cpu_profiling, stop_cpu_profiling};
