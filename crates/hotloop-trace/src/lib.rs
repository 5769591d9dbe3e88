//! In-process call-site profiling for hotloop.
//!
//! This crate keeps one process-wide table of call sites and feeds it from
//! two sources:
//! - **Heap profiling**: a global allocator wrapper that attributes every
//!   allocation and free to the stack that made it
//! - **CPU profiling**: timer-based sampling using SIGPROF
//!
//! Readers take snapshots with [`for_each_callsite`]; nothing is ever
//! exported out of the process.
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! hotloop-trace = { path = "../hotloop-trace", features = ["profiling"] }
//! ```
//!
//! ```rust,ignore
//! hotloop_trace::profiler!();            // heap tracking + CPU at 99Hz
//! hotloop_trace::profiler!(cpu = 199);   // heap tracking + CPU at 199Hz
//! hotloop_trace::profiler!(cpu = 0);     // heap tracking only
//! ```
//!
//! Stacks are captured by walking frame pointers, so build with
//! `-C force-frame-pointers=yes` (the workspace `.cargo/config.toml` does).
//!
//! When the profiling features are disabled the macro still installs the
//! allocator, which then is a plain passthrough to the system allocator.

#![no_std]

#[cfg(all(any(feature = "heap", feature = "cpu"), target_os = "linux"))]
mod profiling;

/// Maximum number of frames stored per call site.
pub const MAX_STACK_DEPTH: usize = 64;

/// A copy of one call-site entry taken at a single point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallsiteSnapshot {
    /// Stack hash identifying the call site (never 0)
    pub hash: u64,
    pub alloc_count: u64,
    pub alloc_bytes: u64,
    pub free_count: u64,
    pub free_bytes: u64,
    pub cpu_samples: u64,
    /// Number of valid entries in `stack`
    pub depth: usize,
    /// Return addresses, innermost frame first
    pub stack: [u64; MAX_STACK_DEPTH],
}

impl CallsiteSnapshot {
    /// An empty snapshot for the given hash with no frames.
    pub const fn new(hash: u64) -> Self {
        Self {
            hash,
            alloc_count: 0,
            alloc_bytes: 0,
            free_count: 0,
            free_bytes: 0,
            cpu_samples: 0,
            depth: 0,
            stack: [0; MAX_STACK_DEPTH],
        }
    }

    /// Captured frames, innermost first.
    pub fn frames(&self) -> &[u64] {
        &self.stack[..self.depth.min(MAX_STACK_DEPTH)]
    }

    /// Objects allocated here that have not been freed yet.
    pub fn live_count(&self) -> u64 {
        self.alloc_count.saturating_sub(self.free_count)
    }

    /// Bytes allocated here that have not been freed yet.
    pub fn live_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }

    /// True when the entry carries allocation data.
    pub fn has_heap_activity(&self) -> bool {
        self.alloc_count > 0
    }
}

#[cfg(all(any(feature = "heap", feature = "cpu"), target_os = "linux"))]
pub use profiling::{for_each_callsite, is_tracking};

/// Visit every occupied call site. No-op when profiling is compiled out.
#[cfg(not(all(any(feature = "heap", feature = "cpu"), target_os = "linux")))]
pub fn for_each_callsite<F: FnMut(&CallsiteSnapshot)>(_f: F) {}

/// Whether the call-site table has been set up in this process.
#[cfg(not(all(any(feature = "heap", feature = "cpu"), target_os = "linux")))]
pub fn is_tracking() -> bool {
    false
}

#[cfg(all(feature = "cpu", target_os = "linux", target_arch = "x86_64"))]
pub use profiling::{cpu_frequency, start_cpu_profiling, stop_cpu_profiling};

// Stubs when CPU sampling is unavailable
#[cfg(not(all(feature = "cpu", target_os = "linux", target_arch = "x86_64")))]
#[inline]
pub fn start_cpu_profiling(_freq_hz: u32) {}

#[cfg(not(all(feature = "cpu", target_os = "linux", target_arch = "x86_64")))]
#[inline]
pub fn stop_cpu_profiling() {}

/// Active CPU sampling rate in Hz, 0 when sampling is off.
#[cfg(not(all(feature = "cpu", target_os = "linux", target_arch = "x86_64")))]
#[inline]
pub fn cpu_frequency() -> u32 {
    0
}

/// A profiling allocator that wraps the system allocator.
///
/// The const generic `CPU_FREQ` specifies the CPU sampling frequency in Hz
/// started on the first allocation. Set to 0 to leave CPU sampling to an
/// explicit [`start_cpu_profiling`] call.
///
/// When the `heap` feature is enabled, this allocator records allocation
/// and deallocation events against the allocating call site.
pub struct ProfilingAllocator<const CPU_FREQ: u32 = 99>;

impl<const CPU_FREQ: u32> ProfilingAllocator<CPU_FREQ> {
    pub const fn new() -> Self {
        Self
    }
}

impl<const CPU_FREQ: u32> Default for ProfilingAllocator<CPU_FREQ> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin layer over libc that honours alignments malloc does not guarantee.
mod sys {
    use core::alloc::Layout;

    /// Alignment malloc guarantees on 64-bit Linux targets.
    const MIN_ALIGN: usize = 16;

    #[inline]
    fn fits_malloc(layout: &Layout) -> bool {
        layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
    }

    #[inline]
    pub unsafe fn alloc(layout: Layout) -> *mut u8 {
        if fits_malloc(&layout) {
            return unsafe { libc::malloc(layout.size()) as *mut u8 };
        }
        let mut out: *mut libc::c_void = core::ptr::null_mut();
        let align = layout.align().max(core::mem::size_of::<usize>());
        let ret = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
        if ret != 0 {
            return core::ptr::null_mut();
        }
        out as *mut u8
    }

    #[inline]
    pub unsafe fn alloc_zeroed(layout: Layout) -> *mut u8 {
        if fits_malloc(&layout) {
            return unsafe { libc::calloc(1, layout.size()) as *mut u8 };
        }
        let ptr = unsafe { alloc(layout) };
        if !ptr.is_null() {
            unsafe { core::ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    #[inline]
    pub unsafe fn dealloc(ptr: *mut u8) {
        unsafe { libc::free(ptr as *mut libc::c_void) }
    }

    #[inline]
    pub unsafe fn realloc(ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            return unsafe { libc::realloc(ptr as *mut libc::c_void, new_size) as *mut u8 };
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return core::ptr::null_mut();
        };
        let new_ptr = unsafe { alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                dealloc(ptr);
            }
        }
        new_ptr
    }
}

#[cfg(not(all(feature = "heap", target_os = "linux")))]
mod disabled {
    use super::{ProfilingAllocator, sys};
    use core::alloc::{GlobalAlloc, Layout};

    unsafe impl<const CPU_FREQ: u32> GlobalAlloc for ProfilingAllocator<CPU_FREQ> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { sys::alloc(layout) }
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            unsafe { sys::dealloc(ptr) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            unsafe { sys::realloc(ptr, layout, new_size) }
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { sys::alloc_zeroed(layout) }
        }
    }
}

#[cfg(all(feature = "heap", target_os = "linux"))]
mod enabled {
    use super::profiling::{record_alloc, record_dealloc};
    use super::{ProfilingAllocator, sys};
    use core::alloc::{GlobalAlloc, Layout};

    #[inline]
    fn maybe_init_cpu<const FREQ: u32>() {
        #[cfg(all(feature = "cpu", target_arch = "x86_64"))]
        {
            use core::sync::atomic::{AtomicBool, Ordering};

            static CPU_INITIALIZED: AtomicBool = AtomicBool::new(false);

            if FREQ > 0 && !CPU_INITIALIZED.swap(true, Ordering::SeqCst) {
                super::profiling::start_cpu_profiling(FREQ);
            }
        }
    }

    unsafe impl<const CPU_FREQ: u32> GlobalAlloc for ProfilingAllocator<CPU_FREQ> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            maybe_init_cpu::<CPU_FREQ>();
            let ptr = unsafe { sys::alloc(layout) };
            if !ptr.is_null() {
                record_alloc(ptr, layout.size());
            }
            ptr
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            record_dealloc(ptr);
            unsafe { sys::dealloc(ptr) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            record_dealloc(ptr);
            let new_ptr = unsafe { sys::realloc(ptr, layout, new_size) };
            if !new_ptr.is_null() {
                record_alloc(new_ptr, new_size);
            }
            new_ptr
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            maybe_init_cpu::<CPU_FREQ>();
            let ptr = unsafe { sys::alloc_zeroed(layout) };
            if !ptr.is_null() {
                record_alloc(ptr, layout.size());
            }
            ptr
        }
    }
}

/// Install the profiling allocator for the current binary.
///
/// ```rust,ignore
/// // Heap tracking + CPU at 99Hz
/// hotloop_trace::profiler!();
///
/// // Heap tracking only; start CPU sampling yourself
/// hotloop_trace::profiler!(cpu = 0);
/// ```
#[macro_export]
macro_rules! profiler {
    () => {
        $crate::profiler!(cpu = 99);
    };
    (cpu = $freq:expr) => {
        #[global_allocator]
        static __HOTLOOP_ALLOC: $crate::ProfilingAllocator<{ $freq }> =
            $crate::ProfilingAllocator::<{ $freq }>::new();
    };
}
