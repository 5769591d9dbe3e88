//! Text renderings of the in-process profiling data.
//!
//! Every profile is built from a list of [`CallsiteSnapshot`]s (or, for
//! threads and blocking, from `/proc`) and rendered through a
//! [`Symbolize`] implementation, so the renderers can be exercised with
//! synthetic stacks and a fake symbol table.

mod block;
mod cpu;
mod heap;
mod index;
mod threads;

pub use block::render_block;
pub use cpu::{CpuProfile, CpuStack};
pub use heap::{HeapOrder, HeapProfile, HeapRecord};
pub use index::{Index, IndexEntry};
pub use threads::render_threads;

use crate::symbols::{Location, SymbolResolver};
use hotloop_trace::CallsiteSnapshot;

/// Maps a code address to a source location.
pub trait Symbolize: Send + Sync {
    /// Resolve an exact instruction address.
    fn symbolize(&self, addr: u64) -> Option<Location>;
}

impl Symbolize for SymbolResolver {
    fn symbolize(&self, addr: u64) -> Option<Location> {
        self.resolve(addr)
    }
}

/// Symbolizer used when the executable's symbols could not be loaded.
/// Every frame renders as its raw address.
pub struct NoSymbols;

impl Symbolize for NoSymbols {
    fn symbolize(&self, _addr: u64) -> Option<Location> {
        None
    }
}

/// Functions belonging to the allocator wrapper or the sampler itself
const PROFILER_FRAME_PATTERNS: &[&str] = &[
    "hotloop_trace::",
    "__rust_alloc",
    "__rust_dealloc",
    "__rust_realloc",
    "__rg_alloc",
    "__rg_dealloc",
    "__rg_realloc",
    "__rdl_",
];

/// One resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Address as captured
    pub addr: u64,
    pub location: Option<Location>,
}

impl Frame {
    /// Function name, or the raw address when unresolved
    pub fn name(&self) -> String {
        match &self.location {
            Some(loc) => loc.function.clone(),
            None => format!("{:#x}", self.addr),
        }
    }

    fn is_profiler(&self) -> bool {
        self.location.as_ref().is_some_and(|loc| {
            PROFILER_FRAME_PATTERNS
                .iter()
                .any(|p| loc.function.contains(p))
        })
    }
}

/// Resolve a captured stack, innermost frame first.
///
/// Captured frames are return addresses, which point one instruction past
/// the call, so they are looked up at `addr - 1`. With `exact_leaf` the
/// first frame is an interrupted instruction pointer and resolved as is.
/// Leading frames inside the profiler are dropped.
pub fn resolve_stack(frames: &[u64], exact_leaf: bool, symbols: &dyn Symbolize) -> Vec<Frame> {
    let resolved = frames.iter().enumerate().map(|(i, &addr)| {
        let location = if i == 0 && exact_leaf {
            symbols.symbolize(addr)
        } else {
            resolve_return_address(addr, symbols)
        };
        Frame { addr, location }
    });

    resolved.skip_while(Frame::is_profiler).collect()
}

fn resolve_return_address(addr: u64, symbols: &dyn Symbolize) -> Option<Location> {
    let mut loc = symbols.symbolize(addr.checked_sub(1)?)?;
    loc.offset += 1;
    Some(loc)
}

/// Copy every occupied call site out of the shared table.
pub fn collect_callsites() -> Vec<CallsiteSnapshot> {
    let mut callsites = Vec::new();
    hotloop_trace::for_each_callsite(|cs| callsites.push(*cs));
    callsites
}

/// Format nanoseconds for display
fn format_ns(ns: u64) -> String {
    let d = std::time::Duration::from_nanos(ns);
    // Millisecond precision is enough for scheduler counters
    let d = std::time::Duration::from_millis(d.as_millis() as u64);
    if d.is_zero() {
        "0s".to_string()
    } else {
        humantime::format_duration(d).to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Symbol table keyed by function start, each function 0x1000 bytes long
    pub struct FakeSymbols {
        functions: HashMap<u64, &'static str>,
    }

    impl FakeSymbols {
        pub fn new(functions: &[(u64, &'static str)]) -> Self {
            FakeSymbols {
                functions: functions.iter().copied().collect(),
            }
        }
    }

    impl Symbolize for FakeSymbols {
        fn symbolize(&self, addr: u64) -> Option<Location> {
            let base = addr & !0xfff;
            self.functions.get(&base).map(|name| Location {
                function: name.to_string(),
                offset: addr - base,
                file: "src/workload.rs".to_string(),
                line: (base >> 12) as u32,
            })
        }
    }

    pub fn callsite(hash: u64, frames: &[u64]) -> CallsiteSnapshot {
        let mut cs = CallsiteSnapshot::new(hash);
        cs.stack[..frames.len()].copy_from_slice(frames);
        cs.depth = frames.len();
        cs
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSymbols;
    use super::*;

    fn symbols() -> FakeSymbols {
        FakeSymbols::new(&[
            (0x1000, "hotloop_trace::enabled::alloc"),
            (0x2000, "hotloop::workload::SampleBuffer::fill"),
            (0x3000, "hotloop::main"),
        ])
    }

    #[test]
    fn test_resolve_stack_drops_profiler_frames() {
        let frames = resolve_stack(&[0x1010, 0x2020, 0x3030], false, &symbols());
        let names: Vec<String> = frames.iter().map(Frame::name).collect();
        assert_eq!(names, ["hotloop::workload::SampleBuffer::fill", "hotloop::main"]);
    }

    #[test]
    fn test_return_address_looked_up_before_call() {
        // A call that is the last instruction of a function returns to the
        // first byte of the next one
        let frames = resolve_stack(&[0x2010, 0x3000], false, &symbols());
        let caller = frames[1].location.as_ref().unwrap();
        assert_eq!(caller.function, "hotloop::workload::SampleBuffer::fill");
        assert_eq!(caller.offset, 0x1000);
    }

    #[test]
    fn test_exact_leaf_is_not_adjusted() {
        let frames = resolve_stack(&[0x3000, 0x3040], true, &symbols());
        assert_eq!(frames[0].name(), "hotloop::main");
        assert_eq!(frames[0].location.as_ref().unwrap().offset, 0);
    }

    #[test]
    fn test_unresolved_frames_keep_address() {
        let frames = resolve_stack(&[0xdead_beef], false, &NoSymbols);
        assert_eq!(frames[0].name(), "0xdeadbeef");
    }

    #[test]
    fn test_format_ns() {
        assert_eq!(format_ns(0), "0s");
        assert_eq!(format_ns(1_500_000_000), "1s 500ms");
        assert_eq!(format_ns(999), "0s");
    }
}
