//! Reading this process's own state from `/proc/self`.

mod maps;
mod threads;

pub use maps::{MemoryMapping, MemoryMaps};
pub use threads::{ThreadInfo, clock_ticks_per_sec, current_threads, system_uptime, ticks_to_ns};

/// Path of the running executable as the kernel sees it.
pub const SELF_EXE: &str = "/proc/self/exe";
