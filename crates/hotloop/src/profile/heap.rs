use super::{Symbolize, resolve_stack};
use hotloop_trace::CallsiteSnapshot;
use std::fmt::Write;

/// Which quantity orders the records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapOrder {
    /// Live bytes; sites with nothing live are left out
    InUse,
    /// Bytes allocated since start, including sites with nothing live
    Allocated,
}

/// Allocation totals for one call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapRecord {
    pub inuse_objects: u64,
    pub inuse_bytes: u64,
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    /// Return addresses, innermost first
    pub frames: Vec<u64>,
}

impl HeapRecord {
    fn from_callsite(cs: &CallsiteSnapshot) -> Self {
        HeapRecord {
            inuse_objects: cs.live_count(),
            inuse_bytes: cs.live_bytes(),
            alloc_objects: cs.alloc_count,
            alloc_bytes: cs.alloc_bytes,
            frames: cs.frames().to_vec(),
        }
    }

    fn counts(&self) -> String {
        format!(
            "{}: {} [{}: {}]",
            self.inuse_objects, self.inuse_bytes, self.alloc_objects, self.alloc_bytes
        )
    }
}

/// Heap profile in the legacy text format
#[derive(Debug, Clone)]
pub struct HeapProfile {
    pub records: Vec<HeapRecord>,
}

impl HeapProfile {
    pub fn from_callsites(callsites: &[CallsiteSnapshot], order: HeapOrder) -> Self {
        let mut records: Vec<HeapRecord> = callsites
            .iter()
            .filter(|cs| cs.has_heap_activity())
            .filter(|cs| order == HeapOrder::Allocated || cs.live_count() > 0)
            .map(HeapRecord::from_callsite)
            .collect();

        match order {
            HeapOrder::InUse => records.sort_by(|a, b| {
                b.inuse_bytes
                    .cmp(&a.inuse_bytes)
                    .then_with(|| b.inuse_objects.cmp(&a.inuse_objects))
            }),
            HeapOrder::Allocated => records.sort_by(|a, b| {
                b.alloc_bytes
                    .cmp(&a.alloc_bytes)
                    .then_with(|| b.alloc_objects.cmp(&a.alloc_objects))
            }),
        }

        HeapProfile { records }
    }

    /// Sum over all records
    pub fn totals(&self) -> HeapRecord {
        self.records.iter().fold(
            HeapRecord {
                inuse_objects: 0,
                inuse_bytes: 0,
                alloc_objects: 0,
                alloc_bytes: 0,
                frames: Vec::new(),
            },
            |mut acc, r| {
                acc.inuse_objects += r.inuse_objects;
                acc.inuse_bytes += r.inuse_bytes;
                acc.alloc_objects += r.alloc_objects;
                acc.alloc_bytes += r.alloc_bytes;
                acc
            },
        )
    }

    /// Render the profile. With `debug >= 1` each record is followed by
    /// one `#` line per resolved frame.
    pub fn render(&self, debug: u8, symbols: &dyn Symbolize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "heap profile: {} @ heap/1", self.totals().counts());

        for record in &self.records {
            let frames = resolve_stack(&record.frames, false, symbols);

            let addrs: Vec<String> = frames.iter().map(|f| format!("{:#x}", f.addr)).collect();
            let _ = writeln!(out, "{} @ {}", record.counts(), addrs.join(" "));

            if debug == 0 {
                continue;
            }
            for frame in &frames {
                match &frame.location {
                    Some(loc) => {
                        let _ = writeln!(
                            out,
                            "#\t{:#x}\t{}+{:#x}\t{}",
                            frame.addr,
                            loc.function,
                            loc.offset,
                            loc.as_file_line()
                        );
                    }
                    None => {
                        let _ = writeln!(out, "#\t{:#x}", frame.addr);
                    }
                }
            }
            out.push('\n');
        }

        out
    }
}
