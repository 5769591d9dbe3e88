use super::{Frame, Symbolize, resolve_stack};
use hotloop_trace::CallsiteSnapshot;
use std::collections::HashMap;
use std::fmt::Write;

/// Samples attributed to one stack during a capture window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuStack {
    /// Leaf instruction pointer first, then return addresses
    pub frames: Vec<u64>,
    pub samples: u64,
}

/// CPU samples taken over a fixed window
#[derive(Debug, Clone)]
pub struct CpuProfile {
    pub seconds: u64,
    pub frequency_hz: u32,
    pub stacks: Vec<CpuStack>,
}

impl CpuProfile {
    /// Samples gained per call site between two snapshots of the table.
    ///
    /// Call sites absent from `before` were created during the window and
    /// count in full.
    pub fn diff(
        before: &[CallsiteSnapshot],
        after: &[CallsiteSnapshot],
        seconds: u64,
        frequency_hz: u32,
    ) -> Self {
        let prev: HashMap<u64, u64> = before
            .iter()
            .map(|cs| (cs.hash, cs.cpu_samples))
            .collect();

        let stacks = after
            .iter()
            .filter_map(|cs| {
                let delta = cs
                    .cpu_samples
                    .saturating_sub(prev.get(&cs.hash).copied().unwrap_or(0));
                (delta > 0).then(|| CpuStack {
                    frames: cs.frames().to_vec(),
                    samples: delta,
                })
            })
            .collect();

        CpuProfile {
            seconds,
            frequency_hz,
            stacks,
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.stacks.iter().map(|s| s.samples).sum()
    }

    /// Resolved stacks with their sample counts. Distinct addresses in the
    /// same functions collapse into one entry.
    fn resolved(&self, symbols: &dyn Symbolize) -> Vec<(Vec<Frame>, u64)> {
        self.stacks
            .iter()
            .map(|s| (resolve_stack(&s.frames, true, symbols), s.samples))
            .filter(|(frames, _)| !frames.is_empty())
            .collect()
    }

    /// Folded stacks: root first, frames joined by `;`, then the count.
    /// Sorted by count, heaviest first.
    pub fn render_folded(&self, symbols: &dyn Symbolize) -> String {
        let mut folded: HashMap<String, u64> = HashMap::new();
        for (frames, samples) in self.resolved(symbols) {
            let line = frames
                .iter()
                .rev()
                .map(Frame::name)
                .collect::<Vec<_>>()
                .join(";");
            *folded.entry(line).or_default() += samples;
        }

        let mut lines: Vec<(String, u64)> = folded.into_iter().collect();
        lines.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut out = String::new();
        for (stack, samples) in lines {
            let _ = writeln!(out, "{stack} {samples}");
        }
        out
    }

    /// Flat/cumulative table per function.
    pub fn render_text(&self, symbols: &dyn Symbolize) -> String {
        let total = self.total_samples();
        let mut flat: HashMap<String, u64> = HashMap::new();
        let mut cum: HashMap<String, u64> = HashMap::new();

        for (frames, samples) in self.resolved(symbols) {
            if let Some(leaf) = frames.first() {
                *flat.entry(leaf.name()).or_default() += samples;
            }

            // Recursion counts once per stack
            let mut seen: Vec<String> = Vec::with_capacity(frames.len());
            for frame in &frames {
                let name = frame.name();
                if !seen.contains(&name) {
                    *cum.entry(name.clone()).or_default() += samples;
                    seen.push(name);
                }
            }
        }

        let mut rows: Vec<(String, u64, u64)> = cum
            .into_iter()
            .map(|(name, cum)| {
                let flat = flat.get(&name).copied().unwrap_or(0);
                (name, flat, cum)
            })
            .collect();
        rows.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut out = String::new();
        let _ = writeln!(
            out,
            "cpu profile: {} samples over {}s @ {} Hz",
            total, self.seconds, self.frequency_hz
        );
        let _ = writeln!(
            out,
            "{:>10} {:>6} {:>10} {:>6}  FUNCTION",
            "FLAT", "FLAT%", "CUM", "CUM%"
        );
        for (name, flat, cum) in rows {
            let _ = writeln!(
                out,
                "{:>10} {:>5.1}% {:>10} {:>5.1}%  {}",
                flat,
                percent(flat, total),
                cum,
                percent(cum, total),
                name
            );
        }
        out
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
