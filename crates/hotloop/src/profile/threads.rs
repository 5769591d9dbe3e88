use super::format_ns;
use crate::process::{ThreadInfo, ticks_to_ns};
use std::fmt::Write;

/// One line per OS thread: id, name, state, user and system CPU time.
/// `debug >= 1` adds context switch counts.
pub fn render_threads(threads: &[ThreadInfo], ticks_per_sec: u64, debug: u8) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "threads profile: total {}", threads.len());

    for t in threads {
        let user = ticks_to_ns(t.utime_ticks, ticks_per_sec);
        let system = ticks_to_ns(t.stime_ticks, ticks_per_sec);
        let _ = write!(
            out,
            "{} [{}] {} user={} sys={}",
            t.tid,
            t.name,
            t.state_name(),
            format_ns(user),
            format_ns(system)
        );
        if debug > 0 {
            let _ = write!(
                out,
                " voluntary_switches={} involuntary_switches={}",
                t.voluntary_switches, t.involuntary_switches
            );
        }
        out.push('\n');
    }

    out
}
