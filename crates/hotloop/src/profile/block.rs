use super::format_ns;
use crate::process::ThreadInfo;
use std::fmt::Write;

/// Per-thread blocking table, most blocked first.
///
/// Voluntary context switches count blocking events. Blocked time is
/// estimated from the thread's lifetime minus time on CPU and time spent
/// runnable in the run queue.
pub fn render_block(threads: &[ThreadInfo], uptime_ns: u64, ticks_per_sec: u64) -> String {
    let mut rows: Vec<(&ThreadInfo, u64)> = threads
        .iter()
        .map(|t| (t, t.blocked_ns(uptime_ns, ticks_per_sec)))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.tid.cmp(&b.0.tid)));

    let total_events: u64 = threads.iter().map(|t| t.voluntary_switches).sum();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "block profile: {} events in {} threads",
        total_events,
        threads.len()
    );
    let _ = writeln!(
        out,
        "{:>8} {:>10} {:>14} {:>14}  NAME",
        "TID", "EVENTS", "BLOCKED", "RUNQUEUE"
    );
    for (t, blocked) in rows {
        let _ = writeln!(
            out,
            "{:>8} {:>10} {:>14} {:>14}  {}",
            t.tid,
            t.voluntary_switches,
            format_ns(blocked),
            format_ns(t.wait_ns),
            t.name
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sorted_by_blocked_time() {
        let threads = vec![
            ThreadInfo {
                tid: 1,
                name: "hotloop".to_string(),
                run_ns: 9_000_000_000,
                voluntary_switches: 3,
                ..Default::default()
            },
            ThreadInfo {
                tid: 2,
                name: "pprof-server".to_string(),
                run_ns: 10_000_000,
                wait_ns: 5_000_000,
                voluntary_switches: 120,
                ..Default::default()
            },
        ];

        let text = render_block(&threads, 10_000_000_000, 100);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "block profile: 123 events in 2 threads");
        assert!(lines[1].contains("BLOCKED"));
        assert!(lines[2].ends_with("pprof-server"));
        assert!(lines[2].contains("9s 985ms"));
        assert!(lines[2].contains("5ms"));
        assert!(lines[3].ends_with("hotloop"));
        assert!(lines[3].contains(" 1s "));
    }
}
