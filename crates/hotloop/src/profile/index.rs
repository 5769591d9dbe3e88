use chrono::{DateTime, Local};
use std::fmt::Write;
use std::time::Duration;

/// A profile listed on the index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: &'static str,
    /// Current size of the profile, when it has one
    pub count: Option<u64>,
    pub description: &'static str,
}

/// Landing page of the profiling server
#[derive(Debug, Clone)]
pub struct Index {
    pub pid: u32,
    pub started: DateTime<Local>,
    pub uptime: Duration,
    pub entries: Vec<IndexEntry>,
}

impl Index {
    /// Index for a process that has been running for `uptime`.
    pub fn new(pid: u32, uptime: Duration, entries: Vec<IndexEntry>) -> Self {
        let age = chrono::Duration::from_std(uptime).unwrap_or_else(|_| chrono::Duration::zero());
        Index {
            pid,
            started: Local::now() - age,
            uptime,
            entries,
        }
    }

    pub fn render(&self) -> String {
        let uptime = Duration::from_secs(self.uptime.as_secs());

        let mut out = String::new();
        let _ = writeln!(out, "/debug/pprof/");
        let _ = writeln!(out);
        let _ = writeln!(out, "pid:     {}", self.pid);
        let _ = writeln!(
            out,
            "started: {}",
            self.started.format("%Y-%m-%d %H:%M:%S %z")
        );
        let _ = writeln!(out, "uptime:  {}", humantime::format_duration(uptime));
        let _ = writeln!(out);
        let _ = writeln!(out, "{:>8}  {:<10} DESCRIPTION", "COUNT", "PROFILE");

        for entry in &self.entries {
            let count = entry.count.map(|c| c.to_string()).unwrap_or_default();
            let _ = writeln!(
                out,
                "{:>8}  {:<10} {}",
                count, entry.name, entry.description
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_index() {
        let index = Index {
            pid: 4242,
            started: Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            uptime: Duration::from_millis(3_723_900),
            entries: vec![
                IndexEntry {
                    name: "heap",
                    count: Some(12),
                    description: "Live allocations by call site",
                },
                IndexEntry {
                    name: "cmdline",
                    count: None,
                    description: "Command line",
                },
            ],
        };

        let text = index.render();
        assert!(text.contains("pid:     4242\n"));
        assert!(text.contains("started: 2024-05-01 12:00:00"));
        assert!(text.contains("uptime:  1h 2m 3s\n"));
        assert!(text.contains("      12  heap       Live allocations by call site\n"));
        assert!(text.contains("          cmdline    Command line\n"));
    }

    #[test]
    fn test_new_backdates_start() {
        let index = Index::new(1, Duration::from_secs(3600), Vec::new());
        let age = Local::now() - index.started;
        assert!(age.num_seconds() >= 3600);
        assert!(age.num_seconds() < 3700);
    }
}
