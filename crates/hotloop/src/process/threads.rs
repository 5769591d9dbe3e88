use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

const SELF_TASKS: &str = "/proc/self/task";
const UPTIME: &str = "/proc/uptime";

/// Per-thread scheduler view of one OS thread in this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u32,
    pub name: String,
    /// Single-letter state from /proc (R, S, D, ...)
    pub state: char,
    /// User CPU time in clock ticks
    pub utime_ticks: u64,
    /// System CPU time in clock ticks
    pub stime_ticks: u64,
    /// Thread start in clock ticks since boot
    pub start_ticks: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    /// Time on CPU in nanoseconds (schedstat)
    pub run_ns: u64,
    /// Time runnable but waiting for a CPU in nanoseconds (schedstat)
    pub wait_ns: u64,
}

impl ThreadInfo {
    /// Read everything we know about one `/proc/self/task/<tid>` entry
    fn read(task_dir: &Path, tid: u32) -> Result<Self> {
        let stat_path = task_dir.join("stat");
        let stat = fs::read_to_string(&stat_path)
            .map_err(|e| Error::proc(stat_path.display().to_string(), e))?;

        let mut info = parse_stat(&stat).ok_or_else(|| {
            Error::proc(stat_path.display().to_string(), "unexpected stat format")
        })?;
        info.tid = tid;

        // Missing on kernels without the corresponding config options
        if let Ok(status) = fs::read_to_string(task_dir.join("status")) {
            let (voluntary, involuntary) = parse_context_switches(&status);
            info.voluntary_switches = voluntary;
            info.involuntary_switches = involuntary;
        }
        if let Ok(schedstat) = fs::read_to_string(task_dir.join("schedstat"))
            && let Some((run_ns, wait_ns)) = parse_schedstat(&schedstat)
        {
            info.run_ns = run_ns;
            info.wait_ns = wait_ns;
        }

        Ok(info)
    }

    /// Human-readable scheduler state
    pub fn state_name(&self) -> &'static str {
        match self.state {
            'R' => "running",
            'S' => "sleeping",
            'D' => "disk sleep",
            'T' => "stopped",
            't' => "tracing stop",
            'Z' => "zombie",
            'X' => "dead",
            'I' => "idle",
            _ => "unknown",
        }
    }

    /// On-CPU time, preferring schedstat's nanosecond counter
    pub fn cpu_ns(&self, ticks_per_sec: u64) -> u64 {
        if self.run_ns > 0 {
            return self.run_ns;
        }
        ticks_to_ns(self.utime_ticks + self.stime_ticks, ticks_per_sec)
    }

    /// Estimated time spent blocked: lifetime minus on-CPU and run-queue time
    pub fn blocked_ns(&self, uptime_ns: u64, ticks_per_sec: u64) -> u64 {
        let started_ns = ticks_to_ns(self.start_ticks, ticks_per_sec);
        uptime_ns
            .saturating_sub(started_ns)
            .saturating_sub(self.cpu_ns(ticks_per_sec))
            .saturating_sub(self.wait_ns)
    }
}

/// Convert kernel clock ticks to nanoseconds
pub fn ticks_to_ns(ticks: u64, ticks_per_sec: u64) -> u64 {
    if ticks_per_sec == 0 {
        return 0;
    }
    ticks.saturating_mul(1_000_000_000) / ticks_per_sec
}

/// All threads of the current process, sorted by thread id
pub fn current_threads() -> Result<Vec<ThreadInfo>> {
    let mut threads = Vec::new();

    let entries = fs::read_dir(SELF_TASKS).map_err(|e| Error::proc(SELF_TASKS, e))?;
    for entry in entries.flatten() {
        let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };

        // A thread can exit between readdir and reading its files
        match ThreadInfo::read(&entry.path(), tid) {
            Ok(info) => threads.push(info),
            Err(e) => tracing::debug!(tid, error = %e, "skipping thread"),
        }
    }

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Kernel clock ticks per second (USER_HZ)
pub fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

/// Seconds since boot, from /proc/uptime
pub fn system_uptime() -> Result<std::time::Duration> {
    let content = fs::read_to_string(UPTIME).map_err(|e| Error::proc(UPTIME, e))?;
    content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map(std::time::Duration::from_secs_f64)
        .ok_or_else(|| Error::proc(UPTIME, "unexpected format"))
}

/// Parse /proc/<pid>/task/<tid>/stat.
///
/// The comm field sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last ')'.
fn parse_stat(content: &str) -> Option<ThreadInfo> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let name = content.get(open + 1..close)?.to_string();

    // Fields after comm, starting at field 3 (state)
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    let field = |n: usize| rest.get(n - 3).and_then(|s| s.parse::<u64>().ok());

    Some(ThreadInfo {
        name,
        state: rest.first()?.chars().next()?,
        utime_ticks: field(14)?,
        stime_ticks: field(15)?,
        start_ticks: field(22)?,
        ..Default::default()
    })
}

fn parse_context_switches(status: &str) -> (u64, u64) {
    let mut voluntary = 0;
    let mut involuntary = 0;

    for line in status.lines() {
        if let Some(value) = line.strip_prefix("voluntary_ctxt_switches:") {
            voluntary = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            involuntary = value.trim().parse().unwrap_or(0);
        }
    }

    (voluntary, involuntary)
}

/// "<run_ns> <wait_ns> <timeslices>"
fn parse_schedstat(content: &str) -> Option<(u64, u64)> {
    let mut fields = content.split_whitespace();
    let run_ns = fields.next()?.parse().ok()?;
    let wait_ns = fields.next()?.parse().ok()?;
    Some((run_ns, wait_ns))
}
