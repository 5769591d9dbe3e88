//! End-to-end tests against a real server on an ephemeral loopback port.

use hotloop::profile::Symbolize;
use hotloop::server::{self, AppState, ServerConfig};
use hotloop::symbols::Location;
use hotloop::workload::{SampleBuffer, Workload};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

hotloop_trace::profiler!(cpu = 0);

const READY_TIMEOUT: Duration = Duration::from_secs(5);

struct Response {
    status: u16,
    body: String,
}

fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> Response {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8_lossy(&raw).into_owned();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        dechunk(body)
    } else {
        body.to_string()
    };
    Response { status, body }
}

fn dechunk(mut body: &str) -> String {
    let mut out = String::new();
    while let Some((size, rest)) = body.split_once("\r\n") {
        let size = usize::from_str_radix(size.trim(), 16).unwrap();
        if size == 0 {
            break;
        }
        out.push_str(&rest[..size]);
        body = &rest[size + 2..];
    }
    out
}

fn get(addr: SocketAddr, path: &str) -> Response {
    request(addr, "GET", path, "")
}

/// One server shared by every test in this binary
fn shared_server() -> SocketAddr {
    static ADDR: OnceLock<SocketAddr> = OnceLock::new();
    *ADDR.get_or_init(|| {
        let handle = server::spawn(ServerConfig::new(([127, 0, 0, 1], 0).into())).unwrap();
        // Dropping the handle detaches the thread; it serves until exit
        handle.wait_ready(READY_TIMEOUT).unwrap()
    })
}

/// CPU sampling is process-wide; tests that depend on it run one at a time
fn cpu_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn test_index_lists_profiles() {
    let resp = get(shared_server(), "/debug/pprof/");
    assert_eq!(resp.status, 200);
    assert!(resp.body.contains(&format!("pid:     {}", std::process::id())));
    for name in [
        "allocs", "block", "cmdline", "goroutine", "heap", "profile", "symbol", "threads",
    ] {
        assert!(resp.body.contains(name), "missing {name}");
    }
    assert!(resp.body.contains("Alias of threads"));
}

#[test]
fn test_index_without_trailing_slash_redirects() {
    let addr = shared_server();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    write!(
        stream,
        "GET /debug/pprof HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    )
    .unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let (head, _) = raw.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 308"), "{head}");
    assert!(
        head.to_ascii_lowercase().contains("location: /debug/pprof/"),
        "{head}"
    );
}

#[test]
fn test_cmdline_is_nul_joined() {
    let resp = get(shared_server(), "/debug/pprof/cmdline");
    assert_eq!(resp.status, 200);
    let expected: Vec<String> = std::env::args().collect();
    assert_eq!(resp.body.split('\0').collect::<Vec<_>>(), expected);
}

#[test]
fn test_unknown_profile_is_404() {
    let resp = get(shared_server(), "/debug/pprof/nope");
    assert_eq!(resp.status, 404);
    assert!(resp.body.contains("Unknown profile"));
}

#[test]
fn test_profile_seconds_out_of_range() {
    let addr = shared_server();
    assert_eq!(get(addr, "/debug/pprof/profile?seconds=0").status, 400);
    assert_eq!(get(addr, "/debug/pprof/profile?seconds=601").status, 400);
    assert_eq!(get(addr, "/debug/pprof/profile?seconds=abc").status, 400);
}

#[test]
fn test_profile_without_sampling_is_unavailable() {
    let _guard = cpu_lock();
    hotloop_trace::stop_cpu_profiling();
    assert_eq!(get(shared_server(), "/debug/pprof/profile?seconds=1").status, 503);
}

#[test]
fn test_cpu_profile_while_workload_runs() {
    let _guard = cpu_lock();
    hotloop_trace::start_cpu_profiling(499);

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let stop = stop.clone();
        std::thread::spawn(move || Workload::new().run_until(&stop))
    };

    let addr = shared_server();
    let folded = get(addr, "/debug/pprof/profile?seconds=1");
    let text = get(addr, "/debug/pprof/profile?seconds=1&debug=1");

    stop.store(true, Ordering::Relaxed);
    let iterations = worker.join().unwrap();
    hotloop_trace::stop_cpu_profiling();

    assert!(iterations > 0);
    assert_eq!(folded.status, 200);
    assert!(!folded.body.is_empty());
    for line in folded.body.lines() {
        let (_, count) = line.rsplit_once(' ').unwrap();
        assert!(count.parse::<u64>().unwrap() > 0);
    }

    assert_eq!(text.status, 200);
    assert!(text.body.starts_with("cpu profile: "));
    assert!(text.body.lines().next().unwrap().ends_with("over 1s @ 499 Hz"));
}

#[test]
fn test_heap_profile_reports_live_allocation() {
    let addr = shared_server();
    let retained: Vec<u8> = vec![7; 3 * 1024 * 1024];

    let resp = get(addr, "/debug/pprof/heap?debug=1");
    assert_eq!(resp.status, 200);
    assert!(resp.body.starts_with("heap profile: "));
    assert!(resp.body.lines().any(|l| l.contains(": 3145728 [")));

    let allocs = get(addr, "/debug/pprof/allocs");
    assert_eq!(allocs.status, 200);
    assert!(allocs.body.starts_with("heap profile: "));
    assert!(allocs.body.lines().count() > 1);

    drop(retained);
}

#[test]
fn test_threads_and_block() {
    let addr = shared_server();

    let threads = get(addr, "/debug/pprof/threads?debug=1");
    assert_eq!(threads.status, 200);
    assert!(threads.body.starts_with("threads profile: total "));
    assert!(threads.body.contains("[pprof-server]"));
    assert!(threads.body.contains("voluntary_switches="));

    let goroutine = get(addr, "/debug/pprof/goroutine");
    assert_eq!(goroutine.status, 200);
    assert!(goroutine.body.starts_with("threads profile: total "));

    let block = get(addr, "/debug/pprof/block");
    assert_eq!(block.status, 200);
    assert!(block.body.starts_with("block profile: "));
}

#[test]
fn test_symbol_resolves_known_function() {
    let addr = shared_server();

    let empty = get(addr, "/debug/pprof/symbol");
    assert_eq!(empty.body, "num_symbols: 1\n");

    let fill = SampleBuffer::fill as fn(&mut SampleBuffer) as usize as u64;
    let resp = request(addr, "POST", "/debug/pprof/symbol", &format!("{fill:#x}+junk"));
    assert_eq!(resp.status, 200);
    let mut lines = resp.body.lines();
    assert_eq!(lines.next(), Some("num_symbols: 1"));
    let line = lines.next().unwrap();
    assert!(line.starts_with(&format!("{fill:#x} ")));
    assert!(line.contains("SampleBuffer::fill"), "{line}");

    let query = get(addr, &format!("/debug/pprof/symbol?{fill:#x}"));
    assert!(query.body.contains("SampleBuffer::fill"));
}

struct OneSymbol;

impl Symbolize for OneSymbol {
    fn symbolize(&self, addr: u64) -> Option<Location> {
        (addr == 0x1234).then(|| Location {
            function: "demo::hot".to_string(),
            offset: 0,
            file: String::new(),
            line: 0,
        })
    }
}

#[test]
fn test_symbol_with_injected_symbolizer() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let state = Arc::new(AppState::with_symbols(ServerConfig::new(addr), Arc::new(OneSymbol)));
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, server::router(state)).await.unwrap();
        });
    });

    let resp = request(addr, "POST", "/debug/pprof/symbol", "0x1234+0x9999");
    assert_eq!(resp.body, "num_symbols: 1\n0x1234 demo::hot\n");
}

#[test]
fn test_bind_conflict_leaves_workload_running() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let handle = server::spawn(ServerConfig::new(taken.local_addr().unwrap())).unwrap();

    let err = handle.wait_ready(READY_TIMEOUT).unwrap_err();
    assert!(matches!(err, hotloop::Error::Bind { .. }));

    let mut workload = Workload::new();
    for _ in 0..10 {
        assert_eq!(workload.step(), 10_000);
    }
    assert_eq!(workload.iterations(), 10);
}
