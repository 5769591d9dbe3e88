use super::ServerConfig;
use crate::error::{Error, Result};
use crate::process::{self, ThreadInfo};
use crate::profile::{
    CpuProfile, HeapOrder, HeapProfile, Index, IndexEntry, NoSymbols, Symbolize,
    collect_callsites, render_block, render_threads,
};
use crate::symbols::SymbolResolver;
use axum::Router;
use axum::extract::{Query, RawQuery, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Shared state of the request handlers
pub struct AppState {
    config: ServerConfig,
    /// Loaded on first use
    symbols: OnceCell<Arc<dyn Symbolize>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        AppState {
            config,
            symbols: OnceCell::new(),
        }
    }

    /// State with a fixed symbolizer instead of the executable's symbols
    pub fn with_symbols(config: ServerConfig, symbols: Arc<dyn Symbolize>) -> Self {
        AppState {
            config,
            symbols: OnceCell::new_with(Some(symbols)),
        }
    }

    /// Load symbols in the background so the first request that needs
    /// them does not wait on DWARF parsing. Must run inside a Tokio runtime.
    pub fn preload_symbols(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            state.symbols().await;
        })
    }

    /// Whether the symbolizer has been set up
    pub fn symbols_loaded(&self) -> bool {
        self.symbols.initialized()
    }

    async fn symbols(&self) -> Arc<dyn Symbolize> {
        self.symbols
            .get_or_init(|| async {
                match tokio::task::spawn_blocking(SymbolResolver::for_current_process).await {
                    Ok(Ok(resolver)) => {
                        info!(
                            functions = resolver.function_count(),
                            ranges = resolver.range_count(),
                            "symbols loaded"
                        );
                        Arc::new(resolver) as Arc<dyn Symbolize>
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "cannot load symbols, frames will show raw addresses");
                        Arc::new(NoSymbols)
                    }
                    Err(e) => {
                        warn!(error = %e, "symbol loader panicked, frames will show raw addresses");
                        Arc::new(NoSymbols)
                    }
                }
            })
            .await
            .clone()
    }
}

/// Routes under `/debug/pprof/`
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/debug/pprof", get(|| async { Redirect::permanent("/debug/pprof/") }))
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/profile", get(cpu_profile))
        .route("/debug/pprof/heap", get(heap))
        .route("/debug/pprof/allocs", get(allocs))
        .route("/debug/pprof/threads", get(threads))
        .route("/debug/pprof/goroutine", get(threads))
        .route("/debug/pprof/block", get(block))
        .route("/debug/pprof/symbol", get(symbol).post(symbol))
        .fallback(unknown_profile)
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::UnknownProfile(_) => StatusCode::NOT_FOUND,
            Error::NotActive(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        (status, format!("{self}\n")).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct DebugParams {
    #[serde(default)]
    debug: u8,
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
    #[serde(default)]
    debug: u8,
}

async fn index() -> Result<String> {
    let callsites = collect_callsites();
    let threads = process::current_threads()?;
    let uptime_ns = process::system_uptime()?.as_nanos() as u64;
    let ticks = process::clock_ticks_per_sec();

    let pid = std::process::id();
    let age_ns = threads
        .iter()
        .find(|t| t.tid == pid)
        .map(|t| uptime_ns.saturating_sub(process::ticks_to_ns(t.start_ticks, ticks)))
        .unwrap_or(0);

    let cpu_samples = callsites.iter().map(|cs| cs.cpu_samples).sum();
    let live_sites = callsites.iter().filter(|cs| cs.live_count() > 0).count() as u64;
    let alloc_sites = callsites.iter().filter(|cs| cs.has_heap_activity()).count() as u64;
    let blocking_events = threads.iter().map(|t| t.voluntary_switches).sum();

    let entries = vec![
        IndexEntry {
            name: "allocs",
            count: Some(alloc_sites),
            description: "All allocations since start, by call site",
        },
        IndexEntry {
            name: "block",
            count: Some(blocking_events),
            description: "Time threads spent blocked",
        },
        IndexEntry {
            name: "cmdline",
            count: None,
            description: "Command line of this process",
        },
        IndexEntry {
            name: "goroutine",
            count: Some(threads.len() as u64),
            description: "Alias of threads",
        },
        IndexEntry {
            name: "heap",
            count: Some(live_sites),
            description: "Live allocations by call site",
        },
        IndexEntry {
            name: "profile",
            count: Some(cpu_samples),
            description: "CPU profile; ?seconds=N sets the window",
        },
        IndexEntry {
            name: "symbol",
            count: None,
            description: "Resolve 0x-prefixed addresses to function names",
        },
        IndexEntry {
            name: "threads",
            count: Some(threads.len() as u64),
            description: "OS threads and their CPU time",
        },
    ];

    Ok(Index::new(pid, Duration::from_nanos(age_ns), entries).render())
}

async fn cmdline() -> String {
    std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("\0")
}

async fn cpu_profile(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProfileParams>,
) -> Result<String> {
    let max = state.config.max_profile_secs;
    let seconds = params.seconds.unwrap_or(state.config.default_profile_secs);
    if !(1..=max).contains(&seconds) {
        return Err(Error::InvalidArgument(format!(
            "seconds must be between 1 and {max}, got {seconds}"
        )));
    }

    let frequency_hz = hotloop_trace::cpu_frequency();
    if frequency_hz == 0 {
        return Err(Error::NotActive("CPU sampling is not running".to_string()));
    }

    info!(seconds, frequency_hz, "capturing CPU profile");
    let before = collect_callsites();
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let after = collect_callsites();

    let profile = CpuProfile::diff(&before, &after, seconds, frequency_hz);
    debug!(samples = profile.total_samples(), "CPU profile captured");

    let symbols = state.symbols().await;
    Ok(if params.debug > 0 {
        profile.render_text(symbols.as_ref())
    } else {
        profile.render_folded(symbols.as_ref())
    })
}

async fn heap(state: State<Arc<AppState>>, params: Query<DebugParams>) -> Result<String> {
    heap_profile(state, params, HeapOrder::InUse).await
}

async fn allocs(state: State<Arc<AppState>>, params: Query<DebugParams>) -> Result<String> {
    heap_profile(state, params, HeapOrder::Allocated).await
}

async fn heap_profile(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DebugParams>,
    order: HeapOrder,
) -> Result<String> {
    if !hotloop_trace::is_tracking() {
        return Err(Error::NotActive(
            "the profiling allocator is not installed".to_string(),
        ));
    }

    let profile = HeapProfile::from_callsites(&collect_callsites(), order);
    let symbols = state.symbols().await;
    Ok(profile.render(params.debug, symbols.as_ref()))
}

async fn threads(Query(params): Query<DebugParams>) -> Result<String> {
    let threads: Vec<ThreadInfo> = process::current_threads()?;
    Ok(render_threads(
        &threads,
        process::clock_ticks_per_sec(),
        params.debug,
    ))
}

async fn block() -> Result<String> {
    let threads = process::current_threads()?;
    let uptime_ns = process::system_uptime()?.as_nanos() as u64;
    Ok(render_block(
        &threads,
        uptime_ns,
        process::clock_ticks_per_sec(),
    ))
}

async fn symbol(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    body: String,
) -> String {
    let input = if body.trim().is_empty() {
        query.unwrap_or_default()
    } else {
        body
    };

    let mut out = String::from("num_symbols: 1\n");
    let addrs = parse_symbol_addrs(&input);
    if addrs.is_empty() {
        return out;
    }

    let symbols = state.symbols().await;
    for addr in addrs {
        if let Some(loc) = symbols.symbolize(addr) {
            let _ = writeln!(out, "{:#x} {}", addr, loc.function);
        }
    }
    out
}

async fn unknown_profile(uri: Uri) -> Error {
    Error::UnknownProfile(uri.path().to_string())
}

/// Addresses separated by `+`: `0x`-prefixed hex or decimal. Anything
/// else is skipped.
pub fn parse_symbol_addrs(input: &str) -> Vec<u64> {
    input
        .split('+')
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .filter_map(|word| match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => word.parse().ok(),
        })
        .collect()
}
