//! HTTP profiling server.
//!
//! The server owns a dedicated OS thread that drives a current-thread
//! Tokio runtime, so it keeps answering while the main thread spins in the
//! workload. The outcome of binding is reported once over a readiness
//! channel; the caller decides how long to wait and what to do on failure.

mod routes;

pub use routes::{AppState, parse_symbol_addrs, router};

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Name of the server thread, as shown in the thread profile
pub const THREAD_NAME: &str = "pprof-server";

/// Default listening address
pub const DEFAULT_ADDR: &str = "0.0.0.0:9090";

/// CPU profile window when the request does not name one
pub const DEFAULT_PROFILE_SECS: u64 = 30;

/// Longest CPU profile window a request may ask for
pub const MAX_PROFILE_SECS: u64 = 600;

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub default_profile_secs: u64,
    pub max_profile_secs: u64,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        ServerConfig {
            addr,
            default_profile_secs: DEFAULT_PROFILE_SECS,
            max_profile_secs: MAX_PROFILE_SECS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], 9090)))
    }
}

/// A running (or failed) server thread
pub struct ServerHandle {
    ready: Receiver<Result<SocketAddr>>,
    thread: JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the bind result.
    ///
    /// Returns the bound address, the bind error, or `ReadyTimeout` when
    /// the thread has not reported within `timeout`. Only the first call
    /// sees the result.
    pub fn wait_ready(&self, timeout: Duration) -> Result<SocketAddr> {
        match self.ready.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::ReadyTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ServerThread(
                "exited without reporting readiness".to_string(),
            )),
        }
    }

    /// Whether the server thread is still alive
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Start the server on its own thread.
///
/// Fails only when the thread itself cannot be created; bind errors arrive
/// through [`ServerHandle::wait_ready`].
pub fn spawn(config: ServerConfig) -> Result<ServerHandle> {
    let (tx, rx) = mpsc::channel();

    let thread = std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(config, tx))
        .map_err(|e| Error::ServerThread(e.to_string()))?;

    Ok(ServerHandle { ready: rx, thread })
}

fn run(config: ServerConfig, ready: Sender<Result<SocketAddr>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(Error::ServerThread(format!(
                "cannot start runtime: {e}"
            ))));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::bind(config.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready.send(Err(Error::Bind {
                    addr: config.addr,
                    source,
                }));
                return;
            }
        };

        let addr = listener.local_addr().unwrap_or(config.addr);
        // Receiver may have given up waiting; serve regardless
        let _ = ready.send(Ok(addr));
        info!(%addr, "profiling server listening");

        let state = Arc::new(AppState::new(config));
        // Detached; a request arriving first waits on the same cell
        let _ = state.preload_symbols();

        if let Err(e) = axum::serve(listener, router(state)).await {
            error!(error = %e, "profiling server stopped");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> ServerConfig {
        ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_spawn_reports_bound_address() {
        let handle = spawn(loopback()).unwrap();
        let addr = handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert_ne!(addr.port(), 0);
        assert!(handle.is_running());
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig::new(taken.local_addr().unwrap());

        let handle = spawn(config).unwrap();
        let err = handle.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(err.exit_code(), crate::error::exit_code::BIND_FAILED);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
        assert_eq!(config.default_profile_secs, 30);
        assert_eq!(config.max_profile_secs, 600);
    }
}
