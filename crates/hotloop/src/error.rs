use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot bind profiling server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Profiling server thread failed: {0}")]
    ServerThread(String),

    #[error("Profiling server not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("Not active: {0}")]
    NotActive(String),

    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("Missing symbols in {path}. Rebuild without `strip` to enable symbolization")]
    MissingDebugInfo { path: String },

    #[error("Cannot read {path}: {reason}")]
    Proc { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const BIND_FAILED: i32 = 3;
    /// 128 + SIGINT
    pub const INTERRUPTED: i32 = 130;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            Error::Bind { .. } => exit_code::BIND_FAILED,
            Error::Interrupted => exit_code::INTERRUPTED,
            _ => exit_code::GENERAL_ERROR,
        }
    }

    /// Shorthand for a failed read under `/proc`.
    pub fn proc(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Proc {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
