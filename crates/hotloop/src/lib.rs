pub mod cli;
pub mod error;
pub mod logging;
pub mod process;
pub mod profile;
pub mod server;
pub mod symbols;
pub mod workload;

pub use error::{Error, Result};
