use anyhow::Context;
use clap::Parser;
use hotloop::cli::Cli;
use hotloop::error::exit_code;
use hotloop::server::{self, ServerConfig};
use hotloop::workload::Workload;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

// CPU sampling is started explicitly once the flags are parsed
hotloop_trace::profiler!(cpu = 0);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            if let Some(hotloop_err) = e.downcast_ref::<hotloop::Error>() {
                if !matches!(hotloop_err, hotloop::Error::Interrupted) {
                    eprintln!("Error: {e:#}");
                }
                ExitCode::from(hotloop_err.exit_code() as u8)
            } else {
                eprintln!("Error: {e:#}");
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.validate()
        .map_err(hotloop::Error::InvalidArgument)
        .context("Invalid arguments")?;

    hotloop::logging::init(&cli.log);

    if cli.cpu_freq > 0 {
        hotloop_trace::start_cpu_profiling(cli.cpu_freq);
        if hotloop_trace::cpu_frequency() == 0 {
            let e = hotloop::Error::UnsupportedPlatform("CPU sampling needs Linux on x86_64".to_string());
            warn!(error = %e, "CPU profiles will be unavailable");
        } else {
            info!(hz = cli.cpu_freq, "CPU sampling started");
        }
    }

    println!("start pprof");

    let handle = server::spawn(ServerConfig::new(cli.addr)).context("Cannot start profiling server")?;
    match handle.wait_ready(cli.ready_timeout) {
        Ok(addr) => info!(%addr, "profiling endpoints at http://{addr}/debug/pprof/"),
        Err(e) => error!(error = %e, "profiling server unavailable, running workload without it"),
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("Cannot install Ctrl-C handler")?;
    }

    let mut workload = Workload::new();
    let iterations = workload.run_until(&stop);
    info!(iterations, "workload stopped");

    hotloop_trace::stop_cpu_profiling();
    Err(hotloop::Error::Interrupted.into())
}
