use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Highest CPU sampling rate accepted on the command line
pub const MAX_CPU_FREQ: u32 = 10_000;

#[derive(Parser, Debug)]
#[command(name = "hotloop")]
#[command(about = "Busy-loop workload with an HTTP profiling server")]
#[command(version)]
pub struct Cli {
    /// Address the profiling server listens on
    #[arg(long, default_value = crate::server::DEFAULT_ADDR)]
    pub addr: SocketAddr,

    /// CPU sampling frequency in Hz (0 disables CPU sampling)
    #[arg(long, default_value = "99")]
    pub cpu_freq: u32,

    /// How long to wait for the profiling server to come up
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub ready_timeout: Duration,

    /// Log filter, e.g. "info" or "hotloop=debug"
    #[arg(long, default_value = "info")]
    pub log: String,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 500ms, 2s, 1m, 3",
        s
    ))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.cpu_freq > MAX_CPU_FREQ {
            return Err(format!(
                "CPU frequency must be between 0 and {} Hz, got {}",
                MAX_CPU_FREQ, self.cpu_freq
            ));
        }

        if self.ready_timeout.is_zero() {
            return Err("Ready timeout must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_setup() {
        let cli = Cli::try_parse_from(["hotloop"]).unwrap();
        assert_eq!(cli.addr, "0.0.0.0:9090".parse().unwrap());
        assert_eq!(cli.cpu_freq, 99);
        assert_eq!(cli.ready_timeout, Duration::from_secs(2));
        assert_eq!(cli.log, "info");
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cli = Cli::try_parse_from(["hotloop", "--cpu-freq", "20000"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["hotloop", "--ready-timeout", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(Cli::try_parse_from(["hotloop", "--addr", "not-an-addr"]).is_err());
    }
}
