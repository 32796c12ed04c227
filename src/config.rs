use std::{path::PathBuf, time::Duration};

pub const DEFAULT_WORKERS: usize = 5;
pub const SUPERVISOR_BIN: &str = "supervise";

/// Settings for launching and monitoring one job.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path of the supervisor executable.
    pub supervisor: PathBuf,
    /// Delay between two memory samples.
    pub sample_interval: Duration,
    /// How long to wait for the supervisor to report the job pid.
    pub settle_timeout: Duration,
    /// Used when a request carries no `-t` flag.
    pub grace_timeout: Duration,
    pub force_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            supervisor: default_supervisor(),
            sample_interval: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(2),
            grace_timeout: Duration::from_secs(10),
            force_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    /// Upper bound for reading one request off a fresh connection.
    pub request_timeout: Duration,
    pub runner: RunnerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            workers: DEFAULT_WORKERS,
            request_timeout: Duration::from_secs(5),
            runner: RunnerConfig::default(),
        }
    }
}

/// The supervisor binary is installed next to the server binary.
pub fn default_supervisor() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SUPERVISOR_BIN)))
        .unwrap_or_else(|| PathBuf::from(SUPERVISOR_BIN))
}
