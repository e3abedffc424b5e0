//! Session configuration.

use std::path::PathBuf;
use std::thread::available_parallelism;
use std::time::Duration;
use thiserror::Error;

/// A configuration problem the user has to fix; reported before any worker
/// is spawned.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(String);

/// Worker process creation discipline. `fork` is deliberately not
/// representable: the orchestrator may hold locks (serialization, logging)
/// when a worker is created, and a forked child would inherit them
/// mid-acquisition and deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StartMethod {
    /// Re-execute the current binary with a fresh address space.
    Spawn,
    /// Accepted for interface compatibility; a native binary has no
    /// interpreter image to amortize, so this resolves to `spawn`.
    Forkserver,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory crashing inputs are recorded in.
    pub crash_dir: PathBuf,
    /// Directory of files seeding the corpus.
    pub seed_dir: PathBuf,
    /// State file for checkpoint/resume; `None` disables persistence.
    pub state: Option<PathBuf>,
    pub num_workers: usize,
    /// Global wall-clock budget.
    pub max_time: Option<Duration>,
    /// Stop once this many distinct crashes have been recorded.
    pub max_crashes: Option<u64>,
    pub stat_frequency: Duration,
    pub checkpoint_interval: Duration,
    /// Seed the corpus with previously recorded crashes; crashing inputs
    /// stay interesting for regression coverage.
    pub load_crashes: bool,
    pub close_stdout: bool,
    pub close_stderr: bool,
    pub start_method: StartMethod,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crash_dir: PathBuf::from("./crashes"),
            seed_dir: PathBuf::from("seeds"),
            state: None,
            num_workers: default_num_workers(),
            max_time: None,
            max_crashes: None,
            stat_frequency: Duration::from_secs(3),
            checkpoint_interval: Duration::from_secs(60),
            load_crashes: false,
            close_stdout: false,
            close_stderr: false,
            start_method: StartMethod::Spawn,
        }
    }
}

impl Config {
    /// Fail-fast validation, run before any worker exists.
    pub fn check(&self) -> Result<(), ConfigError> {
        if !self.seed_dir.is_dir() {
            return Err(ConfigError(format!(
                "seed directory {} does not exist or is not a directory",
                self.seed_dir.display()
            )));
        }
        if self.num_workers == 0 {
            return Err(ConfigError("at least one worker is required".into()));
        }
        if self.stat_frequency.is_zero() {
            return Err(ConfigError("stat frequency must be positive".into()));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError("checkpoint interval must be positive".into()));
        }
        Ok(())
    }
}

pub fn default_num_workers() -> usize {
    available_parallelism().map(usize::from).unwrap_or(1)
}
