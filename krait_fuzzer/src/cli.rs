//! Command-line surface, parsed on behalf of the user's target binary.

use crate::config::{self, Config, StartMethod};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Coverage-guided fuzzer for byte-oriented targets.
#[derive(Debug, Parser)]
#[command(name = "fuzz")]
pub struct Cli {
    /// Directory crashing inputs are recorded in.
    #[arg(long, global = true, default_value = "./crashes")]
    pub crash_dir: PathBuf,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the fuzzing loop against the linked target.
    Fuzz {
        /// Directory of files seeding the corpus.
        seed_dir: PathBuf,

        /// State file for checkpoint/resume; omit to disable persistence.
        #[arg(long)]
        state: Option<PathBuf>,

        /// Number of parallel worker processes.
        #[arg(long, default_value_t = config::default_num_workers())]
        num_workers: usize,

        /// Global wall-clock budget in seconds.
        #[arg(long)]
        max_time: Option<u64>,

        /// Stop after this many distinct crashes.
        #[arg(long)]
        max_crashes: Option<u64>,

        /// Seconds between progress lines.
        #[arg(long, default_value_t = 3)]
        stat_frequency: u64,

        /// Seconds between state checkpoints.
        #[arg(long, default_value_t = 60)]
        checkpoint_interval: u64,

        /// Seed the corpus with previously recorded crashes.
        #[arg(long)]
        load_crashes: bool,

        /// Workers redirect stdout to /dev/null before running the target.
        #[arg(long)]
        close_stdout: bool,

        /// Workers redirect stderr to /dev/null before running the target.
        #[arg(long)]
        close_stderr: bool,

        /// Replay recorded crashes instead of fuzzing.
        #[arg(long)]
        regression: bool,

        /// Worker process creation discipline.
        #[arg(long, value_enum, default_value_t = StartMethod::Spawn)]
        start_method: StartMethod,
    },
    /// Print each recorded crash's path and a truncated payload.
    Show,
}

impl CliCommand {
    /// Builds the session configuration for a `fuzz` invocation.
    pub fn to_config(&self, crash_dir: PathBuf) -> Option<Config> {
        match self {
            CliCommand::Fuzz {
                seed_dir,
                state,
                num_workers,
                max_time,
                max_crashes,
                stat_frequency,
                checkpoint_interval,
                load_crashes,
                close_stdout,
                close_stderr,
                regression: _,
                start_method,
            } => Some(Config {
                crash_dir,
                seed_dir: seed_dir.clone(),
                state: state.clone(),
                num_workers: *num_workers,
                max_time: max_time.map(Duration::from_secs),
                max_crashes: *max_crashes,
                stat_frequency: Duration::from_secs(*stat_frequency),
                checkpoint_interval: Duration::from_secs(*checkpoint_interval),
                load_crashes: *load_crashes,
                close_stdout: *close_stdout,
                close_stderr: *close_stderr,
                start_method: *start_method,
            }),
            CliCommand::Show => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, CliCommand};
    use crate::config::StartMethod;
    use clap::Parser;

    #[test]
    fn fork_start_method_fails_fast() {
        let err = Cli::try_parse_from(["fuzz", "fuzz", "--start-method", "fork", "seeds"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
        // The message names the supported disciplines.
        let rendered = err.to_string();
        assert!(rendered.contains("spawn"));
        assert!(rendered.contains("forkserver"));
    }

    #[test]
    fn start_method_accepts_spawn_and_forkserver() {
        for (value, expected) in [
            ("spawn", StartMethod::Spawn),
            ("forkserver", StartMethod::Forkserver),
        ] {
            let cli =
                Cli::try_parse_from(["fuzz", "fuzz", "--start-method", value, "seeds"]).unwrap();
            match cli.command {
                CliCommand::Fuzz { start_method, .. } => assert_eq!(start_method, expected),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn defaults_match_the_interface_contract() {
        let cli = Cli::try_parse_from(["fuzz", "fuzz", "seeds"]).unwrap();
        assert_eq!(cli.crash_dir.to_str().unwrap(), "./crashes");
        match cli.command {
            CliCommand::Fuzz {
                ref seed_dir,
                stat_frequency,
                checkpoint_interval,
                regression,
                load_crashes,
                ..
            } => {
                assert_eq!(seed_dir.to_str().unwrap(), "seeds");
                assert_eq!(stat_frequency, 3);
                assert_eq!(checkpoint_interval, 60);
                assert!(!regression);
                assert!(!load_crashes);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn config_conversion_carries_every_flag() {
        let cli = Cli::try_parse_from([
            "fuzz",
            "--crash-dir",
            "/tmp/kr",
            "fuzz",
            "--state",
            "s.dat",
            "--num-workers",
            "2",
            "--max-time",
            "30",
            "--max-crashes",
            "1",
            "--close-stdout",
            "--load-crashes",
            "seeds",
        ])
        .unwrap();
        let config = cli.command.to_config(cli.crash_dir.clone()).unwrap();
        assert_eq!(config.crash_dir.to_str().unwrap(), "/tmp/kr");
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.max_time.unwrap().as_secs(), 30);
        assert_eq!(config.max_crashes, Some(1));
        assert!(config.close_stdout);
        assert!(!config.close_stderr);
        assert!(config.load_crashes);
        assert_eq!(config.state.as_ref().unwrap().to_str().unwrap(), "s.dat");
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["fuzz"]).is_err());
    }
}
