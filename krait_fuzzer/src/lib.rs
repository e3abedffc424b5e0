//! Krait fuzzing runtime.
//!
//! The engine is linked into the user's binary: `main` hands the target
//! function to [`fuzz_main`], which branches into the worker loop when the
//! process was spawned as a worker and otherwise parses the command line
//! and runs the requested mode.
//!
//! ```no_run
//! fn target(data: &[u8]) {
//!     let _ = std::str::from_utf8(data);
//! }
//!
//! fn main() {
//!     krait_fuzzer::fuzz_main(target);
//! }
//! ```

pub mod cli;
pub mod comm;
pub mod config;
pub mod crash;
pub mod orchestrator;
pub mod state;
pub mod stats;
pub mod worker;

pub use config::{Config, StartMethod};
pub use orchestrator::FuzzSummary;

use crate::crash::CrashDir;
use clap::Parser;
use std::fs;
use std::path::Path;

/// The function under test: gets a byte string, returns nothing, may
/// panic. Statically linked; workers rebind it through [`worker::enter`]
/// when the binary is re-executed.
pub type Target = fn(&[u8]);

/// Number of payload bytes `show` prints per crash.
const SHOW_PAYLOAD_LEN: usize = 32;

/// Full CLI entry point. Never returns; the process exit code is 0 when no
/// crash was recorded, 1 when at least one was, 2 for invalid invocations
/// and 70 for internal failures.
pub fn fuzz_main(target: Target) -> ! {
    worker::enter(target);

    let cli = cli::Cli::parse();

    let env = env_logger::Env::new().filter_or("KRAIT_LOG", "info");
    env_logger::Builder::from_env(env)
        .format_timestamp(Some(env_logger::TimestampPrecision::Seconds))
        .target(env_logger::Target::Stdout)
        .init();

    let code = match run_command(cli, target) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            if is_user_error(&e) {
                2
            } else {
                70
            }
        }
    };
    std::process::exit(code);
}

/// Runs the orchestrator on an already-built configuration. Callers going
/// through this instead of [`fuzz_main`] must still call
/// [`worker::enter`] at the top of `main`, or spawned workers will rerun
/// the caller's `main` as regular invocations.
pub fn boot(config: Config) -> anyhow::Result<FuzzSummary> {
    orchestrator::Orchestrator::new(config)?.run()
}

fn run_command(cli: cli::Cli, target: Target) -> anyhow::Result<i32> {
    match &cli.command {
        cli::CliCommand::Show => {
            show_crashes(&cli.crash_dir)?;
            Ok(0)
        }
        cli::CliCommand::Fuzz { regression: true, .. } => {
            let still_crashing = orchestrator::run_regression(&cli.crash_dir, target)?;
            log::info!("regression: {} samples still crashing", still_crashing);
            Ok(if still_crashing > 0 { 1 } else { 0 })
        }
        command => {
            let config = command
                .to_config(cli.crash_dir.clone())
                .expect("fuzz command always maps to a config");
            let summary = boot(config)?;
            log::info!(
                "done: {} executions, {} edges, {} corpus entries, {} crashes",
                summary.executions,
                summary.edges,
                summary.corpus,
                summary.crashes
            );
            Ok(if summary.crashes > 0 { 1 } else { 0 })
        }
    }
}

fn show_crashes(dir: &Path) -> anyhow::Result<()> {
    let crashes = CrashDir::open(dir)?;
    for path in crashes.entries()? {
        let sample = fs::read(&path)?;
        let mut payload = hex::encode(&sample[..sample.len().min(SHOW_PAYLOAD_LEN)]);
        if sample.len() > SHOW_PAYLOAD_LEN {
            payload.push_str("...");
        }
        println!("{} ({} bytes): {}", path.display(), sample.len(), payload);
    }
    Ok(())
}

/// Errors the user has to fix get exit code 2; everything else is an
/// internal failure.
fn is_user_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause.downcast_ref::<state::StateError>().is_some()
            || cause.downcast_ref::<config::ConfigError>().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::is_user_error;
    use crate::config::Config;
    use crate::state::StateError;

    #[test]
    fn config_and_state_errors_are_user_errors() {
        let config = Config {
            seed_dir: "/definitely/not/here".into(),
            ..Config::default()
        };
        let err = anyhow::Error::from(config.check().unwrap_err());
        assert!(is_user_error(&err));

        let err = anyhow::Error::from(StateError::UnsupportedVersion { found: 9 })
            .context("failed to load state file");
        assert!(is_user_error(&err));

        let err = anyhow::anyhow!("worker report channel lost");
        assert!(!is_user_error(&err));
    }
}
