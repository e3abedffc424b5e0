//! End-to-end scenarios driven through real worker processes.
//!
//! The harness is disabled for this test: fuzzing re-executes the current
//! binary to create workers, so `main` must branch into the worker loop
//! itself. The scenario being fuzzed travels through the environment; a
//! respawned worker reads it back to bind the right target before calling
//! `worker::enter`.

use krait_core::trace;
use krait_fuzzer::{boot, orchestrator, worker, Config, Target};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const TARGET_ENV: &str = "KRAIT_E2E_TARGET";

fn main() {
    // In a worker process both TARGET_ENV and the worker marker are set;
    // in the parent, TARGET_ENV is unset when main starts.
    if let Ok(name) = env::var(TARGET_ENV) {
        worker::enter(target_for(&name));
    }

    let env = env_logger::Env::new().filter_or("KRAIT_LOG", "warn");
    env_logger::Builder::from_env(env).init();

    trivial_crash_is_found();
    unreachable_branch_is_reached();
    noop_target_times_out_cleanly();
    regression_replays_recorded_crashes();
    checkpoint_and_resume();
    crashes_deduplicate_across_workers();

    println!("all scenarios passed");
}

fn target_for(name: &str) -> Target {
    match name {
        "div" => divide_by_first_byte,
        "cobra" => cobra,
        "noop" => noop,
        "empty" => crash_on_empty,
        other => panic!("unknown scenario target {other}"),
    }
}

/// Crashes iff the input starts with 0x41.
fn divide_by_first_byte(data: &[u8]) {
    trace::cov_hit(10);
    if data.is_empty() {
        return;
    }
    trace::cov_hit(11);
    let divisor = if data[0] != 0x41 { 1 } else { 0 };
    let _ = data[0] / divisor;
}

/// Crashes iff the input is exactly `COBRA!!!`. Every matched prefix byte
/// reports a distinct location, so the corpus can climb toward the match.
fn cobra(data: &[u8]) {
    const MAGIC: &[u8] = b"COBRA!!!";
    let matched = data
        .iter()
        .zip(MAGIC)
        .take_while(|(a, b)| a == b)
        .count();
    for i in 0..matched {
        trace::cov_hit(200 + i as u64);
    }
    if matched == MAGIC.len() && data.len() == MAGIC.len() {
        panic!("found the magic input");
    }
}

fn noop(_data: &[u8]) {}

/// Crashes iff the input is empty.
fn crash_on_empty(data: &[u8]) {
    trace::cov_hit(20);
    if data.is_empty() {
        panic!("empty input");
    }
}

struct Scenario {
    _root: tempfile::TempDir,
    config: Config,
}

/// Builds a scratch session fuzzing `target_name` on the given seeds.
fn scenario(target_name: &str, seeds: &[&[u8]]) -> Scenario {
    let root = tempfile::tempdir().expect("failed to create scratch dir");
    let seed_dir = root.path().join("seeds");
    fs::create_dir(&seed_dir).unwrap();
    for (i, seed) in seeds.iter().enumerate() {
        fs::write(seed_dir.join(format!("seed-{i}")), seed).unwrap();
    }
    let config = Config {
        seed_dir,
        crash_dir: root.path().join("crashes"),
        num_workers: 2,
        stat_frequency: Duration::from_secs(1),
        ..Config::default()
    };
    env::set_var(TARGET_ENV, target_name);
    Scenario { _root: root, config }
}

fn crash_files(dir: &Path) -> Vec<Vec<u8>> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map(|it| it.filter_map(Result::ok).map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    entries.iter().map(|p| fs::read(p).unwrap()).collect()
}

fn trivial_crash_is_found() {
    let s = scenario("div", &[b""]);
    let config = Config {
        max_crashes: Some(1),
        max_time: Some(Duration::from_secs(120)),
        ..s.config.clone()
    };

    let summary = boot(config.clone()).expect("fuzzing session failed");
    assert!(summary.crashes >= 1, "no crash found within the budget");
    let crashes = crash_files(&config.crash_dir);
    assert!(!crashes.is_empty());
    assert!(
        crashes.iter().any(|c| c.first() == Some(&0x41)),
        "recorded crash does not start with 0x41"
    );
    println!("ok: trivial crash");
}

fn unreachable_branch_is_reached() {
    let s = scenario("cobra", &[b"COBRA"]);
    let config = Config {
        max_crashes: Some(1),
        max_time: Some(Duration::from_secs(240)),
        ..s.config.clone()
    };

    let summary = boot(config.clone()).expect("fuzzing session failed");
    assert!(summary.crashes >= 1, "magic input not found within the budget");
    let crashes = crash_files(&config.crash_dir);
    assert!(
        crashes.iter().any(|c| c == b"COBRA!!!"),
        "crash content is not the magic input"
    );
    println!("ok: unreachable branch");
}

fn noop_target_times_out_cleanly() {
    let s = scenario("noop", &[b"anything"]);
    let config = Config {
        max_time: Some(Duration::from_secs(3)),
        ..s.config.clone()
    };

    let summary = boot(config.clone()).expect("fuzzing session failed");
    assert_eq!(summary.crashes, 0);
    assert!(crash_files(&config.crash_dir).is_empty());
    assert!(summary.executions > 0, "workers never reported progress");
    println!("ok: no-op target");
}

fn regression_replays_recorded_crashes() {
    // Reuses the trivial-crash target on a freshly recorded crash.
    let s = scenario("div", &[b""]);
    let config = Config {
        max_crashes: Some(1),
        max_time: Some(Duration::from_secs(120)),
        ..s.config.clone()
    };
    boot(config.clone()).expect("fuzzing session failed");

    let still = orchestrator::run_regression(&config.crash_dir, divide_by_first_byte)
        .expect("regression replay failed");
    assert!(still >= 1, "recorded crash did not reproduce");

    // A target that no longer crashes reports zero.
    let still = orchestrator::run_regression(&config.crash_dir, noop).unwrap();
    assert_eq!(still, 0);
    println!("ok: regression replay");
}

fn checkpoint_and_resume() {
    let s = scenario("cobra", &[b"COBRA"]);
    let state_path = s._root.path().join("state.dat");

    let first = Config {
        state: Some(state_path.clone()),
        max_time: Some(Duration::from_secs(3)),
        checkpoint_interval: Duration::from_secs(1),
        ..s.config.clone()
    };
    let first_summary = boot(first).expect("first session failed");
    assert!(state_path.exists(), "no checkpoint was written");

    let resumed = Config {
        state: Some(state_path.clone()),
        max_crashes: Some(1),
        max_time: Some(Duration::from_secs(240)),
        ..s.config.clone()
    };
    let summary = boot(resumed.clone()).expect("resumed session failed");
    assert!(
        summary.corpus >= first_summary.corpus,
        "resume lost corpus entries"
    );
    let crashes = crash_files(&resumed.crash_dir);
    assert!(
        crashes.iter().any(|c| c == b"COBRA!!!"),
        "crash not found across checkpoint/resume"
    );
    println!("ok: checkpoint/resume");
}

fn crashes_deduplicate_across_workers() {
    let s = scenario("empty", &[b""]);
    let config = Config {
        num_workers: 4,
        max_time: Some(Duration::from_secs(5)),
        ..s.config.clone()
    };

    boot(config.clone()).expect("fuzzing session failed");
    let crashes = crash_files(&config.crash_dir);
    // Every worker crashes on the empty seed; the directory still holds
    // exactly one file, whose content is the empty sample.
    assert_eq!(crashes.len(), 1, "dedup failed: {} files", crashes.len());
    assert!(crashes[0].is_empty());
    println!("ok: crash dedup");
}
