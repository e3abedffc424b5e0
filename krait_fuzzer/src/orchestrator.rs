//! The orchestrator owns the canonical corpus and coverage map, spawns
//! workers, merges their reports, persists state and decides when to stop.

use crate::comm::{WorkerCommand, WorkerReport, WorkerSettings};
use crate::config::Config;
use crate::crash::CrashDir;
use crate::state::{self, SessionState};
use crate::stats::Stats;
use crate::worker::{self, WorkerEvent, WorkerHandle};
use crate::Target;
use anyhow::Context;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// How long workers get to exit after the shutdown broadcast before they
/// are killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a fuzzing session.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzSummary {
    pub executions: u64,
    /// Distinct crashes recorded during this session.
    pub crashes: u64,
    pub edges: usize,
    pub corpus: usize,
}

pub struct Orchestrator {
    config: Config,
    state: SessionState,
    crash_dir: CrashDir,
    stats: Stats,
    workers: Vec<WorkerHandle>,
    events: mpsc::Receiver<WorkerEvent>,
    events_tx: mpsc::Sender<WorkerEvent>,
    next_worker_id: usize,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.check()?;

        let mut state = match config.state.as_ref() {
            Some(path) => state::load(path)
                .with_context(|| format!("failed to load state file {}", path.display()))?
                .unwrap_or_default(),
            None => SessionState::default(),
        };
        if !state.corpus.is_empty() {
            log::info!(
                "resumed state: {} corpus entries, {} known edges",
                state.corpus.len(),
                state.coverage.len()
            );
        }

        let crash_dir = CrashDir::open(&config.crash_dir).with_context(|| {
            format!("failed to open crash directory {}", config.crash_dir.display())
        })?;

        let seeds = load_dir(&mut state.corpus, &config.seed_dir)
            .with_context(|| format!("failed to read seed directory {}", config.seed_dir.display()))?;
        log::info!("seed corpus: {} new entries read", seeds);

        if config.load_crashes {
            let mut loaded = 0;
            for path in crash_dir.entries()? {
                let data = fs::read(&path)
                    .with_context(|| format!("failed to read crash {}", path.display()))?;
                if state.corpus.put(data) {
                    loaded += 1;
                }
            }
            log::info!("previous crashes loaded into corpus: {}", loaded);
        }

        let (events_tx, events) = mpsc::channel();
        let next_worker_id = config.num_workers;
        Ok(Self {
            config,
            state,
            crash_dir,
            stats: Stats::new(),
            workers: Vec::new(),
            events,
            events_tx,
            next_worker_id,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn run(mut self) -> anyhow::Result<FuzzSummary> {
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.stop))
                .context("failed to install signal handler")?;
        }

        log::info!(
            "spawning {} workers (start method: {:?})",
            self.config.num_workers,
            self.config.start_method
        );
        for id in 0..self.config.num_workers {
            self.spawn_worker(id)?;
        }

        let deadline = self.config.max_time.map(|t| Instant::now() + t);
        let mut next_stat = Instant::now() + self.config.stat_frequency;
        let mut next_checkpoint = Instant::now() + self.config.checkpoint_interval;

        // Running: a single thread multiplexes worker reports, the periodic
        // timers and the shutdown flag; nothing else touches the canonical
        // state.
        loop {
            if self.stop.load(Ordering::Relaxed) {
                log::info!("termination signal received, stopping");
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    log::info!("wall-clock budget elapsed, stopping");
                    break;
                }
            }
            if let Some(max) = self.config.max_crashes {
                if self.stats.crashes >= max {
                    log::info!("{} distinct crashes recorded, stopping", self.stats.crashes);
                    break;
                }
            }

            let mut wake = next_stat.min(next_checkpoint);
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }
            let timeout = wake.saturating_duration_since(Instant::now());

            match self.events.recv_timeout(timeout) {
                Ok(WorkerEvent::Report(id, report)) => self.handle_report(id, report)?,
                Ok(WorkerEvent::Exited(id)) => self.handle_exit(id)?,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // Cannot happen while we hold a sender, but losing the
                // report channel would leave us blind.
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("worker report channel lost")
                }
            }

            let now = Instant::now();
            if now >= next_stat {
                self.stats.report(self.state.coverage.len(), self.state.corpus.len());
                next_stat = now + self.config.stat_frequency;
            }
            if now >= next_checkpoint {
                self.checkpoint()?;
                next_checkpoint = now + self.config.checkpoint_interval;
            }
        }

        self.drain();
        self.checkpoint()?;
        self.stats.report(self.state.coverage.len(), self.state.corpus.len());
        Ok(FuzzSummary {
            executions: self.stats.executions,
            crashes: self.stats.crashes,
            edges: self.state.coverage.len(),
            corpus: self.state.corpus.len(),
        })
    }

    fn handle_report(&mut self, id: usize, report: WorkerReport) -> anyhow::Result<()> {
        match report {
            WorkerReport::NewCoverage { sample, new_edges } => {
                let fresh = self.state.coverage.merge(&new_edges);
                if !fresh.is_empty() && self.state.corpus.put(sample.clone()) {
                    log::debug!(
                        "worker-{}: {} new edges, corpus entry of {} bytes",
                        id,
                        fresh.len(),
                        sample.len()
                    );
                    self.broadcast(WorkerCommand::Input { sample });
                }
            }
            WorkerReport::Crash { sample, error, new_edges } => {
                let fresh = self.state.coverage.merge(&new_edges);
                log::debug!("worker-{}: target crashed: {}", id, error);
                if self.record_crash(&sample)? {
                    self.stats.inc_crashes();
                }
                // A crashing input that also uncovered edges stays
                // interesting for mutation.
                if !fresh.is_empty() && self.state.corpus.put(sample.clone()) {
                    self.broadcast(WorkerCommand::Input { sample });
                }
            }
            WorkerReport::Status { executions } => self.stats.add_executions(executions),
        }
        Ok(())
    }

    /// Recording crashes is the one job the fuzzer cannot shrug off: one
    /// retry, then escalate.
    fn record_crash(&self, sample: &[u8]) -> anyhow::Result<bool> {
        match self.crash_dir.save(sample) {
            Ok(added) => Ok(added),
            Err(e) => {
                log::warn!("failed to write crash file ({}), retrying", e);
                self.crash_dir
                    .save(sample)
                    .context("cannot record crashes")
            }
        }
    }

    fn handle_exit(&mut self, id: usize) -> anyhow::Result<()> {
        let Some(pos) = self.workers.iter().position(|w| w.id() == id) else {
            // Already drained or replaced.
            return Ok(());
        };
        let mut dead = self.workers.swap_remove(pos);
        dead.kill();
        log::warn!("worker-{} died without a report, respawning", id);
        let fresh = self.next_worker_id;
        self.next_worker_id += 1;
        self.spawn_worker(fresh)
    }

    fn spawn_worker(&mut self, id: usize) -> anyhow::Result<()> {
        let snapshot = WorkerCommand::Seed {
            corpus: self.state.corpus.samples().to_vec(),
            coverage: self.state.coverage.clone(),
            settings: WorkerSettings {
                close_stdout: self.config.close_stdout,
                close_stderr: self.config.close_stderr,
            },
        };
        let handle = WorkerHandle::spawn(id, snapshot, self.events_tx.clone())
            .with_context(|| format!("failed to spawn worker-{}", id))?;
        self.workers.push(handle);
        Ok(())
    }

    fn broadcast(&self, cmd: WorkerCommand) {
        for worker in &self.workers {
            worker.send(cmd.clone());
        }
    }

    fn drain(&mut self) {
        log::info!("draining {} workers", self.workers.len());
        for worker in &self.workers {
            worker.shutdown();
        }
        let deadline = Instant::now() + DRAIN_GRACE;
        let mut pending: Vec<WorkerHandle> = self.workers.drain(..).collect();
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain_mut(|w| !matches!(w.try_wait(), Ok(Some(_))));
            std::thread::sleep(Duration::from_millis(50));
        }
        for mut worker in pending {
            log::warn!("worker-{} ignored shutdown, killing", worker.id());
            worker.kill();
        }
    }

    fn checkpoint(&self) -> anyhow::Result<()> {
        let Some(path) = self.config.state.as_ref() else {
            return Ok(());
        };
        state::save(path, &self.state)
            .with_context(|| format!("failed to write state file {}", path.display()))
    }
}

/// Adds every regular file of `dir` to the corpus; returns how many were
/// new.
fn load_dir(corpus: &mut krait_core::corpus::Corpus, dir: &Path) -> anyhow::Result<usize> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut added = 0;
    for path in paths {
        let data =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if corpus.put(data) {
            added += 1;
        }
    }
    Ok(added)
}

/// Regression mode: no workers, no mutation. Replays every recorded crash
/// and reports how many still crash.
pub fn run_regression(crash_dir: &Path, target: Target) -> anyhow::Result<u64> {
    worker::install_panic_hook();
    let dir = CrashDir::open(crash_dir)
        .with_context(|| format!("failed to open crash directory {}", crash_dir.display()))?;

    let mut still_crashing = 0;
    for path in dir.entries()? {
        let sample =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        match worker::execute(target, &sample).0 {
            Some(error) => {
                still_crashing += 1;
                log::info!("{}: still crashing: {}", path.display(), error);
            }
            None => log::info!("{}: no longer crashes", path.display()),
        }
    }
    Ok(still_crashing)
}
