//! Worker processes.
//!
//! A worker is a separate OS process created by re-executing the current
//! binary; the target may pollute process-global state, and a hard crash
//! must not take the orchestrator down with it. The command and report
//! pipes are moved onto fixed descriptors before exec, the way external
//! executors are driven.

use crate::comm::{self, CommError, FrameDecoder, WorkerCommand, WorkerReport};
use crate::Target;
use anyhow::Context;
use krait_core::{corpus::Corpus, coverage::CoverageMap, mutation, trace, RngType};
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Environment marker set on spawned worker processes.
const WORKER_ENV: &str = "KRAIT_WORKER";
/// Worker-side descriptors the pipes are moved onto.
const CMD_FD: RawFd = 3;
const REPORT_FD: RawFd = 4;
/// How often a worker flushes its execution count upstream.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);
/// Broadcasts queued per worker before the oldest is dropped; workers
/// reconverge through later broadcasts.
const OUTBOX_CAPACITY: usize = 128;

/// Events delivered to the orchestrator's merged report stream.
#[derive(Debug)]
pub enum WorkerEvent {
    Report(usize, WorkerReport),
    /// The report channel closed: the worker exited or was killed.
    Exited(usize),
}

/// Branches into the worker loop when this process was spawned as a
/// worker. Call it first thing in `main`, before argument parsing: it
/// returns immediately in a regular invocation and never returns in a
/// worker process.
pub fn enter(target: Target) {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    match run(target) {
        // Shutdown, or the orchestrator went away.
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("krait worker: {}", e);
            std::process::exit(70);
        }
    }
}

fn run(target: Target) -> Result<(), CommError> {
    // Safety: fds 3 and 4 were placed there by the spawning orchestrator
    // and are owned by nothing else in this process.
    let mut commands = unsafe { File::from_raw_fd(CMD_FD) };
    let mut reports = unsafe { File::from_raw_fd(REPORT_FD) };

    // The first frame is always the startup snapshot.
    let (mut corpus, mut coverage, settings) = match comm::read_frame(&mut commands)? {
        WorkerCommand::Seed {
            corpus,
            coverage,
            settings,
        } => {
            let mut local = Corpus::new();
            for sample in corpus {
                local.put(sample);
            }
            (local, coverage, settings)
        }
        _ => return Err(CommError::Protocol("expected seed snapshot")),
    };

    if settings.close_stdout {
        redirect_to_null(libc::STDOUT_FILENO)?;
    }
    if settings.close_stderr {
        redirect_to_null(libc::STDERR_FILENO)?;
    }
    install_panic_hook();
    set_nonblocking(CMD_FD)?;

    let mut rng = RngType::default();
    let mut decoder = FrameDecoder::new();
    let mut executions = 0u64;
    let mut last_status = Instant::now();

    // Replay the snapshot once unmutated so its coverage is attributed
    // before mutation starts.
    for sample in corpus.samples().to_vec() {
        run_sample(target, sample, &mut coverage, &mut reports, &mut executions)?;
    }

    loop {
        if let Flow::Shutdown = drain_commands(&mut commands, &mut decoder, &mut corpus)? {
            return Ok(());
        }

        let sample = corpus.sample(&mut rng);
        let mutated = mutation::mutate(&sample, &mut rng);
        run_sample(target, mutated, &mut coverage, &mut reports, &mut executions)?;

        if last_status.elapsed() >= STATUS_INTERVAL {
            comm::write_frame(&mut reports, &WorkerReport::Status { executions })?;
            executions = 0;
            last_status = Instant::now();
        }
    }
}

/// Runs the target once and reports upstream when the sample crashed or
/// uncovered edges this worker had not seen.
fn run_sample(
    target: Target,
    sample: Vec<u8>,
    coverage: &mut CoverageMap,
    reports: &mut File,
    executions: &mut u64,
) -> Result<(), CommError> {
    let (error, observed) = execute(target, &sample);
    *executions += 1;
    let new_edges = coverage.merge(&observed);
    if let Some(error) = error {
        comm::write_frame(reports, &WorkerReport::Crash { sample, error, new_edges })?;
    } else if !new_edges.is_empty() {
        comm::write_frame(reports, &WorkerReport::NewCoverage { sample, new_edges })?;
    }
    Ok(())
}

/// Invokes the target inside a panic-catching boundary and drains the
/// tracer. Never unwinds past the caller; a panic becomes its textual
/// representation.
pub(crate) fn execute(target: Target, sample: &[u8]) -> (Option<String>, CoverageMap) {
    trace::reset();
    let result = panic::catch_unwind(AssertUnwindSafe(|| target(sample)));
    let observed = trace::drain();
    (result.err().map(|payload| panic_text(&*payload)), observed)
}

enum Flow {
    Continue,
    Shutdown,
}

/// Applies pending orchestrator commands without blocking. EOF on the
/// command pipe means the orchestrator is gone and the worker has no
/// reason to outlive it.
fn drain_commands(
    pipe: &mut File,
    decoder: &mut FrameDecoder,
    corpus: &mut Corpus,
) -> Result<Flow, CommError> {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => return Ok(Flow::Shutdown),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    while let Some(cmd) = decoder.next::<WorkerCommand>()? {
        match cmd {
            WorkerCommand::Input { sample } => {
                corpus.put(sample);
            }
            WorkerCommand::Shutdown => return Ok(Flow::Shutdown),
            // Only meaningful as the first frame.
            WorkerCommand::Seed { .. } => {}
        }
    }
    Ok(Flow::Continue)
}

thread_local! {
    static PANIC_SITE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Captures panic locations and silences the default printer; crashes are
/// recorded, not narrated.
pub(crate) fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let site = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        PANIC_SITE.with(|s| *s.borrow_mut() = site);
    }));
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    match PANIC_SITE.with(|s| s.borrow_mut().take()) {
        Some(site) => format!("panicked at {}: {}", site, msg),
        None => format!("panicked: {}", msg),
    }
}

fn redirect_to_null(fd: RawFd) -> io::Result<()> {
    let devnull = OpenOptions::new().write(true).open("/dev/null")?;
    if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Bounded queue of pending commands for one worker. Pushing never blocks
/// the orchestrator: when the queue is full the oldest broadcast is
/// dropped and the worker reconverges through later ones.
#[derive(Default)]
struct Outbox {
    queue: Mutex<OutboxQueue>,
    available: Condvar,
}

#[derive(Default)]
struct OutboxQueue {
    pending: VecDeque<WorkerCommand>,
    closed: bool,
}

impl Outbox {
    fn push(&self, cmd: WorkerCommand) {
        let mut q = self.queue.lock().unwrap();
        if q.closed {
            return;
        }
        if q.pending.len() >= OUTBOX_CAPACITY {
            q.pending.pop_front();
        }
        q.pending.push_back(cmd);
        self.available.notify_one();
    }

    fn close(&self) {
        self.queue.lock().unwrap().closed = true;
        self.available.notify_one();
    }

    /// Blocks until a command is available; `None` once closed and drained.
    fn pop(&self) -> Option<WorkerCommand> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(cmd) = q.pending.pop_front() {
                return Some(cmd);
            }
            if q.closed {
                return None;
            }
            q = self.available.wait(q).unwrap();
        }
    }
}

/// Parent-side handle to one worker process.
pub struct WorkerHandle {
    id: usize,
    child: Child,
    outbox: Arc<Outbox>,
}

impl WorkerHandle {
    /// Spawns a worker seeded with `snapshot` and wires its reports into
    /// `events`.
    pub fn spawn(
        id: usize,
        snapshot: WorkerCommand,
        events: Sender<WorkerEvent>,
    ) -> anyhow::Result<WorkerHandle> {
        let (cmd_read, cmd_write) = os_pipe::pipe().context("failed to create command pipe")?;
        let (report_read, report_write) =
            os_pipe::pipe().context("failed to create report pipe")?;

        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let mut command = Command::new(exe);
        command
            .env(WORKER_ENV, id.to_string())
            .stdin(Stdio::null());

        let cmd_fd = cmd_read.as_raw_fd();
        let report_fd = report_write.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // Park both ends above the target slots first so neither
                // dup2 can clobber the other pipe's descriptor.
                let parked_cmd = check_fd(libc::fcntl(cmd_fd, libc::F_DUPFD, 10))?;
                let parked_report = check_fd(libc::fcntl(report_fd, libc::F_DUPFD, 10))?;
                check_fd(libc::dup2(parked_cmd, CMD_FD))?;
                check_fd(libc::dup2(parked_report, REPORT_FD))?;
                libc::close(parked_cmd);
                libc::close(parked_report);
                Ok(())
            });
        }

        let child = command.spawn().context("failed to spawn worker process")?;
        drop(cmd_read);
        drop(report_write);

        let outbox = Arc::new(Outbox::default());
        outbox.push(snapshot);

        // Writer: drains the outbox into the command pipe so broadcasts
        // never block the orchestrator on a stalled worker.
        let writer_outbox = Arc::clone(&outbox);
        thread::spawn(move || {
            let mut pipe = cmd_write;
            while let Some(cmd) = writer_outbox.pop() {
                if comm::write_frame(&mut pipe, &cmd).is_err() {
                    break;
                }
            }
            // Dropping the pipe signals shutdown to the worker as EOF.
        });

        // Forwarder: frames from this worker keep their production order
        // on the shared event stream.
        thread::spawn(move || {
            let mut pipe = report_read;
            loop {
                match comm::read_frame::<WorkerReport, _>(&mut pipe) {
                    Ok(report) => {
                        if events.send(WorkerEvent::Report(id, report)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = events.send(WorkerEvent::Exited(id));
                        break;
                    }
                }
            }
        });

        Ok(WorkerHandle { id, child, outbox })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Queues a command; never blocks.
    pub fn send(&self, cmd: WorkerCommand) {
        self.outbox.push(cmd);
    }

    /// Asks the worker to exit between target invocations.
    pub fn shutdown(&self) {
        self.outbox.push(WorkerCommand::Shutdown);
        self.outbox.close();
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Force-terminates and reaps the worker.
    pub fn kill(&mut self) {
        self.outbox.close();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

fn check_fd(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
