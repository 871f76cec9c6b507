use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::signals;
use crate::state::Step;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROGRESS_PRINT_INTERVAL: Duration = Duration::from_secs(1);

/// Status updates for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    StepChanged {
        migration_id: String,
        step: Step,
    },
    Log {
        line: String,
    },
    Warning {
        message: String,
    },
    Progress {
        bytes: u64,
        chunks: u64,
        elapsed_ms: u128,
    },
    Done {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    last_progress: Option<Instant>,
    last_bytes: u64,
    warnings: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StepChanged { migration_id, step } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("STEP: {migration_id} -> {step}");
            }
            ExecEvent::Log { line } => println!("  {line}"),
            ExecEvent::Warning { message } => {
                if let Ok(mut s) = self.state.lock() {
                    s.warnings.push(message.clone());
                }
                println!("WARN: {message}");
            }
            ExecEvent::Progress {
                bytes, elapsed_ms, ..
            } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                s.last_bytes = bytes;
                let due = s
                    .last_progress
                    .is_none_or(|t| t.elapsed() >= PROGRESS_PRINT_INTERVAL);
                if due {
                    s.last_progress = Some(Instant::now());
                    println!(
                        "  received {} in {}",
                        format_bytes(bytes),
                        format_elapsed_hms((elapsed_ms / 1000) as u64)
                    );
                }
            }
            ExecEvent::Done { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if s.last_bytes > 0 {
                    println!("  captured: {}", format_bytes(s.last_bytes));
                }
                for w in &s.warnings {
                    println!("  warning: {w}");
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Output of a finished (or killed) subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Best single-line description of why the command failed.
    pub fn summary(&self) -> String {
        if self.timed_out {
            return "timed out".into();
        }
        let stderr = self.stderr_text();
        if let Some(line) = stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            return sanitize_log_line(line.trim());
        }
        let stdout = self.stdout_text();
        if let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            return sanitize_log_line(line.trim());
        }
        match self.status {
            Some(s) => format!("status {s}"),
            None => "no exit status".into(),
        }
    }
}

#[derive(Default)]
struct SharedExecState {
    // Process group ids of running children, killed on force quit.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(sink: Arc<dyn ExecSink>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || signals::interrupt_requested()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn check_cancel(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::interrupted());
        }
        Ok(())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::Log {
            line: msg.to_string(),
        });
    }

    pub fn warn(&self, msg: &str) {
        warn!("{msg}");
        self.sink.emit(ExecEvent::Warning {
            message: msg.to_string(),
        });
    }

    pub fn progress(&self, bytes: u64, chunks: u64, elapsed: Duration) {
        self.sink.emit(ExecEvent::Progress {
            bytes,
            chunks,
            elapsed_ms: elapsed.as_millis(),
        });
    }

    pub fn step_changed(&self, migration_id: &str, step: Step) {
        self.sink.emit(ExecEvent::StepChanged {
            migration_id: migration_id.to_string(),
            step,
        });
    }

    /// Spawn `cmd` in its own process group with stdout/stderr piped. The
    /// caller owns the returned handle and must `finish` it.
    pub fn spawn_piped(&self, mut cmd: Command, label: &str) -> Result<RunningChild> {
        self.check_cancel()?;
        own_process_group(&mut cmd);
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(label, e))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid, label);
        debug!(pgid, label, "spawned child");
        Ok(RunningChild {
            child,
            pgid,
            ctx: self.clone(),
            reaped: false,
        })
    }

    /// Run `cmd` to completion, capturing output. A `timeout` kills the
    /// process group and marks the output `timed_out`; cancellation kills
    /// it and returns an interrupted error.
    pub fn run_output(
        &self,
        mut cmd: Command,
        label: &str,
        timeout: Option<Duration>,
        stdin: Option<Vec<u8>>,
    ) -> Result<CmdOutput> {
        self.check_cancel()?;
        own_process_group(&mut cmd);
        let mut child = cmd
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(label, e))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid, label);

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            std::thread::spawn(move || {
                let _ = pipe.write_all(&bytes);
            });
        }
        let out_reader = child.stdout.take().map(read_to_end_thread);
        let err_reader = child.stderr.take().map(read_to_end_thread);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let mut interrupted = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    self.unregister_child_pgroup(pgid);
                    return Err(Error::msg(format!("{label}: wait failed: {e}")));
                }
            }
            if self.cancelled() {
                interrupted = true;
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
            }
            if interrupted || timed_out {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                break child.wait().ok();
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        self.unregister_child_pgroup(pgid);

        let stdout = out_reader.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = err_reader.and_then(|h| h.join().ok()).unwrap_or_default();
        if interrupted {
            return Err(Error::interrupted());
        }
        Ok(CmdOutput {
            status,
            stdout,
            stderr,
            timed_out,
        })
    }

    pub fn kill_running_children_force(&self) {
        let pgids: Vec<u32> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, true);
        }
    }

    fn register_child_pgroup(&self, pgid: u32, label: &str) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.insert(pgid, label.to_string());
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }
}

/// A spawned child in its own process group. Dropping an unfinished handle
/// kills the group so no stream producer outlives its consumer.
pub struct RunningChild {
    child: Child,
    pgid: u32,
    ctx: ExecCtx,
    reaped: bool,
}

impl RunningChild {
    pub fn stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.child.stderr.take()
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    pub fn terminate(&mut self) {
        kill_pgroup(self.pgid, false);
        kill_pgroup(self.pgid, true);
    }

    pub fn finish(mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")));
        self.reaped = true;
        self.ctx.unregister_child_pgroup(self.pgid);
        status
    }
}

impl Drop for RunningChild {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
            let _ = self.child.wait();
            self.ctx.unregister_child_pgroup(self.pgid);
        }
    }
}

fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // A separate group lets us kill ssh together with sshpass, and keeps
        // the terminal's SIGINT from reaching children directly.
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn spawn_error(label: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        return Error::new(
            crate::error::ErrorKind::Dependency,
            format!("{label}: program not found ({e})"),
        );
    }
    Error::msg(format!("{label}: spawn failed: {e}"))
}

fn read_to_end_thread<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

pub(crate) fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
