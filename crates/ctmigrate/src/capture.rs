//! Streams a tar of the source host's root filesystem into a local file.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use crate::connection::{ConnectionStrategy, RemoteShell, SshTarget, sh_quote};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ExecCtx, format_bytes, kill_pgroup};
use crate::log_sanitize::{redact, sanitize_diagnostic};

pub const ARCHIVE_FILE_NAME: &str = "filesystem.tar.gz";

/// Never part of a migrated root filesystem.
pub const BASE_EXCLUDES: &[&str] = &[
    "/proc/*",
    "/sys/*",
    "/dev/*",
    "/tmp/*",
    "/run/*",
    "/mnt/*",
    "/media/*",
    "/lost+found",
    "/var/cache/apt/archives/*",
    "/swapfile",
    "/swap.img",
];

const STDERR_TAIL_BYTES: usize = 64 * 1024;
const DIAGNOSTIC_LINES: usize = 8;
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Appended to the built-in and backend exclusion lists.
    pub extra_excludes: Vec<String>,
    pub chunk_size: usize,
    /// Leave a failed archive on disk for inspection.
    pub keep_on_failure: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            extra_excludes: Vec::new(),
            chunk_size: 64 * 1024,
            keep_on_failure: false,
        }
    }
}

/// A finished archive. Only constructed for complete captures.
#[derive(Debug)]
pub struct CaptureArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub exclusions: Vec<String>,
    pub complete: bool,
}

impl CaptureArtifact {
    /// Remove the archive once the backend is done with it.
    pub fn discard(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Base list plus backend extras plus configured extras, deduplicated in
/// order.
pub fn exclusion_set(backend_extra: &[&str], cfg: &CaptureConfig) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let all = BASE_EXCLUDES
        .iter()
        .chain(backend_extra)
        .map(|s| s.to_string())
        .chain(cfg.extra_excludes.iter().map(|s| s.trim().to_string()));
    for p in all {
        if !p.is_empty() && !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

/// Archiving `.` names every member `./<path>`, so an anchored pattern has
/// to carry the same prefix to match anything.
fn member_pattern(pattern: &str) -> String {
    if pattern.starts_with("./") {
        pattern.to_string()
    } else {
        format!("./{}", pattern.trim_start_matches('/'))
    }
}

/// `cd / && tar czpf - --numeric-owner --anchored --exclude='./...' .`
pub fn tar_command(exclusions: &[String]) -> String {
    let mut line = String::from("cd / && tar czpf - --numeric-owner --anchored");
    for p in exclusions {
        line.push_str(" --exclude=");
        line.push_str(&sh_quote(&member_pattern(p)));
    }
    line.push_str(" .");
    line
}

pub struct CapturePipeline<'a> {
    shell: &'a dyn RemoteShell,
    cfg: &'a CaptureConfig,
}

impl<'a> CapturePipeline<'a> {
    pub fn new(shell: &'a dyn RemoteShell, cfg: &'a CaptureConfig) -> Self {
        Self { shell, cfg }
    }

    /// Stream the remote archive into `dest`. The artifact is complete only
    /// when tar exited zero and at least one byte arrived.
    pub fn capture(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        exclusions: &[String],
        dest: &Path,
    ) -> Result<CaptureArtifact> {
        let cmd = self
            .shell
            .remote_command(target, strategy, &tar_command(exclusions))?;
        let secrets: Vec<&str> = target.password.as_deref().into_iter().collect();
        info!(host = %target.host, dest = %dest.display(), excludes = exclusions.len(), "capture started");

        let stats = match self.stream(ctx, cmd, dest) {
            Ok(stats) => stats,
            Err(e) => {
                remove_partial(dest);
                return Err(e);
            }
        };
        let diagnostic = redact(
            &sanitize_diagnostic(&String::from_utf8_lossy(&stats.stderr), DIAGNOSTIC_LINES),
            &secrets,
        );

        let failure = match (stats.exit_ok, stats.bytes) {
            (true, 0) => Some(Error::new(
                ErrorKind::EmptyCapture,
                format!("remote tar exited successfully but produced no data{}", suffix(&diagnostic)),
            )),
            (true, _) => None,
            (false, bytes) => Some(Error::new(
                ErrorKind::IncompleteCapture,
                format!(
                    "remote tar failed ({}) after {}{}",
                    stats.status_text,
                    format_bytes(bytes),
                    suffix(&diagnostic)
                ),
            )),
        };
        if let Some(err) = failure {
            if self.cfg.keep_on_failure && stats.bytes > 0 {
                warn!(path = %dest.display(), "keeping partial archive");
            } else {
                remove_partial(dest);
            }
            return Err(err);
        }

        info!(
            bytes = stats.bytes,
            chunks = stats.chunks,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "capture finished"
        );
        Ok(CaptureArtifact {
            path: dest.to_path_buf(),
            size: stats.bytes,
            exclusions: exclusions.to_vec(),
            complete: true,
        })
    }

    fn stream(&self, ctx: &ExecCtx, cmd: std::process::Command, dest: &Path) -> Result<StreamStats> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let file = File::create(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let mut out = BufWriter::new(file);

        let mut child = ctx.spawn_piped(cmd, "capture")?;
        let mut stdout = child
            .stdout()
            .ok_or_else(|| Error::msg("capture: stdout not piped"))?;
        let stderr_reader = child.stderr().map(read_tail_thread);
        let done = Arc::new(AtomicBool::new(false));
        let watcher = spawn_cancel_watcher(ctx.clone(), child.pgid(), done.clone());

        let started = Instant::now();
        let mut buf = vec![0u8; self.cfg.chunk_size.max(4096)];
        let mut bytes = 0u64;
        let mut chunks = 0u64;
        let loop_result: Result<()> = loop {
            let n = match stdout.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::msg(format!("capture: read failed: {e}"))),
            };
            if let Err(e) = out.write_all(&buf[..n]) {
                break Err(Error::new(
                    ErrorKind::IncompleteCapture,
                    format!("failed to write {}: {e}", dest.display()),
                ));
            }
            bytes += n as u64;
            chunks += 1;
            ctx.progress(bytes, chunks, started.elapsed());
        };
        if loop_result.is_err() {
            child.terminate();
        }
        drop(stdout);
        let flushed = out
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all());

        let status = child.finish();
        done.store(true, Ordering::Relaxed);
        let _ = watcher.join();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if ctx.cancelled() {
            return Err(Error::interrupted());
        }
        loop_result?;
        flushed.map_err(|e| {
            Error::new(
                ErrorKind::IncompleteCapture,
                format!("failed to flush {}: {e}", dest.display()),
            )
        })?;
        let status = status?;
        Ok(StreamStats {
            bytes,
            chunks,
            elapsed: started.elapsed(),
            exit_ok: status.success(),
            status_text: status.to_string(),
            stderr,
        })
    }
}

struct StreamStats {
    bytes: u64,
    chunks: u64,
    elapsed: Duration,
    exit_ok: bool,
    status_text: String,
    stderr: Vec<u8>,
}

fn suffix(diagnostic: &str) -> String {
    if diagnostic.is_empty() {
        String::new()
    } else {
        format!(": {diagnostic}")
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), "failed to remove partial archive: {e}");
    }
}

// A blocked read never sees the cancel flag, so a side thread kills the
// producer's process group, which closes the pipe.
fn spawn_cancel_watcher(ctx: ExecCtx, pgid: u32, done: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !done.load(Ordering::Relaxed) {
            if ctx.cancelled() {
                kill_pgroup(pgid, false);
                std::thread::sleep(WATCH_INTERVAL);
                kill_pgroup(pgid, true);
                return;
            }
            std::thread::sleep(WATCH_INTERVAL);
        }
    })
}

fn read_tail_thread<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut tail = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }
        tail
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_line_quotes_every_pattern() {
        let line = tar_command(&["/proc/*".to_string(), "/swapfile".to_string()]);
        assert_eq!(
            line,
            "cd / && tar czpf - --numeric-owner --anchored --exclude='./proc/*' --exclude='./swapfile' ."
        );
        assert_eq!(member_pattern("./srv/*"), "./srv/*");
        assert_eq!(member_pattern("srv/*"), "./srv/*");
    }

    fn gnu_tar() -> bool {
        std::process::Command::new("tar")
            .arg("--version")
            .output()
            .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).contains("GNU tar"))
    }

    #[test]
    fn default_exclusions_drop_pseudo_filesystems_from_the_archive() {
        if !gnu_tar() {
            eprintln!("skipping: GNU tar not available");
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        for (rel, body) in [
            ("proc/1/status", "Name: init"),
            ("sys/kernel/uevent", "x"),
            ("tmp/junk", "x"),
            ("var/cache/apt/archives/pkg.deb", "x"),
            ("swapfile", "x"),
            ("etc/hostname", "web1"),
            ("srv/keep/tmp/data", "x"),
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(&path, body).expect("write");
        }

        let line = tar_command(&exclusion_set(&[], &CaptureConfig::default()));
        let line = line.replacen("cd /", &format!("cd {}", sh_quote(&root.display().to_string())), 1);
        let out = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{line} | tar tzf -"))
            .output()
            .expect("run tar");
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let listing = String::from_utf8_lossy(&out.stdout);
        let members: Vec<&str> = listing.lines().collect();

        assert!(members.contains(&"./etc/hostname"), "{members:?}");
        assert!(members.contains(&"./srv/keep/tmp/data"), "{members:?}");
        assert!(members.contains(&"./proc/"), "{members:?}");
        for gone in [
            "./proc/1/status",
            "./sys/kernel/uevent",
            "./tmp/junk",
            "./var/cache/apt/archives/pkg.deb",
            "./swapfile",
        ] {
            assert!(!members.contains(&gone), "{gone} archived: {members:?}");
        }
    }

    #[test]
    fn exclusion_set_merges_in_order() {
        let cfg = CaptureConfig {
            extra_excludes: vec!["/srv/cache/*".into(), "/proc/*".into(), " ".into()],
            ..CaptureConfig::default()
        };
        let set = exclusion_set(&["/boot/*"], &cfg);
        assert_eq!(set[0], "/proc/*");
        assert_eq!(set.len(), BASE_EXCLUDES.len() + 2);
        assert_eq!(set[BASE_EXCLUDES.len()], "/boot/*");
        assert_eq!(set.last().map(String::as_str), Some("/srv/cache/*"));
    }
}
