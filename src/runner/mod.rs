//! Guarded process execution.
//!
//! [`ProcessRunner::run`] holds a concurrency slot for the whole life of the
//! child process, reads stdout/stderr incrementally while it runs, optionally
//! mirrors every chunk to a log file, and kills the child at its deadline.
//! The slot is an RAII permit: every return path, including spawn failure
//! and a dropped future, gives it back. On Unix the child leads its own
//! process group, and a deadline or a dropped future kills the whole group
//! so no descendant outlives the slot.

pub mod binary;
pub mod slots;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::policy::SecurityPolicy;

pub use binary::BinaryLocator;
pub use slots::{ConcurrencyGuard, SlotPermit};

/// Environment variable carrying the policy credential into the child.
pub const CREDENTIAL_ENV_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// How long to keep reading after the child is gone. Grandchildren may hold
/// the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Read buffer size per stream
const READ_CHUNK: usize = 8 * 1024;

/// Chunks buffered between the pumps and the collector
const CHANNEL_DEPTH: usize = 64;

/// Timeout used when a caller does not ask for one.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

/// A validated execution, ready to spawn.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub args: Vec<String>,
    /// `None` runs in the gateway's own working directory.
    pub cwd: Option<PathBuf>,
    /// Applied over the ambient environment and the injected credential.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// Append every output chunk to this file as it arrives.
    pub log_file: Option<PathBuf>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            log_file: None,
        }
    }
}

/// Result of one execution attempt that got as far as running the process.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed (deadline or signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub log_file: Option<PathBuf>,
}

impl ExecutionOutcome {
    /// True only for a normal exit with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        if self.timed_out {
            format!("timed out after {}ms", self.duration_ms)
        } else {
            format!(
                "exit {} after {}ms ({} bytes stdout, {} bytes stderr)",
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                self.duration_ms,
                self.stdout.len(),
                self.stderr.len()
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Output collected so far, plus the optional log mirror.
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    mirror: Option<File>,
    mirror_path: Option<PathBuf>,
}

impl Capture {
    async fn push(&mut self, stream: Stream, chunk: &[u8]) {
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(chunk),
            Stream::Stderr => self.stderr.extend_from_slice(chunk),
        }

        if let Some(file) = self.mirror.as_mut() {
            let written = match file.write_all(chunk).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(
                    "Log mirror write to {} failed, mirroring disabled: {e}",
                    self.mirror_path.as_deref().unwrap_or(Path::new("")).display()
                );
                self.mirror = None;
            }
        }
    }
}

async fn open_log(path: &Path) -> Result<File, GatewayError> {
    let to_err = |source| GatewayError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(to_err)
}

/// SIGKILLs a child's process group when dropped, unless disarmed.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(pid: Option<u32>) -> Self {
        let pgid = if cfg!(unix) {
            pid.and_then(|pid| i32::try_from(pid).ok()).filter(|pid| *pid > 0)
        } else {
            None
        };
        Self { pgid }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: kill(2) has no memory-safety preconditions
            if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!("Failed to kill process group {pgid}: {err}");
                }
            }
        }
    }

    /// Leaves the group alone once the child has finished on its own.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Forwards everything read from one pipe until EOF.
async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading child {stream:?}: {e}");
                break;
            }
        }
    }
}

/// Spawns the external command under the slot limit and the policy credential.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    locator: BinaryLocator,
    slots: ConcurrencyGuard,
}

impl ProcessRunner {
    pub fn new(locator: BinaryLocator, slots: ConcurrencyGuard) -> Self {
        Self { locator, slots }
    }

    pub fn slots(&self) -> &ConcurrencyGuard {
        &self.slots
    }

    /// Runs the external command once.
    ///
    /// Errors are infrastructure failures (no slot, spawn failure, wait
    /// failure, unusable log file). A non-zero exit or a deadline kill is
    /// reported through the returned [`ExecutionOutcome`].
    pub async fn run(
        &self,
        spec: RunSpec,
        policy: &SecurityPolicy,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let _permit = self.slots.try_acquire(policy.max_concurrent)?;

        let mirror = match &spec.log_file {
            Some(path) => Some(open_log(path).await?),
            None => None,
        };

        let binary = self.locator.resolve();
        let mut command = Command::new(&binary);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if let Some(token) = &policy.credential_token {
            command.env(CREDENTIAL_ENV_VAR, token.expose_secret());
        }
        command.envs(&spec.env);

        info!(
            "Running {binary} ({} args) in {}, timeout {}s",
            spec.args.len(),
            spec.cwd
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "gateway cwd".to_string()),
            spec.timeout.as_secs_f64()
        );

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            warn!("Failed to start {binary}: {source}");
            GatewayError::Spawn {
                binary: binary.clone(),
                source,
            }
        })?;
        let mut group = ProcessGroup::of(child.id());

        let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Stream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Stream::Stderr, tx.clone())));
        }
        drop(tx);

        let mut capture = Capture {
            stdout: Vec::new(),
            stderr: Vec::new(),
            mirror,
            mirror_path: spec.log_file.clone(),
        };

        let deadline = tokio::time::sleep(spec.timeout);
        tokio::pin!(deadline);

        let mut streams_open = true;
        // Some(code) once the child is gone; Some(None) when killed
        let mut exit: Option<Option<i32>> = None;
        let mut timed_out = false;

        while streams_open || exit.is_none() {
            tokio::select! {
                chunk = rx.recv(), if streams_open => match chunk {
                    Some((stream, bytes)) => capture.push(stream, &bytes).await,
                    None => streams_open = false,
                },
                status = child.wait(), if exit.is_none() => {
                    let status = status.map_err(|source| GatewayError::Wait {
                        binary: binary.clone(),
                        source,
                    })?;
                    debug!("{binary} exited: {status}");
                    group.disarm();
                    exit = Some(status.code());
                    deadline.as_mut().reset(Instant::now() + DRAIN_GRACE);
                }
                () = &mut deadline => {
                    if exit.is_some() {
                        warn!("Output of {binary} still open {DRAIN_GRACE:?} after exit, keeping partial output");
                        break;
                    }
                    warn!("{binary} exceeded its {}s timeout, killing", spec.timeout.as_secs_f64());
                    group.kill();
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {binary}: {e}");
                    }
                    timed_out = true;
                    exit = Some(None);
                    deadline.as_mut().reset(Instant::now() + DRAIN_GRACE);
                }
            }
        }

        for handle in pumps {
            handle.abort();
        }

        let outcome = ExecutionOutcome {
            stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
            exit_code: exit.flatten(),
            timed_out,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            log_file: spec.log_file,
        };
        info!("{binary} {}", outcome.summary());
        Ok(outcome)
    }
}
