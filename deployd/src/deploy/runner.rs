//! Process runner: executes one shell command inside a workspace
//!
//! Standard output and standard error are read concurrently and forwarded
//! line by line to a sink as soon as each line is flushed. Every child runs in
//! its own process group so a timeout or a cancellation kills the whole tree.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Receives each output line of a running command
pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// How long to keep reading output after the main process exited
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Longest line forwarded as-is; longer lines are cut
const MAX_LINE_BYTES: usize = 16 * 1024;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Shell used to interpret commands (`<shell> -c <command>`)
    pub shell: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

/// A command to run inside a workspace
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    /// Stage name, used in errors
    pub stage: &'a str,
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a [(String, String)],
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns and supervises commands
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    options: RunnerOptions,
}

struct Spawned {
    child: Child,
    lines: mpsc::Receiver<String>,
    pgid: Option<u32>,
    started: Instant,
}

impl ProcessRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    fn spawn(&self, spec: &CommandSpec<'_>) -> Result<Spawned, EngineError> {
        let mut cmd = Command::new(&self.options.shell);
        cmd.arg("-c")
            .arg(spec.command)
            .current_dir(spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::SpawnError(format!("{} ({}): {}", spec.command, spec.stage, e))
        })?;
        let pgid = child.id();
        debug!("Spawned {:?} for {} (pid {:?})", spec.command, spec.stage, pgid);

        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Spawned {
            child,
            lines,
            pgid,
            started: Instant::now(),
        })
    }

    /// Run a command to completion
    ///
    /// A non-zero exit is still `Ok`; the caller decides what it means.
    /// Fails with `TimeoutError` when `timeout` elapses and `CancelledError`
    /// when `cancel` fires; in both cases the process tree is killed first.
    pub async fn run(
        &self,
        spec: &CommandSpec<'_>,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<ExitOutcome, EngineError> {
        let Spawned {
            mut child,
            mut lines,
            pgid,
            started,
        } = self.spawn(spec)?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut lines_open = true;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill_tree(&mut child, pgid).await;
                    return Err(EngineError::CancelledError);
                }
                _ = &mut deadline => {
                    warn!("{} timed out after {:?}, killing process group {:?}", spec.stage, timeout, pgid);
                    kill_tree(&mut child, pgid).await;
                    return Err(EngineError::TimeoutError {
                        stage: spec.stage.to_string(),
                        limit: timeout,
                    });
                }
                line = lines.recv(), if lines_open => match line {
                    Some(line) => sink(line),
                    None => lines_open = false,
                },
                status = child.wait() => break status?,
            }
        };

        if lines_open && !drain(&mut lines, sink).await {
            kill_group(pgid);
        }

        Ok(ExitOutcome {
            exit_code: status.code(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Start a long-lived command
    ///
    /// Returns once the process is confirmed alive: it printed a line, or it
    /// is still running after `grace`. Exiting before that is `ProcessExited`.
    pub async fn start(
        &self,
        spec: &CommandSpec<'_>,
        grace: Duration,
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<RunningService, EngineError> {
        let Spawned {
            mut child,
            mut lines,
            pgid,
            started,
        } = self.spawn(spec)?;

        let grace_timer = tokio::time::sleep(grace);
        tokio::pin!(grace_timer);
        let mut lines_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill_tree(&mut child, pgid).await;
                    return Err(EngineError::CancelledError);
                }
                status = child.wait() => {
                    let status = status?;
                    if lines_open && !drain(&mut lines, sink).await {
                        kill_group(pgid);
                    }
                    return Err(EngineError::ProcessExited { code: status.code() });
                }
                line = lines.recv(), if lines_open => match line {
                    Some(line) => {
                        sink(line);
                        break;
                    }
                    None => lines_open = false,
                },
                _ = &mut grace_timer => break,
            }
        }

        debug!("{} confirmed alive (pid {:?})", spec.stage, pgid);
        Ok(RunningService {
            child,
            lines: lines_open.then_some(lines),
            pgid,
            started,
        })
    }
}

/// A long-lived process that passed its startup check
pub struct RunningService {
    child: Child,
    lines: Option<mpsc::Receiver<String>>,
    pgid: Option<u32>,
    started: Instant,
}

impl RunningService {
    pub fn pid(&self) -> Option<u32> {
        self.pgid
    }

    /// Forward output until the process dies or `cancel` fires
    ///
    /// A service never ends successfully: the result is `ProcessExited` or
    /// `CancelledError`.
    pub async fn supervise(mut self, cancel: &CancellationToken, sink: &LineSink) -> EngineError {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill_tree(&mut self.child, self.pgid).await;
                    return EngineError::CancelledError;
                }
                line = recv_line(&mut self.lines) => match line {
                    Some(line) => sink(line),
                    None => self.lines = None,
                },
                status = self.child.wait() => {
                    if let Some(lines) = self.lines.as_mut() {
                        if !drain(lines, sink).await {
                            kill_group(self.pgid);
                        }
                    }
                    debug!(
                        "Service (pid {:?}) exited after {:?}",
                        self.pgid,
                        self.started.elapsed()
                    );
                    return match status {
                        Ok(status) => EngineError::ProcessExited { code: status.code() },
                        Err(e) => EngineError::IoError(e),
                    };
                }
            }
        }
    }
}

async fn recv_line(lines: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match lines {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                buf.truncate(MAX_LINE_BYTES);
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output reader stopped: {}", e);
                break;
            }
        }
    }
}

/// Forward the output left after the main process exited
///
/// Returns `false` when the pipes are still open after [`DRAIN_GRACE`],
/// meaning some descendant still holds them.
async fn drain(lines: &mut mpsc::Receiver<String>, sink: &LineSink) -> bool {
    tokio::time::timeout(DRAIN_GRACE, async {
        while let Some(line) = lines.recv().await {
            sink(line);
        }
    })
    .await
    .is_ok()
}

/// Kill every process left in the group
///
/// After the leader was reaped this is only safe while another member keeps
/// the group alive, otherwise its id may already belong to a new group.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        // ESRCH just means the group is already gone
        unsafe {
            libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

async fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    kill_group(pgid);
    if let Err(e) = child.kill().await {
        debug!("Kill after group kill: {}", e);
    }
}
