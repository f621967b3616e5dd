//! Worker process supervision: spawn, startup handshake, termination.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::{BridgeError, BridgeResult};
use crate::protocol::{classify_diagnostic, Message, STARTUP_LINE};

/// How long to collect stderr after a failed handshake.
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Lines of stderr quoted in a handshake error.
const STDERR_DETAIL_LINES: usize = 3;

/// Program and arguments used to launch a worker.
#[derive(Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

// Positional arguments include the database password.
impl fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCommand")
            .field("program", &self.program)
            .field("args", &format_args!("[{} hidden]", self.args.len()))
            .finish()
    }
}

/// A freshly spawned worker with its three streams.
pub(crate) struct WorkerProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: BufReader<ChildStderr>,
}

/// Spawn the worker and, unless it was asked to log, wait for it to confirm
/// startup.
pub(crate) async fn spawn_worker(
    command: &WorkerCommand,
    logs: bool,
    handshake_timeout: Duration,
) -> BridgeResult<WorkerProcess> {
    debug!(program = %command.program.display(), "Spawning worker");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::Startup(format!("{}: {}", command.program.display(), e)))?;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.start_kill();
        return Err(BridgeError::Startup(
            "worker stdio was not captured".to_string(),
        ));
    };

    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);

    // With logging on, the first stdout line may be any diagnostic; an early
    // failure then surfaces through the stderr monitor instead.
    if !logs {
        if let Err(err) = await_handshake(&mut stdout, handshake_timeout).await {
            let _ = child.start_kill();
            let detail = stderr_detail(&mut stderr).await;
            let _ = child.wait().await;
            return Err(match (err, detail) {
                (BridgeError::Handshake(msg), Some(detail)) => {
                    BridgeError::Handshake(format!("{}; worker said: {}", msg, detail))
                }
                (err, _) => err,
            });
        }
    }

    info!(pid = ?child.id(), "Worker started");
    Ok(WorkerProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Read exactly one line and require it to be the startup confirmation.
pub(crate) async fn await_handshake<R>(reader: &mut R, timeout: Duration) -> BridgeResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Err(_) => Err(BridgeError::Handshake(format!(
            "no startup confirmation within {}ms",
            timeout.as_millis()
        ))),
        Ok(Err(e)) => Err(BridgeError::Handshake(format!(
            "failed to read startup line: {}",
            e
        ))),
        Ok(Ok(0)) => Err(BridgeError::Handshake(
            "worker exited before confirming startup".to_string(),
        )),
        Ok(Ok(_)) if line.trim_end().starts_with(STARTUP_LINE) => Ok(()),
        Ok(Ok(_)) => Err(BridgeError::Handshake(format!(
            "unexpected startup line: {}",
            line.trim_end()
        ))),
    }
}

/// Collect the first few stderr lines of a worker that failed to start.
async fn stderr_detail<R>(stderr: &mut R) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buf = String::new();

    let read = async {
        while collected.len() < STDERR_DETAIL_LINES {
            buf.clear();
            match stderr.read_line(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    collected.push(match classify_diagnostic(line) {
                        Some(Message::InfoLog(text)) | Some(Message::ErrorLog { text, .. }) => text,
                        _ => line.to_string(),
                    });
                }
            }
        }
    };
    let _ = tokio::time::timeout(STDERR_GRACE, read).await;

    if collected.is_empty() {
        None
    } else {
        Some(collected.join(" | "))
    }
}

/// Owns the worker process (if any) and the background reader tasks.
pub(crate) struct Supervisor {
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Supervisor {
    pub fn new(child: Option<Child>) -> Self {
        Self {
            child: Mutex::new(child),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    /// Kill the worker and stop the reader tasks. Safe to call repeatedly
    /// and from inside one of the tracked tasks.
    pub fn terminate(&self) {
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Worker already exited");
            }
            // Dropping a killed child leaves reaping to the runtime.
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
