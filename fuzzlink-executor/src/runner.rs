//! Running one program in a worker slot.
//!
//! How a program is encoded and executed is not the protocol's business;
//! the executor only sees the [`ProgramRunner`] seam. [`ProcessRunner`]
//! is the stock implementation: it starts a child process per program.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use fuzzlink_core::{CallInfo, ExecRequest};

/// Why a run produced no feedback.
#[derive(Debug, Error)]
pub enum RunError {
    /// The worker died; a relaunched worker may succeed.
    #[error("worker crashed: {0}")]
    Crashed(String),

    /// The program itself failed; running it again will not help.
    #[error("program failed: {0}")]
    Failed(String),

    #[error("program timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Crashed(_))
    }

    /// The worker process cannot be reused after this error.
    pub fn poisons_worker(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Timeout(_))
    }
}

/// Everything a runner needs to know about one attempt.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub slot: usize,
    pub proc_id: u64,
    pub attempt: u32,
    pub request: ExecRequest,
    /// Leak checking is enabled once the corpus is triaged.
    pub leak_check: bool,
}

/// Feedback for one call, or for no call in particular.
#[derive(Debug, Clone)]
pub struct CallReport {
    pub call: Option<usize>,
    pub info: CallInfo,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Number of calls in the program.
    pub ncalls: usize,
    pub reports: Vec<CallReport>,
    pub output: Vec<u8>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait ProgramRunner: Send + Sync {
    async fn run(&self, job: RunJob) -> Result<RunOutput, RunError>;
}

/// Runs each program as a child process.
///
/// Binary payloads are written to a temporary executable. Other payloads
/// are piped to the configured interpreter on stdin.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    interpreter: Option<String>,
}

impl ProcessRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        let interpreter = interpreter.into();
        Self {
            interpreter: (!interpreter.is_empty()).then_some(interpreter),
        }
    }

    fn command(&self, program: Option<&std::path::Path>) -> Result<Command, RunError> {
        let cmd = match (&self.interpreter, program) {
            (Some(interp), Some(path)) => {
                let mut cmd = Command::new(interp);
                cmd.arg(path);
                cmd
            }
            (Some(interp), None) => Command::new(interp),
            (None, Some(path)) => Command::new(path),
            (None, None) => {
                return Err(RunError::Failed(
                    "no interpreter configured for serialized programs".into(),
                ));
            }
        };
        Ok(cmd)
    }
}

#[async_trait]
impl ProgramRunner for ProcessRunner {
    async fn run(&self, job: RunJob) -> Result<RunOutput, RunError> {
        let request = &job.request;
        // Held until the child exits.
        let binary = if request.is_binary() {
            Some(write_executable(&request.prog_data)?)
        } else {
            None
        };

        let mut cmd = self.command(binary.as_deref())?;
        cmd.env("FUZZLINK_PROC_ID", job.proc_id.to_string())
            .env("FUZZLINK_ATTEMPT", job.attempt.to_string())
            .env("FUZZLINK_SANDBOX_ARG", request.exec_opts.sandbox_arg.to_string())
            .env("FUZZLINK_LEAK_CHECK", if job.leak_check { "1" } else { "0" })
            .stdin(if binary.is_some() { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn()?;
        // Fed from its own task so a child that writes before it reads
        // cannot fill its output pipe while we block on its input.
        let feeder = child.stdin.take().map(|mut stdin| {
            let payload = request.prog_data.clone();
            tokio::spawn(async move { stdin.write_all(&payload).await })
        });
        let out = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                // The child is done; whatever it did not read is moot.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(id = request.id, "program exited before reading all input");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(RunError::Io(std::io::Error::other(e))),
            }
        }
        let elapsed = start.elapsed();
        debug!(id = request.id, slot = job.slot, status = %out.status, ?elapsed, "program exited");

        if let Some(signal) = killed_by(&out.status) {
            return Err(RunError::Crashed(format!("killed by signal {signal}")));
        }
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(RunError::Failed(format!(
                "{}: {}",
                out.status,
                stderr.trim()
            )));
        }

        let mut output = Vec::new();
        if request.returns_output() {
            output = out.stdout;
            output.extend_from_slice(&out.stderr);
        }
        Ok(RunOutput {
            ncalls: 0,
            reports: Vec::new(),
            output,
            elapsed,
        })
    }
}

fn write_executable(data: &[u8]) -> Result<tempfile::TempPath, RunError> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("fuzzlink-prog-")
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))?;
    }
    // Closing the handle first avoids ETXTBSY on exec.
    Ok(file.into_temp_path())
}

#[cfg(unix)]
fn killed_by(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn killed_by(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
