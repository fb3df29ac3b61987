//! Out-of-process execution with a hard deadline.
//!
//! Callers get a structured [`ProcessOutput`] instead of exceptions: a
//! spawn failure is an `io::Error`, everything after spawn (exit code,
//! captured streams, timeout) is data.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What happened after the process was spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when killed by a signal or on timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs external programs. Mocked in tests.
pub trait ProcessRunner: Send + Sync {
    /// Run to completion or until `spec.timeout` elapses. On timeout the
    /// child is killed and `timed_out` is set. Spawn failures (including a
    /// missing program) are returned as `Err`.
    fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutput>;
}

/// Production runner: a current-thread tokio runtime per call, with
/// `tokio::time::timeout` around the child's wait.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutput> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run_with_deadline(spec))
    }
}

async fn run_with_deadline(spec: &ProcessSpec) -> io::Result<ProcessOutput> {
    let mut child = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let waited = tokio::time::timeout(spec.timeout, async {
        let (status, out, err) = tokio::join!(child.wait(), drain(stdout), drain(stderr));
        status.map(|s| (s, out, err))
    })
    .await;

    match waited {
        Ok(result) => {
            let (status, stdout, stderr) = result?;
            debug!(
                program = %spec.program.display(),
                code = ?status.code(),
                "Child process exited"
            );
            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                timed_out: false,
            })
        }
        Err(_) => {
            warn!(
                program = %spec.program.display(),
                timeout_secs = spec.timeout.as_secs_f64(),
                "Child process timed out, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed-out child");
            }
            Ok(ProcessOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            })
        }
    }
}

/// Read a captured stream to the end. Read errors yield what was read so far.
async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ═══════════════════════════════════════════════════════════
// Test double
// ═══════════════════════════════════════════════════════════
