//! Type-Safe External Command Execution
//!
//! Every call to `zfs`, `docker` and `borg` goes through [`run_tool`] so that:
//!
//! - the child runs in its own process group with a parent-death signal
//! - its PID is registered for cleanup on shutdown
//! - arguments come from a typed [`ToolInvocation`] rather than ad-hoc
//!   string vectors
//! - a per-call timeout is enforced, and expiry is reported as that call's
//!   failure (`ToolError::TimedOut`)
//!
//! Adapters depend on the [`CommandRunner`] trait instead of calling
//! `run_tool` directly, which lets unit tests script tool behaviour.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process_guard::{ChildRegistry, CommandProcessGroup, terminate_group};

/// Grace period between SIGTERM and SIGKILL for a timed-out child
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Poll interval while waiting on a child with a deadline
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Typed argument contract for one external command.
///
/// Implementors map struct fields to the exact flags the tool expects, so a
/// flag typo is a compile error in one place instead of a runtime failure.
pub trait ToolInvocation {
    /// Executable name, resolved through `PATH`
    fn program(&self) -> &'static str;

    /// Arguments exactly as the tool expects them
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables. Values are never logged.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Working directory for the child, if it matters
    fn working_dir(&self) -> Option<&Path> {
        None
    }

    /// `program arg1 arg2 ...`, for logs and error messages
    fn render(&self) -> String {
        let mut rendered = self.program().to_string();
        for arg in self.to_cli_args() {
            rendered.push(' ');
            rendered.push_str(&arg);
        }
        rendered
    }
}

/// Failure of a single external command
#[derive(Error, Debug)]
pub enum ToolError {
    /// The executable could not be started
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command exited non-zero (or was killed by a signal: code -1)
    #[error("'{command}' failed (exit code {code}): {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The command exceeded its deadline and was terminated
    #[error("'{command}' timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    /// The command succeeded but its output was not understood
    #[error("could not parse output of '{command}': {reason}")]
    Parse { command: String, reason: String },
}

impl ToolError {
    /// Exit code for `Failed`, `None` otherwise
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Create a parse error
    pub fn parse(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Output from an external command.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Rendered command line
    pub command: String,
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully (exit code 0).
    pub success: bool,
}

impl ToolOutput {
    /// Build a successful output, mostly for tests
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Build a failed output, mostly for tests
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
            ..Self::default()
        }
    }

    /// Turn a non-zero exit into `ToolError::Failed`
    pub fn ensure_success(&self) -> Result<(), ToolError> {
        if self.success {
            Ok(())
        } else {
            Err(ToolError::Failed {
                command: self.command.clone(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Seam between adapters and process spawning
pub trait CommandRunner: Send + Sync {
    /// Run one command. Non-zero exits are returned as `Ok` with
    /// `success == false`; spawn failures and timeouts are `Err`.
    fn run(
        &self,
        invocation: &dyn ToolInvocation,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError>;
}

/// Runs commands for real through [`run_tool`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        invocation: &dyn ToolInvocation,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        run_tool(invocation, timeout)
    }
}

/// Execute an external command with typed arguments.
///
/// # Death Pact Compliance
///
/// - Spawns the tool in a new process group via `.in_new_process_group()`
/// - Registers the child PID with `ChildRegistry::global()`
/// - On timeout, signals the whole group so helpers (ssh for borg) die too
pub fn run_tool(
    invocation: &dyn ToolInvocation,
    timeout: Option<Duration>,
) -> Result<ToolOutput, ToolError> {
    let program = invocation.program();
    let rendered = invocation.render();
    let env_vars = invocation.get_env_vars();
    let env_keys: Vec<&str> = env_vars.iter().map(|(k, _)| k.as_str()).collect();

    info!(command = %rendered, env = ?env_keys, timeout_secs = timeout.map(|t| t.as_secs()), "running external command");

    let mut cmd = Command::new(program);
    cmd.args(invocation.to_cli_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    if let Some(dir) = invocation.working_dir() {
        cmd.current_dir(dir);
    }
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let waited = wait_with_deadline(&mut child, pid, timeout);

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let status = match waited {
        Ok(Some(status)) => status,
        Ok(None) => {
            let timeout = timeout.unwrap_or_default();
            warn!(command = %rendered, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(ToolError::TimedOut {
                command: rendered,
                timeout,
            });
        }
        Err(source) => {
            return Err(ToolError::Spawn {
                program: program.to_string(),
                source,
            });
        }
    };

    let exit_code = status.code();
    let success = status.success();
    if success {
        debug!(command = %rendered, elapsed_ms = started.elapsed().as_millis() as u64, "command succeeded");
    } else {
        info!(command = %rendered, exit_code = exit_code.unwrap_or(-1), stderr = %stderr.trim(), "command failed");
    }

    Ok(ToolOutput {
        command: rendered,
        stdout,
        stderr,
        exit_code,
        success,
    })
}

/// Wait for the child. `Ok(None)` means the deadline passed and the child
/// group was terminated and reaped.
fn wait_with_deadline(
    child: &mut Child,
    pid: u32,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            terminate_group(pid, KILL_GRACE, || matches!(child.try_wait(), Ok(Some(_))));
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
