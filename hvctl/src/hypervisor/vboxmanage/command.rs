//! `VBoxManage` invocation.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hvctl_shared::{HvctlError, HvctlResult};

use crate::hypervisor::Progress;

/// Environment variable overriding the `VBoxManage` program path.
pub const VBOXMANAGE_ENV: &str = "HVCTL_VBOXMANAGE";

const DEFAULT_PROGRAM: &str = "VBoxManage";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `VBoxManage` subcommands.
#[derive(Debug, Clone)]
pub(crate) struct VBoxManage {
    program: PathBuf,
}

impl VBoxManage {
    pub(crate) fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use `$HVCTL_VBOXMANAGE` if set, otherwise `VBoxManage` from `PATH`.
    pub(crate) fn from_env() -> Self {
        match std::env::var_os(VBOXMANAGE_ENV) {
            Some(program) if !program.is_empty() => Self::new(program),
            _ => Self::new(DEFAULT_PROGRAM),
        }
    }

    pub(crate) fn program(&self) -> &Path {
        &self.program
    }

    /// Run a subcommand to completion and return its stdout.
    pub(crate) fn run<I, S>(&self, args: I) -> HvctlResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        let command_line = describe(&cmd);
        tracing::debug!(command = %command_line, "Running VBoxManage");

        cmd.stdin(Stdio::null());
        let output = cmd.output().map_err(|e| self.spawn_error(&command_line, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HvctlError::Hypervisor(failure_message(
                &command_line,
                output.status,
                &stderr,
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Start a subcommand without waiting for it. The returned progress completes
    /// when the process exits.
    pub(crate) fn spawn<I, S>(&self, description: &str, args: I) -> HvctlResult<Box<dyn Progress>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        let command_line = describe(&cmd);
        tracing::debug!(command = %command_line, "Spawning VBoxManage");

        // Only stderr is read back. It is drained on a thread so the child never
        // blocks on a full pipe while being polled.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&command_line, e))?;
        let stderr = child.stderr.take().map(drain_stderr);

        Ok(Box::new(ChildProgress {
            description: description.to_string(),
            command: command_line,
            child: Some(child),
            stderr,
            outcome: None,
        }))
    }

    fn spawn_error(&self, command: &str, e: std::io::Error) -> HvctlError {
        if e.kind() == std::io::ErrorKind::NotFound {
            HvctlError::Unsupported(format!(
                "VBoxManage not found at '{}' (set {} to override)",
                self.program.display(),
                VBOXMANAGE_ENV
            ))
        } else {
            let msg = format!("Failed to spawn `{}`: {}", command, e);
            tracing::error!("{}", msg);
            HvctlError::Hypervisor(msg)
        }
    }
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn drain_stderr(mut pipe: ChildStderr) -> JoinHandle<std::io::Result<String>> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        pipe.read_to_string(&mut buf)?;
        Ok(buf)
    })
}

fn failure_message(command: &str, status: ExitStatus, stderr: &str) -> String {
    // VBoxManage prefixes every diagnostic with "VBoxManage: error: ".
    let detail: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim_start_matches("VBoxManage: error: ").trim())
        .filter(|l| !l.is_empty())
        .collect();
    if detail.is_empty() {
        format!("`{}` exited with {}", command, status)
    } else {
        format!("`{}` failed: {}", command, detail.join("; "))
    }
}

/// Progress backed by a running `VBoxManage` child process.
struct ChildProgress {
    description: String,
    command: String,
    child: Option<Child>,
    stderr: Option<JoinHandle<std::io::Result<String>>>,
    /// Error message of a finished operation, `Some(None)` once it succeeded.
    outcome: Option<Option<String>>,
}

impl ChildProgress {
    fn finish(&mut self, status: ExitStatus) {
        let stderr = match self.stderr.take().map(JoinHandle::join) {
            Some(Ok(Ok(text))) => text,
            Some(Ok(Err(e))) => {
                tracing::warn!(command = %self.command, error = %e, "Failed to read stderr");
                String::new()
            }
            Some(Err(_)) => {
                tracing::warn!(command = %self.command, "stderr reader panicked");
                String::new()
            }
            None => String::new(),
        };
        self.outcome = Some(if status.success() {
            None
        } else {
            Some(failure_message(&self.command, status, &stderr))
        });
    }

    fn result(&self) -> HvctlResult<()> {
        match &self.outcome {
            Some(None) => Ok(()),
            Some(Some(message)) => Err(HvctlError::Hypervisor(format!(
                "{}: {}",
                self.description, message
            ))),
            None => Err(HvctlError::Internal(format!(
                "{} has not completed",
                self.description
            ))),
        }
    }
}

impl Progress for ChildProgress {
    fn description(&self) -> &str {
        &self.description
    }

    fn wait_for_completion(&mut self, timeout: Option<Duration>) -> HvctlResult<()> {
        let Some(mut child) = self.child.take() else {
            return self.result();
        };

        let status = match timeout {
            None => child.wait()?,
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        self.child = Some(child);
                        return Err(HvctlError::Timeout(format!(
                            "{} did not complete within {:?}",
                            self.description, limit
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        tracing::trace!(command = %self.command, %status, "VBoxManage exited");
        self.finish(status);
        self.result()
    }
}
