//! Guard backed by a shell test command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ao_core::{GuardPhase, TddGuardResult};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::guard::TddGuard;
use crate::test_command::{resolve_test_command, ResolvedTestCommand};

/// Captured output is cut to its last this-many bytes.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Result of one test command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the command could not run or timed out
    pub exit_code: Option<i32>,

    /// Combined stdout and stderr
    pub output: String,
}

/// Runs the project's test command with `sh -c` inside the workspace.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    workspace: PathBuf,
    command: String,
    timeout: Duration,
}

impl CommandGuard {
    /// Guard running `command` in `workspace`.
    pub fn new(workspace: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            command: command.into(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Guard using the resolved test command for `workspace`.
    pub fn for_workspace(workspace: impl Into<PathBuf>, project_test_cmd: Option<&str>) -> Self {
        let workspace = workspace.into();
        let ResolvedTestCommand { command, source } =
            resolve_test_command(project_test_cmd, &workspace);
        debug!("Test command from {:?}: {}", source, command);
        Self::new(workspace, command)
    }

    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command this guard runs.
    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run(&self, phase: GuardPhase) -> TddGuardResult {
        let CommandOutput { exit_code, output } =
            run_test_command(&self.command, &self.workspace, self.timeout).await;

        let passed = match (phase, exit_code) {
            (_, None) => false,
            (GuardPhase::Red, Some(code)) => code != 0,
            (GuardPhase::Green, Some(code)) => code == 0,
        };

        debug!("{} guard: exit {:?}, passed {}", phase, exit_code, passed);

        TddGuardResult {
            phase,
            passed,
            test_exit: exit_code.unwrap_or(-1),
            output,
        }
    }
}

#[async_trait]
impl TddGuard for CommandGuard {
    async fn assert_red(&self) -> TddGuardResult {
        self.run(GuardPhase::Red).await
    }

    async fn assert_green(&self) -> TddGuardResult {
        self.run(GuardPhase::Green).await
    }
}

/// Run a shell command with a timeout, capturing output.
pub async fn run_test_command(command: &str, dir: &Path, timeout: Duration) -> CommandOutput {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutput {
                exit_code: output.status.code(),
                output: tail(combined, MAX_OUTPUT_BYTES),
            }
        }
        Ok(Err(e)) => {
            warn!("Failed to run test command `{}`: {}", command, e);
            CommandOutput {
                exit_code: None,
                output: format!("Process error: {e}"),
            }
        }
        Err(_) => {
            warn!("Test command `{}` timed out after {:?}", command, timeout);
            CommandOutput {
                exit_code: None,
                output: format!("Timeout after {}s", timeout.as_secs()),
            }
        }
    }
}

fn tail(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = s.len() - max;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
    s
}
