//! Subprocess plumbing shared by `exec`, `email`, `container` and `function`.
//!
//! Children are killed when the future running them is dropped, so a step
//! timeout or a canceled step never leaves a process behind.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, -1 when killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output fields shared by process-backed primitives
    pub fn to_json(&self) -> Value {
        json!({
            "exit_code": self.exit_code,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "stdout_lines": self.stdout.lines().collect::<Vec<_>>(),
            "stderr_lines": self.stderr.lines().collect::<Vec<_>>(),
        })
    }

    /// `PrimitiveFailure` unless the process exited cleanly
    pub fn check(&self, what: &str) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        Err(OrchestratorError::primitive(format!(
            "{} failed with exit code {}: {}",
            what,
            self.exit_code,
            self.stderr.trim()
        )))
    }
}

/// Spawn `command`, feed it `stdin`, and collect its output
pub async fn run(
    mut command: Command,
    stdin: Option<&[u8]>,
    what: &str,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| OrchestratorError::primitive(format!("Failed to spawn {}: {}", what, e)))?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await.map_err(|e| {
            OrchestratorError::primitive(format!("Failed to write to {} stdin: {}", what, e))
        })?;
        // Drop stdin to signal EOF
    }

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| {
            OrchestratorError::primitive(format!("Failed to wait for {}: {}", what, e))
        })?,
        _ = cancel.cancelled() => {
            return Err(OrchestratorError::primitive(format!("{} canceled", what)));
        }
    };

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
