//! `exec`: run a shell command.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;

use super::{process, require_str, string_map, optional_str, Primitive, StepContext};

/// Runs `input.command` with `<shell> -c`.
///
/// Input: `command`, optional `env` map and working directory `dir`.
/// Output: `exit_code`, `stdout`, `stderr` and their line splits. A
/// non-zero exit is a primitive failure.
pub struct Exec {
    shell: String,
}

impl Exec {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for Exec {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl Primitive for Exec {
    fn name(&self) -> &str {
        "exec"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        require_str(input, "command", "exec")?;
        string_map(input, "env", "exec")?;
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let command_line = require_str(input, "command", "exec")?;
        debug!(step = %ctx.step_name, command = %command_line, "Running command");

        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(command_line);
        for (key, value) in string_map(input, "env", "exec")? {
            command.env(key, value);
        }
        if let Some(dir) = optional_str(input, "dir") {
            command.current_dir(dir);
        }

        let output = process::run(command, None, "command", &ctx.cancel).await?;
        output.check("Command")?;
        Ok(output.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::primitives::test_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_exec_captures_lines() {
        let exec = Exec::default();
        let input = json!({ "command": "echo one; echo two; echo $GREETING", "env": { "GREETING": "hi" } });

        exec.validate_input(&input).unwrap();
        let output = exec.run(&test_context(), &input).await.unwrap();

        assert_eq!(output["exit_code"], json!(0));
        assert_eq!(output["stdout_lines"], json!(["one", "two", "hi"]));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let exec = Exec::default();
        let err = exec
            .run(&test_context(), &json!({ "command": "echo nope >&2; exit 2" }))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::PrimitiveFailure(_)));
        assert!(err.message().contains("nope"));
    }

    #[test]
    fn test_command_required() {
        let err = Exec::default().validate_input(&json!({})).unwrap_err();
        assert!(matches!(err, OrchestratorError::BadRequest(_)));
    }
}
