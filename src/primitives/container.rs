//! `container`: run a one-off container through the docker CLI.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

use super::{optional_str, process, require_str, string_list, string_map, Primitive, StepContext};

/// Runs `docker run --rm` for `input.image`.
///
/// Input: `image`, optional `cmd` (string or list), `entrypoint`, `env`
/// map and `workdir`. Output is the same shape as `exec` plus `image`.
pub struct Container {
    docker_binary: String,
}

impl Container {
    pub fn new(docker_binary: impl Into<String>) -> Self {
        Self {
            docker_binary: docker_binary.into(),
        }
    }

    /// Arguments after the docker binary
    pub fn docker_args(&self, ctx: &StepContext, input: &Value) -> Result<Vec<String>> {
        let image = require_str(input, "image", "container")?;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--label".to_string(),
            format!("pipeflow.step_execution_id={}", ctx.step_execution_id),
        ];

        for (key, value) in string_map(input, "env", "container")? {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(workdir) = optional_str(input, "workdir") {
            args.push("-w".to_string());
            args.push(workdir.to_string());
        }
        if let Some(entrypoint) = optional_str(input, "entrypoint") {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.to_string());
        }

        args.push(image.to_string());
        args.extend(string_list(input, "cmd", "container")?);
        Ok(args)
    }
}

#[async_trait]
impl Primitive for Container {
    fn name(&self) -> &str {
        "container"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        require_str(input, "image", "container")?;
        string_map(input, "env", "container")?;
        string_list(input, "cmd", "container")?;
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let args = self.docker_args(ctx, input)?;
        debug!(step = %ctx.step_name, args = ?args, "Running container");

        let mut command = Command::new(&self.docker_binary);
        command.args(&args);

        let output = process::run(command, None, "container", &ctx.cancel).await?;
        output.check("Container")?;

        let mut result = output.to_json();
        if let Value::Object(map) = &mut result {
            map.insert(
                "image".to_string(),
                Value::String(require_str(input, "image", "container")?.to_string()),
            );
        }
        Ok(result)
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new("docker")
    }
}
