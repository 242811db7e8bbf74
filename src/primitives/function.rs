//! `function`: run a user script under a configured interpreter.
//!
//! The step's `event` is written to the script's stdin as JSON. Whatever
//! JSON the script prints (the whole of stdout, or failing that its last
//! line) becomes `result`.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

use super::{optional_str, process, require_str, string_map, Primitive, StepContext};

/// Interpreter-backed function primitive.
///
/// Input: `runtime` (a key of the configured interpreters), exactly one of
/// `source` (inline code) or `path` (script file), optional `event` and
/// `env`. Output: `result`, `exit_code`, `stdout`, `stderr` and line splits.
pub struct Function {
    interpreters: HashMap<String, String>,
}

enum Script {
    Path(PathBuf),
    Inline(String),
}

impl Function {
    pub fn new(interpreters: HashMap<String, String>) -> Self {
        Self { interpreters }
    }

    fn interpreter(&self, input: &Value) -> Result<&str> {
        let runtime = require_str(input, "runtime", "function")?;
        self.interpreters
            .get(runtime)
            .map(String::as_str)
            .ok_or_else(|| {
                let mut known: Vec<&str> = self.interpreters.keys().map(String::as_str).collect();
                known.sort_unstable();
                OrchestratorError::bad_request(format!(
                    "Unknown function runtime '{}' (available: {})",
                    runtime,
                    known.join(", ")
                ))
            })
    }

    fn script(input: &Value) -> Result<Script> {
        match (optional_str(input, "source"), optional_str(input, "path")) {
            (Some(source), None) => Ok(Script::Inline(source.to_string())),
            (None, Some(path)) => Ok(Script::Path(PathBuf::from(path))),
            _ => Err(OrchestratorError::bad_request(
                "function input must define exactly one of 'source' or 'path'",
            )),
        }
    }
}

/// JSON printed by a script: all of stdout, else its last non-empty line
pub fn parse_result(stdout: &str) -> Value {
    if let Ok(value) = serde_json::from_str(stdout.trim()) {
        return value;
    }
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
        .unwrap_or(Value::Null)
}

#[async_trait]
impl Primitive for Function {
    fn name(&self) -> &str {
        "function"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        self.interpreter(input)?;
        Self::script(input)?;
        string_map(input, "env", "function")?;
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let interpreter = self.interpreter(input)?;

        // The temp file must outlive the process
        let mut _inline: Option<NamedTempFile> = None;
        let script_path = match Self::script(input)? {
            Script::Path(path) => path,
            Script::Inline(source) => {
                let mut file = NamedTempFile::new().map_err(|e| {
                    OrchestratorError::internal(format!("Failed to create script file: {}", e))
                })?;
                file.write_all(source.as_bytes()).map_err(|e| {
                    OrchestratorError::internal(format!("Failed to write script file: {}", e))
                })?;
                let path = file.path().to_path_buf();
                _inline = Some(file);
                path
            }
        };
        debug!(step = %ctx.step_name, %interpreter, script = %script_path.display(), "Running function");

        let event = serde_json::to_vec(input.get("event").unwrap_or(&Value::Null))?;

        let mut command = Command::new(interpreter);
        command.arg(&script_path);
        for (key, value) in string_map(input, "env", "function")? {
            command.env(key, value);
        }

        let output = process::run(command, Some(&event), "function", &ctx.cancel).await?;
        output.check("Function")?;

        let mut result = output.to_json();
        if let Value::Object(map) = &mut result {
            map.insert("result".to_string(), parse_result(&output.stdout));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrimitiveSettings;
    use crate::primitives::test_context;
    use serde_json::json;

    fn function() -> Function {
        Function::new(PrimitiveSettings::default().interpreters)
    }

    #[test]
    fn test_parse_result() {
        assert_eq!(parse_result("{\"a\": 1}\n"), json!({ "a": 1 }));
        assert_eq!(parse_result("log line\n[1, 2]\n\n"), json!([1, 2]));
        assert_eq!(parse_result("just text"), Value::Null);
    }

    #[tokio::test]
    async fn test_inline_script_reads_event() {
        let output = function()
            .run(
                &test_context(),
                &json!({
                    "runtime": "sh",
                    "source": "read line; echo \"working\"; echo \"{\\\"got\\\": $line}\"",
                    "event": { "n": 3 }
                }),
            )
            .await
            .unwrap();

        assert_eq!(output["result"], json!({ "got": { "n": 3 } }));
        assert_eq!(output["stdout_lines"][0], json!("working"));
    }

    #[test]
    fn test_validate_input() {
        let f = function();
        assert!(f.validate_input(&json!({ "runtime": "sh", "source": "true" })).is_ok());
        assert!(f.validate_input(&json!({ "runtime": "cobol", "source": "x" })).is_err());
        assert!(f.validate_input(&json!({ "runtime": "sh" })).is_err());
        assert!(f
            .validate_input(&json!({ "runtime": "sh", "source": "x", "path": "/tmp/x" }))
            .is_err());
    }
}
