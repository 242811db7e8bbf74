//! `sleep`: wait for a duration.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{OrchestratorError, Result};

use super::{Primitive, StepContext};

/// Waits for `input.duration`: milliseconds as a number, or a string with
/// an `ms`, `s`, `m` or `h` suffix. Cancellation cuts the wait short.
pub struct Sleep;

/// Parse a duration like `250`, `"250ms"`, `"5s"`, `"2m"` or `"1h"`
pub fn parse_duration(value: &Value) -> Result<Duration> {
    let invalid = || {
        OrchestratorError::bad_request(format!(
            "sleep duration must be milliseconds or a string like \"5s\", got {}",
            value
        ))
    };

    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_millis).ok_or_else(invalid),
        Value::String(s) => {
            let s = s.trim();
            let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
            let (amount, unit) = s.split_at(split);
            let amount: u64 = amount.parse().map_err(|_| invalid())?;
            let seconds = |per_unit: u64| {
                amount.checked_mul(per_unit).map(Duration::from_secs).ok_or_else(|| {
                    OrchestratorError::bad_request(format!("sleep duration {} is too large", s))
                })
            };
            match unit.trim() {
                "" | "ms" => Ok(Duration::from_millis(amount)),
                "s" => Ok(Duration::from_secs(amount)),
                "m" => seconds(60),
                "h" => seconds(3600),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

#[async_trait]
impl Primitive for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        let duration = input
            .get("duration")
            .ok_or_else(|| OrchestratorError::bad_request("sleep input must define 'duration'"))?;
        parse_duration(duration)?;
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let duration = parse_duration(input.get("duration").unwrap_or(&Value::Null))?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.cancel.cancelled() => {
                return Err(OrchestratorError::primitive("Sleep canceled"));
            }
        }

        Ok(json!({ "duration_ms": duration.as_millis() as u64 }))
    }
}
