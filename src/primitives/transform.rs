//! `transform`: reshape data without side effects.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{OrchestratorError, Result};

use super::{Primitive, StepContext};

/// Echoes `input.value` back as `{"value": ...}`. Combined with input
/// templates this reshapes args and step outputs for later steps.
pub struct Transform;

#[async_trait]
impl Primitive for Transform {
    fn name(&self) -> &str {
        "transform"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        if input.get("value").is_none() {
            return Err(OrchestratorError::bad_request(
                "transform input must define 'value'",
            ));
        }
        Ok(())
    }

    async fn run(&self, _ctx: &StepContext, input: &Value) -> Result<Value> {
        self.validate_input(input)?;
        Ok(json!({ "value": input["value"] }))
    }
}
