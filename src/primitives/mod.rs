//! Primitives: the units of actual work behind each step type.
//!
//! The orchestrator never looks inside a primitive. It picks one from the
//! [`PrimitiveRegistry`] by the step's `type`, hands it the resolved input
//! and turns the returned `Ok`/`Err` into a step finished or failed event.

pub mod container;
pub mod email;
pub mod exec;
pub mod function;
pub mod http;
pub mod process;
pub mod query;
pub mod sleep;
pub mod transform;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PrimitiveSettings;
use crate::error::{OrchestratorError, Result};

pub use container::Container;
pub use email::Email;
pub use exec::Exec;
pub use function::Function;
pub use http::Http;
pub use query::Query;
pub use sleep::Sleep;
pub use transform::Transform;

/// What a primitive knows about the step it is running
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub pipeline_execution_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_name: String,

    /// Attempt number, 1-based
    pub attempt: u32,

    /// Tripped when the pipeline is canceled
    pub cancel: CancellationToken,
}

/// A pluggable unit of work
#[async_trait]
pub trait Primitive: Send + Sync {
    /// Step type this primitive serves
    fn name(&self) -> &str;

    /// Check the resolved input before running; `BadRequest` when invalid
    fn validate_input(&self, input: &Value) -> Result<()>;

    /// Do the work. Business failures are `PrimitiveFailure`.
    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value>;
}

/// Step type name to primitive, built once at startup
#[derive(Clone, Default)]
pub struct PrimitiveRegistry {
    primitives: HashMap<String, Arc<dyn Primitive>>,
}

impl PrimitiveRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in primitive
    pub fn with_defaults(settings: &PrimitiveSettings) -> Result<Self> {
        Ok(Self::new()
            .with(Exec::new(settings.shell.clone()))
            .with(Http::new(settings.http_timeout_seconds)?)
            .with(Query)
            .with(Sleep)
            .with(Email::new(
                settings.sendmail_path.clone(),
                settings.email_from.clone(),
            ))
            .with(Container::new(settings.docker_binary.clone()))
            .with(Function::new(settings.interpreters.clone()))
            .with(Transform))
    }

    /// Add a primitive, replacing any registered under the same name
    pub fn with(mut self, primitive: impl Primitive + 'static) -> Self {
        self.register(Arc::new(primitive));
        self
    }

    pub fn register(&mut self, primitive: Arc<dyn Primitive>) {
        self.primitives.insert(primitive.name().to_string(), primitive);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Primitive>> {
        self.primitives
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("Unknown primitive '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.primitives.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.primitives.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PrimitiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveRegistry")
            .field("primitives", &self.names())
            .finish()
    }
}

/// The input as a JSON object
pub fn input_object<'a>(input: &'a Value, primitive: &str) -> Result<&'a Map<String, Value>> {
    input.as_object().ok_or_else(|| {
        OrchestratorError::bad_request(format!("{} input must be a map", primitive))
    })
}

/// A required string field
pub fn require_str<'a>(input: &'a Value, field: &str, primitive: &str) -> Result<&'a str> {
    match input.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(OrchestratorError::bad_request(format!(
            "{} input field '{}' must be a non-empty string",
            primitive, field
        ))),
        None => Err(OrchestratorError::bad_request(format!(
            "{} input must define '{}'",
            primitive, field
        ))),
    }
}

/// An optional string field
pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

/// An optional map of string values (env vars, headers)
pub fn string_map(input: &Value, field: &str, primitive: &str) -> Result<Vec<(String, String)>> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()),
        Some(_) => Err(OrchestratorError::bad_request(format!(
            "{} input field '{}' must be a map",
            primitive, field
        ))),
    }
}

/// A string or list of strings, as a list
pub fn string_list(input: &Value, field: &str, primitive: &str) -> Result<Vec<String>> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(OrchestratorError::bad_request(format!(
                    "{} input field '{}' must contain only strings",
                    primitive, field
                ))),
            })
            .collect(),
        Some(_) => Err(OrchestratorError::bad_request(format!(
            "{} input field '{}' must be a string or list of strings",
            primitive, field
        ))),
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> StepContext {
    StepContext {
        execution_id: Uuid::new_v4(),
        pipeline_execution_id: Uuid::new_v4(),
        step_execution_id: Uuid::new_v4(),
        step_name: "test".to_string(),
        attempt: 1,
        cancel: CancellationToken::new(),
    }
}
