//! For-each expansion: one step definition into N step executions.
//!
//! The expression is either a literal list/map or a `${{ }}` reference to
//! step outputs or args. Each element is exposed to the step's input
//! template as `each.key`, `each.value`, `index` and `total_count`.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::domain::{ForEachContext, PlannedExecution};
use crate::error::{OrchestratorError, Result};

use super::pipeline::StepDefinition;
use super::template;

/// Evaluate a for-each expression into `(key, value)` pairs in enumeration
/// order. Lists are keyed by position; maps by key, in key order.
pub fn elements(for_each: &Value, data: &Value) -> Result<Vec<(Value, Value)>> {
    match template::render(for_each, data)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (json!(i), item))
            .collect()),
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (Value::String(k), v)).collect()),
        other => Err(OrchestratorError::bad_request(format!(
            "for_each must evaluate to a list or map, got {}",
            type_name(&other)
        ))),
    }
}

/// Plan the concrete executions of one step.
///
/// Without a for-each expression this is a single execution. With one it
/// is one execution per element, possibly zero. The step's `if` condition
/// is evaluated per execution; when false the input is left unrendered
/// and the execution is marked to be skipped.
pub fn expand(step: &StepDefinition, data: &Value) -> Result<Vec<PlannedExecution>> {
    let Some(expression) = &step.for_each else {
        return Ok(vec![plan(step, data, None)?]);
    };

    let elements = elements(expression, data).map_err(|e| {
        OrchestratorError::bad_request(format!("Step '{}': {}", step.name, e.message()))
    })?;
    let total_count = elements.len();

    elements
        .into_iter()
        .enumerate()
        .map(|(index, (key, value))| {
            let context = ForEachContext {
                index,
                total_count,
                key,
                value,
            };
            let scoped = with_element(data, &context);
            plan(step, &scoped, Some(context))
        })
        .collect()
}

fn plan(step: &StepDefinition, data: &Value, for_each: Option<ForEachContext>) -> Result<PlannedExecution> {
    let run = match &step.condition {
        Some(condition) => template::condition(condition, data).map_err(|e| {
            OrchestratorError::bad_request(format!("Step '{}' if: {}", step.name, e.message()))
        })?,
        None => true,
    };
    let input = if run {
        render_input(&step.input, data)?
    } else {
        Value::Null
    };

    Ok(PlannedExecution {
        step_execution_id: Uuid::new_v4(),
        input,
        for_each,
        skip: !run,
    })
}

/// Template data extended with one element's context
pub fn with_element(data: &Value, context: &ForEachContext) -> Value {
    let mut scoped = match data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scoped.insert(
        "each".to_string(),
        json!({ "key": context.key, "value": context.value }),
    );
    scoped.insert("index".to_string(), json!(context.index));
    scoped.insert("total_count".to_string(), json!(context.total_count));
    Value::Object(scoped)
}

fn render_input(input: &Value, data: &Value) -> Result<Value> {
    match input {
        Value::Null => Ok(Value::Object(Map::new())),
        other => template::render(other, data),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}
