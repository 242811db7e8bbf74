//! Shared harness for orchestration integration tests.

#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use pipeflow::config::EngineSettings;
use pipeflow::core::{InMemoryDefinitions, PipelineDefinition};
use pipeflow::domain::{Envelope, Execution, PipelineExecution, StepExecution};
use pipeflow::primitives::{Sleep, Transform};
use pipeflow::{Orchestrator, OrchestratorError, Primitive, PrimitiveRegistry, StepContext};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

/// Fails every attempt up to `failures`, then succeeds with the attempt number
pub struct Flaky {
    pub failures: u32,
}

#[async_trait]
impl Primitive for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn validate_input(&self, _input: &Value) -> pipeflow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, _input: &Value) -> pipeflow::Result<Value> {
        if ctx.attempt <= self.failures {
            return Err(OrchestratorError::primitive(format!(
                "attempt {} failed",
                ctx.attempt
            )));
        }
        Ok(json!({ "attempt": ctx.attempt }))
    }
}

/// Always fails with a business error
pub struct Fail;

#[async_trait]
impl Primitive for Fail {
    fn name(&self) -> &str {
        "fail"
    }

    fn validate_input(&self, _input: &Value) -> pipeflow::Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &StepContext, input: &Value) -> pipeflow::Result<Value> {
        let reason = input
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("boom");
        Err(OrchestratorError::primitive(reason))
    }
}

/// Returns its input unchanged
pub struct Echo;

#[async_trait]
impl Primitive for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn validate_input(&self, _input: &Value) -> pipeflow::Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &StepContext, input: &Value) -> pipeflow::Result<Value> {
        Ok(input.clone())
    }
}

/// Panics while running
pub struct Panic;

#[async_trait]
impl Primitive for Panic {
    fn name(&self) -> &str {
        "panic"
    }

    fn validate_input(&self, _input: &Value) -> pipeflow::Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &StepContext, _input: &Value) -> pipeflow::Result<Value> {
        panic!("primitive blew up")
    }
}

pub fn definition(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).unwrap()
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        poll_interval_ms: 20,
        ..Default::default()
    }
}

pub fn registry(flaky_failures: u32) -> PrimitiveRegistry {
    PrimitiveRegistry::new()
        .with(Echo)
        .with(Fail)
        .with(Panic)
        .with(Flaky {
            failures: flaky_failures,
        })
        .with(Sleep)
        .with(Transform)
}

/// An orchestrator over a temp executions directory and in-memory definitions
pub fn orchestrator(temp: &TempDir, definitions: &[&str]) -> Orchestrator {
    orchestrator_with(temp, definitions, registry(0))
}

pub fn orchestrator_with(
    temp: &TempDir,
    definitions: &[&str],
    primitives: PrimitiveRegistry,
) -> Orchestrator {
    let definitions = definitions
        .iter()
        .fold(InMemoryDefinitions::new(), |defs, yaml| defs.with(definition(yaml)));

    Orchestrator::builder()
        .executions_dir(temp.path())
        .definitions(definitions)
        .primitives(primitives)
        .settings(settings())
        .build()
        .unwrap()
}

/// Wait for the root pipeline to finish, failing the test after 10 seconds
pub async fn wait(orchestrator: &Orchestrator, execution_id: Uuid) -> Execution {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(execution_id))
        .await
        .expect("execution did not finish in time")
        .unwrap()
}

/// Poll the log until `check` holds, failing the test after 10 seconds
pub async fn wait_until<F>(orchestrator: &Orchestrator, execution_id: Uuid, check: F) -> Execution
where
    F: Fn(&Execution) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let execution = orchestrator.status(execution_id).await.unwrap();
        if check(&execution) {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Let in-flight handlers settle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub fn root(execution: &Execution) -> &PipelineExecution {
    execution.root().unwrap()
}

/// Step executions of the root pipeline named `name`, by for-each index
pub fn steps<'a>(execution: &'a Execution, name: &str) -> Vec<&'a StepExecution> {
    let mut steps: Vec<&StepExecution> = execution
        .steps_of(root(execution).id)
        .into_iter()
        .filter(|se| se.name == name)
        .collect();
    steps.sort_by_key(|se| se.for_each.as_ref().map_or(0, |f| f.index));
    steps
}

/// Position of the first envelope matching `event_type` and `predicate`
pub fn position<F>(envelopes: &[Envelope], event_type: &str, predicate: F) -> Option<usize>
where
    F: Fn(&Value) -> bool,
{
    envelopes
        .iter()
        .position(|e| e.event_type == event_type && predicate(&e.payload))
}

pub fn count(envelopes: &[Envelope], event_type: &str) -> usize {
    envelopes.iter().filter(|e| e.event_type == event_type).count()
}

pub fn for_step(step_execution_id: Uuid) -> impl Fn(&Value) -> bool {
    move |payload| payload["step_execution_id"] == json!(step_execution_id)
}
