//! Nested pipelines: a `pipeline` step runs another pipeline definition as
//! a child in the same execution and finishes when the child does.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    EventType, Execution, Message, PipelineCancel, PipelineExecution, PipelineQueue, PipelineRef,
    PipelineStatus, PipelineStepFinish, PipelineStepStart,
};
use crate::error::{ErrorInfo, ErrorKind, OrchestratorError, Result};

use super::bus::EventHandler;
use super::engine::Engine;

/// What a `pipeline` step asks for: `{pipeline: <name>, args: {...}}`
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRequest {
    pub name: String,
    pub args: Map<String, Value>,
}

impl ChildRequest {
    pub fn from_input(input: &Value) -> Result<Self> {
        let name = match input.get("pipeline") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(OrchestratorError::bad_request(
                    "pipeline step input must define 'pipeline' as a pipeline name",
                ))
            }
        };
        let args = match input.get("args") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return Err(OrchestratorError::bad_request(
                    "pipeline step input field 'args' must be a map",
                ))
            }
        };
        Ok(Self { name, args })
    }
}

/// The `pipeline_queue` command that starts a step's child pipeline
pub fn child_queue(
    step: &PipelineStepStart,
    child_pipeline_execution_id: Uuid,
    request: ChildRequest,
) -> Message {
    Message::PipelineQueue(PipelineQueue {
        pipeline: PipelineRef::new(step.pipeline.execution_id, child_pipeline_execution_id),
        name: request.name,
        args: request.args,
        parent_step_execution_id: Some(step.step_execution_id),
    })
}

/// The `pipeline_step_finish` command reporting a terminal child to the
/// step that spawned it. `None` when the child has no parent or is still
/// running.
pub fn parent_step_finish(execution: &Execution, child: &PipelineExecution) -> Option<Message> {
    let parent_step_id = child.parent_step_execution_id?;
    let parent_step = execution.step_executions.get(&parent_step_id)?;

    let (output, error) = match child.status {
        PipelineStatus::Finished => (child.output.clone().unwrap_or(Value::Null), None),
        PipelineStatus::Failed => {
            let cause = child.error.clone();
            let error = ErrorInfo::new(
                cause.as_ref().map_or(ErrorKind::PrimitiveFailure, |e| e.kind),
                format!(
                    "Child pipeline '{}' failed: {}",
                    child.name,
                    cause.map_or_else(|| "unknown error".to_string(), |e| e.message)
                ),
            );
            (Value::Null, Some(error))
        }
        PipelineStatus::Canceled => (
            Value::Null,
            Some(ErrorInfo::new(
                ErrorKind::PrimitiveFailure,
                format!("Child pipeline '{}' was canceled", child.name),
            )),
        ),
        _ => return None,
    };

    Some(Message::PipelineStepFinish(PipelineStepFinish {
        pipeline: PipelineRef::new(execution.id, parent_step.pipeline_execution_id),
        step_execution_id: parent_step_id,
        output,
        error,
        skipped: false,
    }))
}

/// Reports terminal children back to their parent step
pub struct ChildLinker;

#[async_trait]
impl EventHandler for ChildLinker {
    fn name(&self) -> &'static str {
        "child_linker"
    }

    fn handles(&self) -> &'static [EventType] {
        &[
            EventType::PipelineFinished,
            EventType::PipelineFailed,
            EventType::PipelineCanceled,
        ]
    }

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()> {
        let target = event.pipeline();
        let execution = engine.load(target.execution_id).await?;
        let child = execution.pipeline_execution(target.pipeline_execution_id)?;

        match parent_step_finish(&execution, child) {
            Some(finish) => {
                info!(
                    child = %child.id,
                    status = child.status.as_str(),
                    "Child pipeline done, finishing parent step"
                );
                engine.send(finish).await
            }
            None => Ok(()),
        }
    }
}

/// Cancels running children when their parent is canceled
pub struct CancelChildren;

#[async_trait]
impl EventHandler for CancelChildren {
    fn name(&self) -> &'static str {
        "cancel_children"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PipelineCanceled]
    }

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()> {
        let target = event.pipeline();
        let execution = engine.load(target.execution_id).await?;

        for child in execution.active_children(target.pipeline_execution_id) {
            debug!(%child, parent = %target.pipeline_execution_id, "Canceling child pipeline");
            engine
                .send(Message::PipelineCancel(PipelineCancel {
                    pipeline: PipelineRef::new(target.execution_id, child),
                    reason: Some("Parent pipeline canceled".to_string()),
                }))
                .await?;
        }
        Ok(())
    }
}
