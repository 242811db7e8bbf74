//! Event reactions: each fact moves the pipeline to its next command.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{
    EventType, Execution, Message, PipelineFail, PipelineRef, PipelineStepStart, PlannedExecution,
};
use crate::error::{ErrorInfo, Result};

use super::bus::{EventHandler, Handlers};
use super::engine::Engine;
use super::event_store::generate_idempotency_key;
use super::nested::{CancelChildren, ChildLinker};
use super::pipeline::PipelineDefinition;

/// Register every reaction
pub fn register(handlers: Handlers) -> Handlers {
    handlers
        .reaction(Advance)
        .reaction(DispatchPlanned)
        .reaction(StepFailed)
        .reaction(ChildLinker)
        .reaction(CancelChildren)
}

/// Lifecycle steps that map one event to one follow-up command on the same
/// pipeline: queued -> load, loaded -> start, and started or step
/// finished -> plan
pub struct Advance;

#[async_trait]
impl EventHandler for Advance {
    fn name(&self) -> &'static str {
        "advance"
    }

    fn handles(&self) -> &'static [EventType] {
        &[
            EventType::PipelineQueued,
            EventType::PipelineLoaded,
            EventType::PipelineStarted,
            EventType::PipelineStepFinished,
        ]
    }

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()> {
        let target = event.pipeline();
        let next = match event {
            Message::PipelineQueued(_) => Message::PipelineLoad(target),
            Message::PipelineLoaded(_) => Message::PipelineStart(target),
            _ => Message::PipelinePlan(target),
        };
        engine.send(next).await
    }
}

/// Starts planned step executions, or finishes the pipeline once nothing
/// is left to plan and every step is complete.
///
/// Nothing is dispatched unless the pipeline is running. Executions
/// planned while paused stay pending until `pipeline_resumed`.
pub struct DispatchPlanned;

#[async_trait]
impl EventHandler for DispatchPlanned {
    fn name(&self) -> &'static str {
        "dispatch_planned"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PipelinePlanned, EventType::PipelineResumed]
    }

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()> {
        let target = event.pipeline();
        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;

        let Message::PipelinePlanned(planned) = event else {
            // Resumed: start whatever was planned during the pause, then plan
            if pe.is_running() {
                start_pending(engine, &execution, target).await?;
                engine.send(Message::PipelinePlan(target)).await?;
            }
            return Ok(());
        };

        if planned.next_steps.is_empty() {
            if pe.is_complete() && !pe.is_terminal() {
                return engine.send(Message::PipelineFinish(target)).await;
            }
            debug!(%target, progress = pe.progress(), "Nothing to plan yet");
            return Ok(());
        }
        if !pe.is_running() {
            debug!(%target, status = pe.status.as_str(), "Not dispatching, pipeline is not running");
            return Ok(());
        }

        let definition = execution.pipeline_definition(pe.id)?;
        let mut replan = false;
        for next in &planned.next_steps {
            // A for-each over nothing completes immediately
            if next.executions.is_empty() {
                replan = true;
                continue;
            }
            let pending = next.executions.iter().filter(|e| pe.is_pending(e.step_execution_id));
            for planned_execution in pending {
                let start = start_command(target, definition, &next.step_name, planned_execution)?;
                engine.send(start).await?;
            }
        }

        if replan {
            engine.send(Message::PipelinePlan(target)).await?;
        }
        Ok(())
    }
}

/// Issue `pipeline_step_start` for every pending execution of a pipeline
pub(crate) async fn start_pending(
    engine: &Arc<Engine>,
    execution: &Execution,
    target: PipelineRef,
) -> Result<()> {
    let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
    let definition = execution.pipeline_definition(pe.id)?;

    for pending in &pe.pending_steps {
        let start = start_command(target, definition, &pending.step_name, &pending.execution)?;
        engine.send(start).await?;
    }
    Ok(())
}

/// First-attempt start command for a planned execution
fn start_command(
    target: PipelineRef,
    definition: &PipelineDefinition,
    step_name: &str,
    planned: &PlannedExecution,
) -> Result<Message> {
    let retries = definition.step(step_name).map_or(0, |step| step.error.retries);
    Ok(Message::PipelineStepStart(PipelineStepStart::planned(
        target,
        step_name,
        planned,
        retries,
        idempotency_key(target, step_name, planned)?,
    )))
}

/// Key over the step, its rendered input and its for-each position, so
/// fan-out elements with equal inputs stay distinct
fn idempotency_key(target: PipelineRef, step_name: &str, planned: &PlannedExecution) -> Result<String> {
    let mut material = serde_json::to_string(&planned.input)?;
    if let Some(context) = &planned.for_each {
        material.push_str(&format!("#{}", context.index));
    }
    Ok(generate_idempotency_key(target.execution_id, step_name, &material))
}

/// A failed step re-plans when its failures are ignored, otherwise fails
/// the pipeline
pub struct StepFailed;

#[async_trait]
impl EventHandler for StepFailed {
    fn name(&self) -> &'static str {
        "step_failed"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PipelineStepFailed]
    }

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()> {
        let Message::PipelineStepFailed(failed) = event else {
            return Ok(());
        };
        let target = failed.pipeline;
        let execution = engine.load(target.execution_id).await?;
        let se = execution.step_execution(failed.step_execution_id)?;
        let ignore = execution
            .pipeline_definition(target.pipeline_execution_id)?
            .step(&se.name)
            .map_or(false, |step| step.error.ignore);

        if ignore {
            debug!(step = %se.name, "Ignoring step failure");
            return engine.send(Message::PipelinePlan(target)).await;
        }

        engine
            .send(Message::PipelineFail(PipelineFail {
                pipeline: target,
                error: ErrorInfo::new(
                    failed.error.kind,
                    format!("Step '{}' failed: {}", se.name, failed.error.message),
                ),
            }))
            .await
    }
}
