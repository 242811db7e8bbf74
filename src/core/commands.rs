//! Command handlers, one per command type.
//!
//! Each handler rebuilds the execution from the log, checks the command
//! still makes sense for the pipeline's current state, performs its side
//! effect and emits one event. Stale commands (for a pipeline that has
//! already moved on) are dropped with a debug log. Returning an error fails
//! the targeted pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    EventType, Message, NextStep, PipelineFinished, PipelineLoaded, PipelinePlanned,
    PipelineStatus, PipelineStepFailed, PipelineStepFinish, PipelineStepFinished,
    PipelineStepStart, PipelineStepStarted, StepExecutionStatus,
};
use crate::error::{ErrorInfo, ErrorKind, OrchestratorError, Result};
use crate::primitives::StepContext;

use super::bus::{CommandHandler, Handlers};
use super::engine::Engine;
use super::for_each;
use super::nested::{self, ChildRequest};
use super::pipeline::{StepDefinition, PIPELINE_STEP_TYPE};
use super::planner;
use super::template;

/// Register every command handler
pub fn register(handlers: Handlers) -> Handlers {
    handlers
        .command(QueueHandler)
        .command(LoadHandler)
        .command(StartHandler)
        .command(PlanHandler)
        .command(StepStartHandler)
        .command(StepFinishHandler)
        .command(FinishHandler)
        .command(FailHandler)
        .command(CancelHandler)
        .command(PauseHandler)
        .command(ResumeHandler)
}

fn unexpected(expected: EventType, got: &Message) -> OrchestratorError {
    OrchestratorError::internal(format!(
        "{} handler received {}",
        expected,
        got.event_type()
    ))
}

/// `pipeline_queue` -> `pipeline_queued`
pub struct QueueHandler;

#[async_trait]
impl CommandHandler for QueueHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineQueue
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineQueue(queue) = command else {
            return Err(unexpected(self.handles(), command));
        };
        if queue.name.trim().is_empty() {
            return Err(OrchestratorError::bad_request("pipeline_queue requires a pipeline name"));
        }

        info!(
            target_pipeline = %queue.pipeline,
            name = %queue.name,
            nested = queue.parent_step_execution_id.is_some(),
            "Pipeline queued"
        );
        engine.send(Message::PipelineQueued(queue.clone())).await
    }
}

/// `pipeline_load` -> `pipeline_loaded` with a validated definition snapshot
pub struct LoadHandler;

#[async_trait]
impl CommandHandler for LoadHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineLoad
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineLoad(target) = command else {
            return Err(unexpected(self.handles(), command));
        };
        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if pe.status != PipelineStatus::Queued {
            debug!(%target, status = pe.status.as_str(), "Ignoring load, pipeline already loaded");
            return Ok(());
        }

        let definition = engine.definitions().get_definition(&pe.name)?;
        definition.validate()?;
        for step in &definition.steps {
            if step.step_type != PIPELINE_STEP_TYPE && !engine.primitives().contains(&step.step_type) {
                return Err(OrchestratorError::bad_request(format!(
                    "Step '{}' in pipeline '{}' has unknown type '{}'",
                    step.name, definition.name, step.step_type
                )));
            }
        }
        for warning in definition.lint() {
            warn!(pipeline = %definition.name, "{}", warning);
        }

        engine
            .send(Message::PipelineLoaded(PipelineLoaded {
                pipeline: *target,
                definition,
            }))
            .await
    }
}

/// `pipeline_start` -> `pipeline_started`
pub struct StartHandler;

#[async_trait]
impl CommandHandler for StartHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineStart
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineStart(target) = command else {
            return Err(unexpected(self.handles(), command));
        };
        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if pe.status != PipelineStatus::Loaded {
            debug!(%target, status = pe.status.as_str(), "Ignoring start");
            return Ok(());
        }

        info!(%target, name = %pe.name, "Pipeline started");
        engine.send(Message::PipelineStarted(*target)).await
    }
}

/// `pipeline_plan` -> `pipeline_planned` with the next eligible steps
pub struct PlanHandler;

#[async_trait]
impl CommandHandler for PlanHandler {
    fn handles(&self) -> EventType {
        EventType::PipelinePlan
    }

    #[instrument(skip_all, fields(pipeline = %command.pipeline()))]
    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelinePlan(target) = command else {
            return Err(unexpected(self.handles(), command));
        };

        let lock = engine.planner_lock(target.execution_id);
        let _guard = lock.lock().await;

        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if !matches!(pe.status, PipelineStatus::Started | PipelineStatus::Planned) {
            debug!(status = pe.status.as_str(), "Not planning");
            return Ok(());
        }
        let definition = execution.pipeline_definition(pe.id)?;
        let data = execution.pipeline_data(pe.id)?;

        let mut next_steps = Vec::new();
        for name in planner::next_steps(pe, definition) {
            let Some(step) = definition.step(&name) else {
                continue;
            };
            next_steps.push(NextStep {
                step_name: name,
                executions: for_each::expand(step, &data)?,
            });
        }

        debug!(
            steps = next_steps.len(),
            executions = next_steps.iter().map(|s| s.executions.len()).sum::<usize>(),
            "Planned"
        );
        engine
            .send(Message::PipelinePlanned(PipelinePlanned {
                pipeline: *target,
                next_steps,
            }))
            .await
    }
}

/// `pipeline_step_start` -> `pipeline_step_started`, then runs the step.
///
/// A `pipeline` step queues its child pipeline instead of calling a
/// primitive. Any other step runs its primitive under the step slot limit
/// and the step timeout; the outcome arrives as `pipeline_step_finish`, or
/// as a reissued `pipeline_step_start` while retries or loop iterations
/// remain. Skipped executions and repeats of an already finished
/// idempotency key finish without running.
pub struct StepStartHandler;

#[async_trait]
impl CommandHandler for StepStartHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineStepStart
    }

    #[instrument(skip_all, fields(step = tracing::field::Empty, attempt = tracing::field::Empty))]
    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineStepStart(start) = command else {
            return Err(unexpected(self.handles(), command));
        };
        let span = tracing::Span::current();
        span.record("step", start.step_name.as_str());
        span.record("attempt", start.attempt);

        let execution = engine.load(start.pipeline.execution_id).await?;
        let pe = execution.pipeline_execution(start.pipeline.pipeline_execution_id)?;
        if pe.is_terminal() {
            debug!(status = pe.status.as_str(), "Pipeline is done, not starting step");
            return Ok(());
        }
        let se = execution.step_execution(start.step_execution_id)?;
        if se.status.is_terminal() {
            debug!("Step execution already done");
            return Ok(());
        }
        let step = execution
            .pipeline_definition(pe.id)?
            .step(&start.step_name)
            .ok_or_else(|| {
                OrchestratorError::not_found(format!(
                    "Step '{}' not found in pipeline '{}'",
                    start.step_name, pe.name
                ))
            })?
            .clone();

        if start.skip {
            debug!("Condition is false, skipping");
            return engine
                .send(Message::PipelineStepFinish(PipelineStepFinish {
                    pipeline: start.pipeline,
                    step_execution_id: start.step_execution_id,
                    output: Value::Null,
                    error: None,
                    skipped: true,
                }))
                .await;
        }

        if start.attempt == 1 && start.loop_index == 0 {
            let done = execution.steps_of(pe.id).into_iter().find(|other| {
                other.id != se.id
                    && other.idempotency_key == start.idempotency_key
                    && other.status == StepExecutionStatus::Finished
            });
            if let Some(done) = done {
                info!(reused = %done.id, "Identical step execution already finished");
                let output = done.output.clone().unwrap_or(Value::Null);
                return finish_step(engine, start, Ok(output)).await;
            }
        }

        if step.is_pipeline() {
            return start_child(engine, start).await;
        }

        engine
            .send(Message::PipelineStepStarted(PipelineStepStarted {
                pipeline: start.pipeline,
                step_execution_id: start.step_execution_id,
                child_pipeline_execution_id: None,
            }))
            .await?;

        let output = match run_step(engine, start, &step).await {
            Ok(output) => output,
            Err(err) => return retry_or_fail(engine, start, &step, err).await,
        };
        if step.throw.is_empty() && step.loop_config.is_none() {
            return finish_step(engine, start, Ok(output)).await;
        }

        let data = result_data(&execution.pipeline_data(pe.id)?, start, &output);
        if let Some(err) = thrown(&step, &data)? {
            return finish_step(engine, start, Err(err)).await;
        }
        match next_iteration(&step, start, &data)? {
            Some(next) => engine.send(Message::PipelineStepStart(next)).await,
            None => finish_step(engine, start, Ok(output)).await,
        }
    }
}

/// Template data for `throw` and `loop`: the pipeline data, the element
/// context for for-each executions, `result` and `loop.index`
fn result_data(pipeline_data: &Value, start: &PipelineStepStart, output: &Value) -> Value {
    let scoped = match &start.for_each {
        Some(context) => for_each::with_element(pipeline_data, context),
        None => pipeline_data.clone(),
    };
    let mut data = match scoped {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    data.insert("result".to_string(), output.clone());
    data.insert("loop".to_string(), json!({ "index": start.loop_index }));
    Value::Object(data)
}

/// The first `throw` entry whose condition holds, as a step failure
fn thrown(step: &StepDefinition, data: &Value) -> Result<Option<OrchestratorError>> {
    for throw in &step.throw {
        if !template::condition(&throw.condition, data)? {
            continue;
        }
        let message = match &throw.message {
            Some(message) => match template::render(message, data)? {
                Value::String(s) => s,
                other => other.to_string(),
            },
            None => "User defined error".to_string(),
        };
        return Ok(Some(OrchestratorError::primitive(message)));
    }
    Ok(None)
}

/// The start command for the next loop iteration, if the loop goes on
fn next_iteration(
    step: &StepDefinition,
    start: &PipelineStepStart,
    data: &Value,
) -> Result<Option<PipelineStepStart>> {
    let Some(config) = &step.loop_config else {
        return Ok(None);
    };
    if template::condition(&config.until, data)? {
        return Ok(None);
    }
    if start.loop_index + 1 >= config.max_iterations {
        warn!(iterations = config.max_iterations, "Loop stopped at max_iterations");
        return Ok(None);
    }

    let mut input = start.input.clone();
    if let Some(overrides) = &config.input {
        match (template::render(overrides, data)?, &mut input) {
            (Value::Object(overrides), Value::Object(current)) => current.extend(overrides),
            (rendered, _) => input = rendered,
        }
    }

    debug!(next = start.loop_index + 1, "Loop continues");
    Ok(Some(PipelineStepStart {
        input,
        attempt: 1,
        retries_remaining: step.error.retries,
        loop_index: start.loop_index + 1,
        ..start.clone()
    }))
}

async fn start_child(engine: &Arc<Engine>, start: &PipelineStepStart) -> Result<()> {
    let child_id = Uuid::new_v4();

    let request = match ChildRequest::from_input(&start.input) {
        Ok(request) => request,
        Err(err) => {
            engine
                .send(Message::PipelineStepStarted(PipelineStepStarted {
                    pipeline: start.pipeline,
                    step_execution_id: start.step_execution_id,
                    child_pipeline_execution_id: None,
                }))
                .await?;
            return finish_step(engine, start, Err(err)).await;
        }
    };

    info!(child = %child_id, pipeline = %request.name, "Starting child pipeline");
    engine
        .send(Message::PipelineStepStarted(PipelineStepStarted {
            pipeline: start.pipeline,
            step_execution_id: start.step_execution_id,
            child_pipeline_execution_id: Some(child_id),
        }))
        .await?;
    engine.send(nested::child_queue(start, child_id, request)).await
}

/// Run the step's primitive once
async fn run_step(engine: &Arc<Engine>, start: &PipelineStepStart, step: &StepDefinition) -> Result<Value> {
    let primitive = engine.primitives().get(&step.step_type)?;
    primitive.validate_input(&start.input)?;

    let _slot = engine.acquire_step_slot().await?;
    let ctx = StepContext {
        execution_id: start.pipeline.execution_id,
        pipeline_execution_id: start.pipeline.pipeline_execution_id,
        step_execution_id: start.step_execution_id,
        step_name: start.step_name.clone(),
        attempt: start.attempt,
        cancel: engine.cancel_token(start.pipeline.pipeline_execution_id),
    };
    let timeout = step.timeout(engine.settings().step_timeout_seconds);

    match tokio::time::timeout(timeout, primitive.run(&ctx, &start.input)).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::primitive(format!(
            "Step '{}' timed out after {}s",
            step.name,
            timeout.as_secs()
        ))),
    }
}

/// Retry a failed attempt while the budget allows, otherwise report it
async fn retry_or_fail(
    engine: &Arc<Engine>,
    start: &PipelineStepStart,
    step: &StepDefinition,
    err: OrchestratorError,
) -> Result<()> {
    let cancel = engine.cancel_token(start.pipeline.pipeline_execution_id);
    let retryable = start.retries_remaining > 0
        && matches!(err.kind(), ErrorKind::PrimitiveFailure | ErrorKind::Internal)
        && !cancel.is_cancelled();
    if !retryable {
        return finish_step(engine, start, Err(err)).await;
    }

    let delay = step.error.backoff.delay_for_attempt(start.attempt);
    warn!(
        attempt = start.attempt,
        retries_remaining = start.retries_remaining,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Step failed, retrying"
    );

    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {
            return finish_step(engine, start, Err(err)).await;
        }
    }

    engine
        .send(Message::PipelineStepStart(PipelineStepStart {
            attempt: start.attempt + 1,
            retries_remaining: start.retries_remaining - 1,
            ..start.clone()
        }))
        .await
}

async fn finish_step(engine: &Arc<Engine>, start: &PipelineStepStart, result: Result<Value>) -> Result<()> {
    let (output, error) = match result {
        Ok(output) => (output, None),
        Err(err) => (Value::Null, Some(ErrorInfo::from(&err))),
    };
    engine
        .send(Message::PipelineStepFinish(PipelineStepFinish {
            pipeline: start.pipeline,
            step_execution_id: start.step_execution_id,
            output,
            error,
            skipped: false,
        }))
        .await
}

/// `pipeline_step_finish` -> `pipeline_step_finished` or `pipeline_step_failed`
pub struct StepFinishHandler;

#[async_trait]
impl CommandHandler for StepFinishHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineStepFinish
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineStepFinish(finish) = command else {
            return Err(unexpected(self.handles(), command));
        };
        let execution = engine.load(finish.pipeline.execution_id).await?;
        let se = execution.step_execution(finish.step_execution_id)?;
        if se.status.is_terminal() {
            debug!(step = %se.name, "Step execution already done");
            return Ok(());
        }

        let event = match &finish.error {
            None => {
                if finish.skipped {
                    info!(step = %se.name, "Step skipped");
                } else {
                    info!(step = %se.name, attempt = se.attempt, "Step finished");
                }
                Message::PipelineStepFinished(PipelineStepFinished {
                    pipeline: finish.pipeline,
                    step_execution_id: finish.step_execution_id,
                    output: finish.output.clone(),
                    skipped: finish.skipped,
                })
            }
            Some(error) => {
                warn!(step = %se.name, attempt = se.attempt, %error, "Step failed");
                Message::PipelineStepFailed(PipelineStepFailed {
                    pipeline: finish.pipeline,
                    step_execution_id: finish.step_execution_id,
                    error: error.clone(),
                })
            }
        };
        engine.send(event).await
    }
}

/// `pipeline_finish` -> `pipeline_finished` with the pipeline's output
pub struct FinishHandler;

#[async_trait]
impl CommandHandler for FinishHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineFinish
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineFinish(target) = command else {
            return Err(unexpected(self.handles(), command));
        };

        let lock = engine.planner_lock(target.execution_id);
        let _guard = lock.lock().await;

        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if pe.is_terminal() {
            debug!(%target, status = pe.status.as_str(), "Pipeline already done");
            return Ok(());
        }

        let definition = execution.pipeline_definition(pe.id)?;
        let output = match &definition.output {
            Some(output) => template::render(output, &execution.pipeline_data(pe.id)?)?,
            None => Value::Object(execution.step_outputs(pe.id)),
        };

        info!(%target, name = %pe.name, "Pipeline finished");
        engine
            .send(Message::PipelineFinished(PipelineFinished {
                pipeline: *target,
                output,
            }))
            .await
    }
}

/// `pipeline_fail` -> `pipeline_failed`
pub struct FailHandler;

#[async_trait]
impl CommandHandler for FailHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineFail
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineFail(fail) = command else {
            return Err(unexpected(self.handles(), command));
        };

        let lock = engine.planner_lock(fail.pipeline.execution_id);
        let _guard = lock.lock().await;

        let execution = engine.load(fail.pipeline.execution_id).await?;
        let pe = execution.pipeline_execution(fail.pipeline.pipeline_execution_id)?;
        if pe.is_terminal() {
            debug!(pipeline = %fail.pipeline, status = pe.status.as_str(), "Pipeline already done");
            return Ok(());
        }

        warn!(pipeline = %fail.pipeline, name = %pe.name, error = %fail.error, "Pipeline failed");
        engine.send(Message::PipelineFailed(fail.clone())).await
    }
}

/// `pipeline_cancel` -> `pipeline_canceled`, tripping the cancellation token
pub struct CancelHandler;

#[async_trait]
impl CommandHandler for CancelHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineCancel
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineCancel(cancel) = command else {
            return Err(unexpected(self.handles(), command));
        };
        let execution = engine.load(cancel.pipeline.execution_id).await?;
        let pe = execution.pipeline_execution(cancel.pipeline.pipeline_execution_id)?;
        if pe.is_terminal() {
            debug!(pipeline = %cancel.pipeline, "Pipeline already done, nothing to cancel");
            return Ok(());
        }

        info!(pipeline = %cancel.pipeline, reason = ?cancel.reason, "Pipeline canceled");
        engine.send(Message::PipelineCanceled(cancel.clone())).await?;
        engine.cancel_token(pe.id).cancel();
        Ok(())
    }
}

/// `pipeline_pause` -> `pipeline_paused`
pub struct PauseHandler;

#[async_trait]
impl CommandHandler for PauseHandler {
    fn handles(&self) -> EventType {
        EventType::PipelinePause
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelinePause(target) = command else {
            return Err(unexpected(self.handles(), command));
        };

        // Serialized with planning, so no plan lands after the pause
        let lock = engine.planner_lock(target.execution_id);
        let _guard = lock.lock().await;

        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if !matches!(pe.status, PipelineStatus::Started | PipelineStatus::Planned) {
            warn!(%target, status = pe.status.as_str(), "Only running pipelines can be paused");
            return Ok(());
        }

        info!(%target, "Pipeline paused");
        engine.send(Message::PipelinePaused(*target)).await
    }
}

/// `pipeline_resume` -> `pipeline_resumed`
pub struct ResumeHandler;

#[async_trait]
impl CommandHandler for ResumeHandler {
    fn handles(&self) -> EventType {
        EventType::PipelineResume
    }

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()> {
        let Message::PipelineResume(target) = command else {
            return Err(unexpected(self.handles(), command));
        };

        let lock = engine.planner_lock(target.execution_id);
        let _guard = lock.lock().await;

        let execution = engine.load(target.execution_id).await?;
        let pe = execution.pipeline_execution(target.pipeline_execution_id)?;
        if !pe.is_paused() {
            warn!(%target, status = pe.status.as_str(), "Only paused pipelines can be resumed");
            return Ok(());
        }

        info!(%target, "Pipeline resumed");
        engine.send(Message::PipelineResumed(*target)).await
    }
}
