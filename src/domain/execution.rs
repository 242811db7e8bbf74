//! Execution state and reconstruction from the event log.
//!
//! An [`Execution`] covers one triggering run: the root pipeline, every
//! nested child pipeline and every step execution. It is never stored;
//! it is rebuilt by folding the log in append order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::pipeline::PipelineDefinition;
use crate::error::{ErrorInfo, OrchestratorError, Result};

use super::events::{Envelope, ForEachContext, Message, PipelineQueue, PlannedExecution};

/// Root aggregate for one triggering run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution id (taken from the first message replayed)
    pub id: Uuid,

    /// The pipeline execution that started this run
    pub root_pipeline_execution_id: Option<Uuid>,

    /// Every pipeline execution, nested or not
    pub pipeline_executions: HashMap<Uuid, PipelineExecution>,

    /// Every step execution across all pipelines
    pub step_executions: HashMap<Uuid, StepExecution>,
}

impl Execution {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Rebuild an execution from its log
    pub fn from_envelopes(id: Uuid, envelopes: &[Envelope]) -> Result<Self> {
        let mut execution = Self::new(id);
        for envelope in envelopes {
            execution.apply_envelope(envelope)?;
        }
        Ok(execution)
    }

    /// Apply one log entry. Unknown event types are ignored.
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        if let Some(message) = Message::from_envelope(envelope)? {
            self.apply(&message, envelope.timestamp);
        }
        Ok(())
    }

    /// Apply a single message to update execution state
    pub fn apply(&mut self, message: &Message, at: DateTime<Utc>) {
        match message {
            Message::PipelineQueued(e) => self.on_pipeline_queued(e, at),
            Message::PipelineLoaded(e) => {
                if let Some(pe) = self.pipeline_mut(e.pipeline.pipeline_execution_id) {
                    pe.definition = Some(e.definition.clone());
                    pe.args = e.definition.resolve_args(&pe.args);
                    pe.set_status(PipelineStatus::Loaded);
                }
            }
            Message::PipelineStarted(r) => {
                if let Some(pe) = self.pipeline_mut(r.pipeline_execution_id) {
                    pe.set_status(PipelineStatus::Started);
                    pe.started_at.get_or_insert(at);
                }
            }
            Message::PipelinePlanned(e) => {
                if let Some(pe) = self.pipeline_mut(e.pipeline.pipeline_execution_id) {
                    if let Some(definition) = &pe.definition {
                        for name in definition.step_names() {
                            pe.step_status.entry(name.to_string()).or_default();
                        }
                    }
                    for next in &e.next_steps {
                        let status = pe.step_status.entry(next.step_name.clone()).or_default();
                        status.planned = true;
                        status.expected = next.executions.len();
                        pe.pending_steps.extend(next.executions.iter().map(|execution| PendingStep {
                            step_name: next.step_name.clone(),
                            execution: execution.clone(),
                        }));
                    }
                    // A plan racing a pause must not undo it
                    if !e.next_steps.is_empty() && !pe.is_paused() {
                        pe.set_status(PipelineStatus::Planned);
                    }
                }
            }
            Message::PipelineStepStart(c) => {
                let pe_id = c.pipeline.pipeline_execution_id;
                let previous = match self.step_executions.get_mut(&c.step_execution_id) {
                    // Finished executions are never rerun
                    Some(se) if se.status.is_terminal() => return,
                    Some(se) => {
                        // A retry or loop iteration of an existing execution
                        let previous = se.status;
                        se.status = StepExecutionStatus::Queued;
                        se.input = c.input.clone();
                        se.attempt = c.attempt;
                        se.retries_remaining = c.retries_remaining;
                        se.loop_index = c.loop_index;
                        se.error = None;
                        Some(previous)
                    }
                    None => {
                        self.step_executions.insert(
                            c.step_execution_id,
                            StepExecution {
                                id: c.step_execution_id,
                                pipeline_execution_id: pe_id,
                                name: c.step_name.clone(),
                                status: StepExecutionStatus::Queued,
                                input: c.input.clone(),
                                output: None,
                                error: None,
                                for_each: c.for_each.clone(),
                                attempt: c.attempt,
                                retries_remaining: c.retries_remaining,
                                loop_index: c.loop_index,
                                skip: c.skip,
                                idempotency_key: c.idempotency_key.clone(),
                                child_pipeline_execution_id: None,
                                started_at: None,
                                ended_at: None,
                            },
                        );
                        None
                    }
                };

                if let Some(pe) = self.pipeline_mut(pe_id) {
                    if previous.is_none() {
                        pe.step_executions.push(c.step_execution_id);
                    }
                    pe.pending_steps
                        .retain(|p| p.execution.step_execution_id != c.step_execution_id);
                    let status = pe.step_status.entry(c.step_name.clone()).or_default();
                    if let Some(previous) = previous {
                        status.decrement(previous);
                    }
                    status.increment(StepExecutionStatus::Queued);
                }
            }
            Message::PipelineStepStarted(e) => {
                if let Some(se) = self.step_executions.get_mut(&e.step_execution_id) {
                    se.child_pipeline_execution_id = e
                        .child_pipeline_execution_id
                        .or(se.child_pipeline_execution_id);
                    se.started_at.get_or_insert(at);
                }
                self.transition_step(e.step_execution_id, StepExecutionStatus::Started);
            }
            Message::PipelineStepFinished(e) => {
                let to = if e.skipped {
                    StepExecutionStatus::Skipped
                } else {
                    StepExecutionStatus::Finished
                };
                if self.transition_step(e.step_execution_id, to) {
                    if let Some(se) = self.step_executions.get_mut(&e.step_execution_id) {
                        se.output = Some(e.output.clone());
                        se.ended_at = Some(at);
                    }
                }
            }
            Message::PipelineStepFailed(e) => {
                if self.transition_step(e.step_execution_id, StepExecutionStatus::Failed) {
                    if let Some(se) = self.step_executions.get_mut(&e.step_execution_id) {
                        se.error = Some(e.error.clone());
                        se.ended_at = Some(at);
                    }
                }
            }
            Message::PipelinePaused(r) => {
                if let Some(pe) = self.pipeline_mut(r.pipeline_execution_id) {
                    pe.set_status(PipelineStatus::Paused);
                }
            }
            Message::PipelineResumed(r) => {
                if let Some(pe) = self.pipeline_mut(r.pipeline_execution_id) {
                    if pe.status == PipelineStatus::Paused {
                        pe.status = if pe.step_status.values().any(|s| s.planned) {
                            PipelineStatus::Planned
                        } else {
                            PipelineStatus::Started
                        };
                    }
                }
            }
            Message::PipelineCanceled(e) => {
                if let Some(pe) = self.pipeline_mut(e.pipeline.pipeline_execution_id) {
                    if pe.set_status(PipelineStatus::Canceled) {
                        pe.ended_at = Some(at);
                    }
                }
            }
            Message::PipelineFinished(e) => {
                if let Some(pe) = self.pipeline_mut(e.pipeline.pipeline_execution_id) {
                    if pe.set_status(PipelineStatus::Finished) {
                        pe.output = Some(e.output.clone());
                        pe.ended_at = Some(at);
                    }
                }
            }
            Message::PipelineFailed(e) => {
                if let Some(pe) = self.pipeline_mut(e.pipeline.pipeline_execution_id) {
                    if pe.set_status(PipelineStatus::Failed) {
                        pe.error = Some(e.error.clone());
                        pe.ended_at = Some(at);
                    }
                }
            }
            // Remaining commands carry intent only
            Message::PipelineQueue(_)
            | Message::PipelineLoad(_)
            | Message::PipelineStart(_)
            | Message::PipelinePlan(_)
            | Message::PipelineStepFinish(_)
            | Message::PipelineFinish(_)
            | Message::PipelineFail(_)
            | Message::PipelineCancel(_)
            | Message::PipelinePause(_)
            | Message::PipelineResume(_) => {}
        }
    }

    fn on_pipeline_queued(&mut self, e: &PipelineQueue, at: DateTime<Utc>) {
        let pe_id = e.pipeline.pipeline_execution_id;
        if self.pipeline_executions.contains_key(&pe_id) {
            return;
        }

        if self.id.is_nil() {
            self.id = e.pipeline.execution_id;
        }
        if e.parent_step_execution_id.is_none() && self.root_pipeline_execution_id.is_none() {
            self.root_pipeline_execution_id = Some(pe_id);
        }
        if let Some(parent) = e.parent_step_execution_id {
            if let Some(se) = self.step_executions.get_mut(&parent) {
                se.child_pipeline_execution_id = Some(pe_id);
            }
        }

        self.pipeline_executions.insert(
            pe_id,
            PipelineExecution {
                id: pe_id,
                name: e.name.clone(),
                args: e.args.clone(),
                status: PipelineStatus::Queued,
                definition: None,
                step_status: HashMap::new(),
                step_executions: Vec::new(),
                pending_steps: Vec::new(),
                parent_step_execution_id: e.parent_step_execution_id,
                output: None,
                error: None,
                queued_at: at,
                started_at: None,
                ended_at: None,
            },
        );
    }

    /// Move a step execution to a new status, keeping the owning pipeline's
    /// counters in step. Terminal executions are left alone, so a duplicate
    /// finish is a no-op. Returns whether the transition happened.
    fn transition_step(&mut self, step_execution_id: Uuid, to: StepExecutionStatus) -> bool {
        let Some(se) = self.step_executions.get_mut(&step_execution_id) else {
            return false;
        };
        if se.status.is_terminal() || se.status == to {
            return false;
        }

        let from = se.status;
        se.status = to;
        let (pe_id, name) = (se.pipeline_execution_id, se.name.clone());

        if let Some(pe) = self.pipeline_executions.get_mut(&pe_id) {
            let status = pe.step_status.entry(name).or_default();
            status.decrement(from);
            status.increment(to);
        }
        true
    }

    fn pipeline_mut(&mut self, id: Uuid) -> Option<&mut PipelineExecution> {
        self.pipeline_executions.get_mut(&id)
    }

    /// Look up a pipeline execution
    pub fn pipeline_execution(&self, id: Uuid) -> Result<&PipelineExecution> {
        self.pipeline_executions.get(&id).ok_or_else(|| {
            OrchestratorError::not_found(format!(
                "Pipeline execution {} not found in execution {}",
                id, self.id
            ))
        })
    }

    /// Look up a step execution
    pub fn step_execution(&self, id: Uuid) -> Result<&StepExecution> {
        self.step_executions.get(&id).ok_or_else(|| {
            OrchestratorError::not_found(format!(
                "Step execution {} not found in execution {}",
                id, self.id
            ))
        })
    }

    /// The pipeline execution that started this run
    pub fn root(&self) -> Result<&PipelineExecution> {
        let id = self.root_pipeline_execution_id.ok_or_else(|| {
            OrchestratorError::not_found(format!("Execution {} has no pipeline", self.id))
        })?;
        self.pipeline_execution(id)
    }

    /// The definition snapshot recorded when the pipeline was loaded
    pub fn pipeline_definition(&self, pipeline_execution_id: Uuid) -> Result<&PipelineDefinition> {
        let pe = self.pipeline_execution(pipeline_execution_id)?;
        pe.definition.as_ref().ok_or_else(|| {
            OrchestratorError::internal(format!(
                "Pipeline execution {} has not been loaded",
                pipeline_execution_id
            ))
        })
    }

    /// Step executions of one pipeline, in the order they were queued
    pub fn steps_of(&self, pipeline_execution_id: Uuid) -> Vec<&StepExecution> {
        self.pipeline_executions
            .get(&pipeline_execution_id)
            .map(|pe| {
                pe.step_executions
                    .iter()
                    .filter_map(|id| self.step_executions.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Outputs of a pipeline's steps keyed by step name.
    ///
    /// Steps with a for-each expression yield an array ordered by element
    /// index. Failed executions contribute `null`.
    pub fn step_outputs(&self, pipeline_execution_id: Uuid) -> Map<String, Value> {
        let definition = self
            .pipeline_executions
            .get(&pipeline_execution_id)
            .and_then(|pe| pe.definition.as_ref());

        let mut singles = Map::new();
        let mut fanned: HashMap<String, Vec<(usize, Value)>> = HashMap::new();

        for se in self.steps_of(pipeline_execution_id) {
            if !se.status.is_terminal() {
                continue;
            }
            let output = se.output.clone().unwrap_or(Value::Null);
            let is_for_each = definition
                .and_then(|d| d.step(&se.name))
                .map(|s| s.for_each.is_some())
                .unwrap_or(se.for_each.is_some());

            if is_for_each {
                let index = se.for_each.as_ref().map(|f| f.index).unwrap_or(0);
                fanned.entry(se.name.clone()).or_default().push((index, output));
            } else {
                singles.insert(se.name.clone(), output);
            }
        }

        // Planned for-each steps with no elements still expose an empty array
        if let (Some(definition), Some(pe)) =
            (definition, self.pipeline_executions.get(&pipeline_execution_id))
        {
            for step in definition.steps.iter().filter(|s| s.for_each.is_some()) {
                if pe.step_status.get(&step.name).map_or(false, |s| s.planned) {
                    fanned.entry(step.name.clone()).or_default();
                }
            }
        }

        for (name, mut items) in fanned {
            items.sort_by_key(|(index, _)| *index);
            singles.insert(
                name,
                Value::Array(items.into_iter().map(|(_, v)| v).collect()),
            );
        }

        singles
    }

    /// Data available to templates: `args` plus `step.<name>` outputs
    pub fn pipeline_data(&self, pipeline_execution_id: Uuid) -> Result<Value> {
        let pe = self.pipeline_execution(pipeline_execution_id)?;
        let mut data = Map::new();
        data.insert("args".to_string(), Value::Object(pe.args.clone()));
        data.insert(
            "step".to_string(),
            Value::Object(self.step_outputs(pipeline_execution_id)),
        );
        Ok(Value::Object(data))
    }

    /// Child pipelines spawned by steps of this pipeline that have not
    /// reached a terminal state
    pub fn active_children(&self, pipeline_execution_id: Uuid) -> Vec<Uuid> {
        self.steps_of(pipeline_execution_id)
            .into_iter()
            .filter_map(|se| se.child_pipeline_execution_id)
            .filter(|child| {
                self.pipeline_executions
                    .get(child)
                    .map_or(false, |pe| !pe.status.is_terminal())
            })
            .collect()
    }
}

/// Status of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Queued,
    Loaded,
    Started,
    Planned,
    Paused,
    Finished,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Loaded => "loaded",
            Self::Started => "started",
            Self::Planned => "planned",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run instance of a named pipeline (top-level or child)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,

    /// Pipeline definition name
    pub name: String,

    /// Arguments (definition defaults merged once loaded)
    pub args: Map<String, Value>,

    pub status: PipelineStatus,

    /// Definition snapshot from `pipeline_loaded`
    pub definition: Option<PipelineDefinition>,

    /// Per-step rollup; empty until the first planning pass
    pub step_status: HashMap<String, StepStatus>,

    /// Step execution ids in queue order
    pub step_executions: Vec<Uuid>,

    /// Planned executions whose `pipeline_step_start` has not been logged
    #[serde(default)]
    pub pending_steps: Vec<PendingStep>,

    /// Step that spawned this pipeline, for nested pipelines
    pub parent_step_execution_id: Option<Uuid>,

    /// Rendered output, once finished
    pub output: Option<Value>,

    /// Failure details, once failed
    pub error: Option<ErrorInfo>,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    /// Set a new status unless already terminal. Returns whether it changed.
    fn set_status(&mut self, status: PipelineStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn is_paused(&self) -> bool {
        self.status == PipelineStatus::Paused
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether new step executions may be dispatched
    pub fn is_running(&self) -> bool {
        matches!(self.status, PipelineStatus::Started | PipelineStatus::Planned)
    }

    /// Whether a planned execution is still waiting for its start command
    pub fn is_pending(&self, step_execution_id: Uuid) -> bool {
        self.pending_steps
            .iter()
            .any(|p| p.execution.step_execution_id == step_execution_id)
    }

    /// True once every step in the definition has been planned and all of
    /// its executions are terminal
    pub fn is_complete(&self) -> bool {
        let Some(definition) = &self.definition else {
            return false;
        };
        definition.step_names().all(|name| {
            self.step_status
                .get(name)
                .map_or(false, StepStatus::is_complete)
        })
    }

    /// Whether any step execution of this pipeline failed
    pub fn has_step_failures(&self) -> bool {
        self.step_status.values().any(StepStatus::has_failures)
    }

    /// Share of step executions in a terminal state, across all steps
    pub fn progress(&self) -> u32 {
        let total = self.step_status.values().fold(StepStatus::default(), |mut acc, s| {
            acc.queued += s.queued;
            acc.started += s.started;
            acc.finished += s.finished;
            acc.failed += s.failed;
            acc.skipped += s.skipped;
            acc
        });
        total.progress()
    }
}

/// Status of one step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Skipped,
}

impl StepExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete run of a step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Unique across the whole execution
    pub id: Uuid,

    /// Owning pipeline execution
    pub pipeline_execution_id: Uuid,

    /// Step definition name
    pub name: String,

    pub status: StepExecutionStatus,

    /// Resolved input
    pub input: Value,

    pub output: Option<Value>,

    pub error: Option<ErrorInfo>,

    /// Element context when the step fans out
    pub for_each: Option<ForEachContext>,

    /// Current attempt (1-based)
    pub attempt: u32,

    /// Retries left after the current attempt
    pub retries_remaining: u32,

    /// Loop iteration (0-based)
    #[serde(default)]
    pub loop_index: u32,

    /// Planned with a false condition
    #[serde(default)]
    pub skip: bool,

    /// "{execution_id}:{step}:{input_hash}"
    pub idempotency_key: String,

    /// Child pipeline spawned by a `pipeline` step
    pub child_pipeline_execution_id: Option<Uuid>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A planned execution that has not been started yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStep {
    pub step_name: String,

    #[serde(flatten)]
    pub execution: PlannedExecution,
}

/// Rollup of all executions of one step definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Set once a planning pass has selected this step
    pub planned: bool,

    /// Executions created by that planning pass
    pub expected: usize,

    pub queued: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,

    /// Executions whose condition was false
    #[serde(default)]
    pub skipped: usize,
}

impl StepStatus {
    pub fn total(&self) -> usize {
        self.queued + self.started + self.terminal()
    }

    fn terminal(&self) -> usize {
        self.finished + self.failed + self.skipped
    }

    /// `(finished + failed + skipped) * 100 / total`, or 0 when there are
    /// no executions
    pub fn progress(&self) -> u32 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        (self.terminal() * 100 / total) as u32
    }

    /// Planned, nothing in flight, and every expected execution terminal
    pub fn is_complete(&self) -> bool {
        self.planned && self.queued == 0 && self.started == 0 && self.terminal() >= self.expected
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Whether the step has been planned or has any executions
    pub fn has_begun(&self) -> bool {
        self.planned || self.total() > 0
    }

    fn counter(&mut self, status: StepExecutionStatus) -> &mut usize {
        match status {
            StepExecutionStatus::Queued => &mut self.queued,
            StepExecutionStatus::Started => &mut self.started,
            StepExecutionStatus::Finished => &mut self.finished,
            StepExecutionStatus::Failed => &mut self.failed,
            StepExecutionStatus::Skipped => &mut self.skipped,
        }
    }

    fn increment(&mut self, status: StepExecutionStatus) {
        *self.counter(status) += 1;
    }

    fn decrement(&mut self, status: StepExecutionStatus) {
        let counter = self.counter(status);
        *counter = counter.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::StepDefinition;
    use crate::domain::events::{
        NextStep, PipelineLoaded, PipelinePlanned, PipelineRef, PipelineStepFailed,
        PipelineStepFinished, PipelineStepStart, PipelineStepStarted,
    };
    use crate::error::ErrorKind;
    use serde_json::json;

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "two".to_string(),
            description: String::new(),
            args: Map::new(),
            steps: vec![
                StepDefinition::new("a", "sleep"),
                StepDefinition::new("b", "sleep").depends_on(["a"]),
            ],
            output: None,
        }
    }

    fn start(target: PipelineRef, name: &str, id: Uuid) -> Message {
        Message::PipelineStepStart(PipelineStepStart {
            pipeline: target,
            step_execution_id: id,
            step_name: name.to_string(),
            input: json!({}),
            for_each: None,
            attempt: 1,
            retries_remaining: 0,
            loop_index: 0,
            skip: false,
            idempotency_key: format!("k:{}", name),
        })
    }

    fn planned(target: PipelineRef, name: &str, id: Uuid) -> Message {
        Message::PipelinePlanned(PipelinePlanned {
            pipeline: target,
            next_steps: vec![NextStep {
                step_name: name.to_string(),
                executions: vec![PlannedExecution {
                    step_execution_id: id,
                    input: json!({}),
                    for_each: None,
                    skip: false,
                }],
            }],
        })
    }

    fn loaded_execution() -> (Execution, PipelineRef) {
        let target = PipelineRef::new(Uuid::new_v4(), Uuid::new_v4());
        let mut ex = Execution::new(target.execution_id);
        let now = Utc::now();
        ex.apply(
            &Message::PipelineQueued(PipelineQueue {
                pipeline: target,
                name: "two".to_string(),
                args: Map::new(),
                parent_step_execution_id: None,
            }),
            now,
        );
        ex.apply(
            &Message::PipelineLoaded(PipelineLoaded {
                pipeline: target,
                definition: definition(),
            }),
            now,
        );
        ex.apply(&Message::PipelineStarted(target), now);
        (ex, target)
    }

    #[test]
    fn test_progress_formula() {
        assert_eq!(StepStatus::default().progress(), 0);

        for queued in 0..4 {
            for started in 0..4 {
                for finished in 0..4 {
                    for failed in 0..4 {
                        let s = StepStatus {
                            queued,
                            started,
                            finished,
                            failed,
                            ..Default::default()
                        };
                        let total = queued + started + finished + failed;
                        let expected = if total == 0 {
                            0
                        } else {
                            ((finished + failed) * 100 / total) as u32
                        };
                        assert_eq!(s.progress(), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn test_step_status_absent_until_planned() {
        let (mut ex, target) = loaded_execution();
        assert!(ex.root().unwrap().step_status.is_empty());

        ex.apply(
            &Message::PipelinePlanned(PipelinePlanned {
                pipeline: target,
                next_steps: vec![NextStep {
                    step_name: "a".to_string(),
                    executions: vec![],
                }],
            }),
            Utc::now(),
        );

        let pe = ex.root().unwrap();
        assert_eq!(pe.status, PipelineStatus::Planned);
        assert_eq!(pe.step_status.len(), 2);
        assert!(pe.step_status["a"].planned);
        assert!(!pe.step_status["b"].planned);
    }

    #[test]
    fn test_step_counters_follow_transitions() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();
        let id = Uuid::new_v4();

        ex.apply(&start(target, "a", id), now);
        assert_eq!(ex.root().unwrap().step_status["a"].queued, 1);

        ex.apply(
            &Message::PipelineStepStarted(PipelineStepStarted {
                pipeline: target,
                step_execution_id: id,
                child_pipeline_execution_id: None,
            }),
            now,
        );
        let s = ex.root().unwrap().step_status["a"];
        assert_eq!((s.queued, s.started), (0, 1));

        let finished = Message::PipelineStepFinished(PipelineStepFinished {
            pipeline: target,
            step_execution_id: id,
            output: json!({"ok": true}),
            skipped: false,
        });
        ex.apply(&finished, now);
        // Duplicate delivery is a no-op
        ex.apply(&finished, now);

        let s = ex.root().unwrap().step_status["a"];
        assert_eq!((s.queued, s.started, s.finished), (0, 0, 1));
        assert_eq!(ex.step_executions[&id].output, Some(json!({"ok": true})));
    }

    #[test]
    fn test_retry_resets_execution_to_queued() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();
        let id = Uuid::new_v4();

        ex.apply(&start(target, "a", id), now);
        ex.apply(
            &Message::PipelineStepStarted(PipelineStepStarted {
                pipeline: target,
                step_execution_id: id,
                child_pipeline_execution_id: None,
            }),
            now,
        );

        let retry = match start(target, "a", id) {
            Message::PipelineStepStart(mut c) => {
                c.attempt = 2;
                Message::PipelineStepStart(c)
            }
            _ => unreachable!(),
        };
        ex.apply(&retry, now);

        let pe = ex.root().unwrap();
        assert_eq!(pe.step_executions.len(), 1);
        let s = pe.step_status["a"];
        assert_eq!((s.queued, s.started), (1, 0));
        assert_eq!(ex.step_executions[&id].attempt, 2);
    }

    #[test]
    fn test_terminal_pipeline_status_is_sticky() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();

        ex.apply(
            &Message::PipelineFailed(crate::domain::events::PipelineFail {
                pipeline: target,
                error: ErrorInfo::new(ErrorKind::Internal, "boom"),
            }),
            now,
        );
        ex.apply(
            &Message::PipelineFinished(crate::domain::events::PipelineFinished {
                pipeline: target,
                output: Value::Null,
            }),
            now,
        );

        let pe = ex.root().unwrap();
        assert_eq!(pe.status, PipelineStatus::Failed);
        assert_eq!(pe.error.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_step_outputs_keep_failed_as_null() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();
        let id = Uuid::new_v4();

        ex.apply(&start(target, "a", id), now);
        ex.apply(
            &Message::PipelineStepFailed(PipelineStepFailed {
                pipeline: target,
                step_execution_id: id,
                error: ErrorInfo::new(ErrorKind::PrimitiveFailure, "nope"),
            }),
            now,
        );

        let outputs = ex.step_outputs(target.pipeline_execution_id);
        assert_eq!(outputs["a"], Value::Null);
        assert!(ex.root().unwrap().has_step_failures());
    }

    #[test]
    fn test_planned_executions_pending_until_started() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();
        let id = Uuid::new_v4();

        ex.apply(&planned(target, "a", id), now);
        let pe = ex.root().unwrap();
        assert!(pe.is_pending(id));
        assert_eq!(pe.pending_steps[0].step_name, "a");

        ex.apply(&start(target, "a", id), now);
        assert!(ex.root().unwrap().pending_steps.is_empty());
    }

    #[test]
    fn test_plan_after_pause_keeps_pipeline_paused() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();

        ex.apply(&Message::PipelinePaused(target), now);
        ex.apply(&planned(target, "a", Uuid::new_v4()), now);

        let pe = ex.root().unwrap();
        assert_eq!(pe.status, PipelineStatus::Paused);
        assert!(!pe.is_running());

        ex.apply(&Message::PipelineResumed(target), now);
        assert_eq!(ex.root().unwrap().status, PipelineStatus::Planned);
    }

    #[test]
    fn test_skipped_step_completes_without_output() {
        let (mut ex, target) = loaded_execution();
        let now = Utc::now();
        let id = Uuid::new_v4();

        ex.apply(&planned(target, "a", id), now);
        ex.apply(&start(target, "a", id), now);
        ex.apply(
            &Message::PipelineStepFinished(PipelineStepFinished {
                pipeline: target,
                step_execution_id: id,
                output: Value::Null,
                skipped: true,
            }),
            now,
        );

        let pe = ex.root().unwrap();
        let s = pe.step_status["a"];
        assert_eq!((s.skipped, s.finished, s.failed), (1, 0, 0));
        assert!(s.is_complete());
        assert_eq!(s.progress(), 100);
        assert!(!pe.has_step_failures());
        assert_eq!(ex.step_executions[&id].status, StepExecutionStatus::Skipped);
        assert_eq!(ex.step_outputs(target.pipeline_execution_id)["a"], Value::Null);
    }
}
