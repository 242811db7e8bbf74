//! Commands and events for the event-sourced orchestrator.
//!
//! Commands express intent, events record facts. Both are written to the
//! execution's append-only log as an [`Envelope`] before any handler sees
//! them, so a run can always be rebuilt by replaying its log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::pipeline::PipelineDefinition;
use crate::error::{ErrorInfo, OrchestratorError, Result};

/// A single line in the append-only event log.
///
/// Written once, never mutated. The payload shape depends on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command or event name (e.g. "pipeline_step_finished")
    pub event_type: String,

    /// When the envelope was written (RFC 3339)
    pub timestamp: DateTime<Utc>,

    /// Message payload
    pub payload: Value,
}

/// Every command and event the engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Commands
    PipelineQueue,
    PipelineLoad,
    PipelineStart,
    PipelinePlan,
    PipelineStepStart,
    PipelineStepFinish,
    PipelineFinish,
    PipelineFail,
    PipelineCancel,
    PipelinePause,
    PipelineResume,

    // Events
    PipelineQueued,
    PipelineLoaded,
    PipelineStarted,
    PipelinePlanned,
    PipelineStepStarted,
    PipelineStepFinished,
    PipelineStepFailed,
    PipelineFinished,
    PipelineFailed,
    PipelineCanceled,
    PipelinePaused,
    PipelineResumed,
}

impl EventType {
    pub const ALL: [EventType; 23] = [
        Self::PipelineQueue,
        Self::PipelineLoad,
        Self::PipelineStart,
        Self::PipelinePlan,
        Self::PipelineStepStart,
        Self::PipelineStepFinish,
        Self::PipelineFinish,
        Self::PipelineFail,
        Self::PipelineCancel,
        Self::PipelinePause,
        Self::PipelineResume,
        Self::PipelineQueued,
        Self::PipelineLoaded,
        Self::PipelineStarted,
        Self::PipelinePlanned,
        Self::PipelineStepStarted,
        Self::PipelineStepFinished,
        Self::PipelineStepFailed,
        Self::PipelineFinished,
        Self::PipelineFailed,
        Self::PipelineCanceled,
        Self::PipelinePaused,
        Self::PipelineResumed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineQueue => "pipeline_queue",
            Self::PipelineLoad => "pipeline_load",
            Self::PipelineStart => "pipeline_start",
            Self::PipelinePlan => "pipeline_plan",
            Self::PipelineStepStart => "pipeline_step_start",
            Self::PipelineStepFinish => "pipeline_step_finish",
            Self::PipelineFinish => "pipeline_finish",
            Self::PipelineFail => "pipeline_fail",
            Self::PipelineCancel => "pipeline_cancel",
            Self::PipelinePause => "pipeline_pause",
            Self::PipelineResume => "pipeline_resume",
            Self::PipelineQueued => "pipeline_queued",
            Self::PipelineLoaded => "pipeline_loaded",
            Self::PipelineStarted => "pipeline_started",
            Self::PipelinePlanned => "pipeline_planned",
            Self::PipelineStepStarted => "pipeline_step_started",
            Self::PipelineStepFinished => "pipeline_step_finished",
            Self::PipelineStepFailed => "pipeline_step_failed",
            Self::PipelineFinished => "pipeline_finished",
            Self::PipelineFailed => "pipeline_failed",
            Self::PipelineCanceled => "pipeline_canceled",
            Self::PipelinePaused => "pipeline_paused",
            Self::PipelineResumed => "pipeline_resumed",
        }
    }

    /// Commands go to exactly one handler; events to zero or more
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::PipelineQueue
                | Self::PipelineLoad
                | Self::PipelineStart
                | Self::PipelinePlan
                | Self::PipelineStepStart
                | Self::PipelineStepFinish
                | Self::PipelineFinish
                | Self::PipelineFail
                | Self::PipelineCancel
                | Self::PipelinePause
                | Self::PipelineResume
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| OrchestratorError::not_found(format!("Unknown event type '{}'", s)))
    }
}

/// Identifies the pipeline execution a message targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineRef {
    /// Execution (and log) the pipeline belongs to
    pub execution_id: Uuid,

    /// Pipeline execution within that execution
    pub pipeline_execution_id: Uuid,
}

impl PipelineRef {
    pub fn new(execution_id: Uuid, pipeline_execution_id: Uuid) -> Self {
        Self {
            execution_id,
            pipeline_execution_id,
        }
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.execution_id, self.pipeline_execution_id)
    }
}

/// Payload of `pipeline_queue` and `pipeline_queued`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineQueue {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    /// Name of the pipeline definition to run
    pub name: String,

    /// Run-time arguments
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Step that spawned this pipeline, for nested pipelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_execution_id: Option<Uuid>,
}

/// Payload of `pipeline_loaded`: a snapshot of the definition, so replay
/// never depends on the definition provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLoaded {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub definition: PipelineDefinition,
}

/// Element context for one for-each step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachContext {
    /// Position in enumeration order (0-based)
    pub index: usize,

    /// Number of elements in the expansion
    pub total_count: usize,

    /// List index or map key of the element
    pub key: Value,

    /// The element itself
    pub value: Value,
}

/// One concrete execution decided by a planning pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedExecution {
    pub step_execution_id: Uuid,

    /// Resolved input
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachContext>,

    /// The step's `if` condition was false
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,
}

/// A step chosen by the planner and its expansion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStep {
    pub step_name: String,

    /// Zero or more executions (zero for an empty for-each)
    pub executions: Vec<PlannedExecution>,
}

/// Payload of `pipeline_planned`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlanned {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    #[serde(default)]
    pub next_steps: Vec<NextStep>,
}

impl PipelinePlanned {
    /// Total number of step executions across all planned steps
    pub fn execution_count(&self) -> usize {
        self.next_steps.iter().map(|s| s.executions.len()).sum()
    }
}

/// Payload of `pipeline_step_start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepStart {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub step_execution_id: Uuid,

    pub step_name: String,

    /// Resolved input handed to the primitive
    #[serde(default)]
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachContext>,

    /// 1 for the first attempt, incremented on each retry
    pub attempt: u32,

    /// Retries left after this attempt
    #[serde(default)]
    pub retries_remaining: u32,

    /// Loop iteration, 0 for the first run
    #[serde(default, skip_serializing_if = "is_zero")]
    pub loop_index: u32,

    /// Record the step as skipped instead of running it
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,

    /// "{execution_id}:{step}:{input_hash}"
    pub idempotency_key: String,
}

impl PipelineStepStart {
    /// First attempt of a planned execution
    pub fn planned(
        pipeline: PipelineRef,
        step_name: &str,
        planned: &PlannedExecution,
        retries: u32,
        idempotency_key: String,
    ) -> Self {
        Self {
            pipeline,
            step_execution_id: planned.step_execution_id,
            step_name: step_name.to_string(),
            input: planned.input.clone(),
            for_each: planned.for_each.clone(),
            attempt: 1,
            retries_remaining: retries,
            loop_index: 0,
            skip: planned.skip,
            idempotency_key,
        }
    }
}

/// Payload of `pipeline_step_started`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepStarted {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub step_execution_id: Uuid,

    /// Child pipeline spawned by a `pipeline` step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_pipeline_execution_id: Option<Uuid>,
}

/// Payload of `pipeline_step_finish`: completion reported from outside the
/// step task (a finished child pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepFinish {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub step_execution_id: Uuid,

    #[serde(default)]
    pub output: Value,

    #[serde(flatten)]
    pub error: Option<ErrorInfo>,

    /// The step did not run because its condition was false
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
}

/// Payload of `pipeline_step_finished`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepFinished {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub step_execution_id: Uuid,

    #[serde(default)]
    pub output: Value,

    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
}

/// Payload of `pipeline_step_failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepFailed {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    pub step_execution_id: Uuid,

    #[serde(flatten)]
    pub error: ErrorInfo,
}

/// Payload of `pipeline_finished`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFinished {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    /// Rendered output template (null when the definition has none)
    #[serde(default)]
    pub output: Value,
}

/// Payload of `pipeline_fail` and `pipeline_failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFail {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    #[serde(flatten)]
    pub error: ErrorInfo,
}

/// Payload of `pipeline_cancel` and `pipeline_canceled`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCancel {
    #[serde(flatten)]
    pub pipeline: PipelineRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A typed command or event
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Commands
    PipelineQueue(PipelineQueue),
    PipelineLoad(PipelineRef),
    PipelineStart(PipelineRef),
    PipelinePlan(PipelineRef),
    PipelineStepStart(PipelineStepStart),
    PipelineStepFinish(PipelineStepFinish),
    PipelineFinish(PipelineRef),
    PipelineFail(PipelineFail),
    PipelineCancel(PipelineCancel),
    PipelinePause(PipelineRef),
    PipelineResume(PipelineRef),

    // Events
    PipelineQueued(PipelineQueue),
    PipelineLoaded(PipelineLoaded),
    PipelineStarted(PipelineRef),
    PipelinePlanned(PipelinePlanned),
    PipelineStepStarted(PipelineStepStarted),
    PipelineStepFinished(PipelineStepFinished),
    PipelineStepFailed(PipelineStepFailed),
    PipelineFinished(PipelineFinished),
    PipelineFailed(PipelineFail),
    PipelineCanceled(PipelineCancel),
    PipelinePaused(PipelineRef),
    PipelineResumed(PipelineRef),
}

impl Message {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PipelineQueue(_) => EventType::PipelineQueue,
            Self::PipelineLoad(_) => EventType::PipelineLoad,
            Self::PipelineStart(_) => EventType::PipelineStart,
            Self::PipelinePlan(_) => EventType::PipelinePlan,
            Self::PipelineStepStart(_) => EventType::PipelineStepStart,
            Self::PipelineStepFinish(_) => EventType::PipelineStepFinish,
            Self::PipelineFinish(_) => EventType::PipelineFinish,
            Self::PipelineFail(_) => EventType::PipelineFail,
            Self::PipelineCancel(_) => EventType::PipelineCancel,
            Self::PipelinePause(_) => EventType::PipelinePause,
            Self::PipelineResume(_) => EventType::PipelineResume,
            Self::PipelineQueued(_) => EventType::PipelineQueued,
            Self::PipelineLoaded(_) => EventType::PipelineLoaded,
            Self::PipelineStarted(_) => EventType::PipelineStarted,
            Self::PipelinePlanned(_) => EventType::PipelinePlanned,
            Self::PipelineStepStarted(_) => EventType::PipelineStepStarted,
            Self::PipelineStepFinished(_) => EventType::PipelineStepFinished,
            Self::PipelineStepFailed(_) => EventType::PipelineStepFailed,
            Self::PipelineFinished(_) => EventType::PipelineFinished,
            Self::PipelineFailed(_) => EventType::PipelineFailed,
            Self::PipelineCanceled(_) => EventType::PipelineCanceled,
            Self::PipelinePaused(_) => EventType::PipelinePaused,
            Self::PipelineResumed(_) => EventType::PipelineResumed,
        }
    }

    /// The pipeline execution this message targets
    pub fn pipeline(&self) -> PipelineRef {
        match self {
            Self::PipelineLoad(r)
            | Self::PipelineStart(r)
            | Self::PipelinePlan(r)
            | Self::PipelineFinish(r)
            | Self::PipelinePause(r)
            | Self::PipelineResume(r)
            | Self::PipelineStarted(r)
            | Self::PipelinePaused(r)
            | Self::PipelineResumed(r) => *r,
            Self::PipelineQueue(p) | Self::PipelineQueued(p) => p.pipeline,
            Self::PipelineStepStart(p) => p.pipeline,
            Self::PipelineStepFinish(p) => p.pipeline,
            Self::PipelineFail(p) | Self::PipelineFailed(p) => p.pipeline,
            Self::PipelineCancel(p) | Self::PipelineCanceled(p) => p.pipeline,
            Self::PipelineLoaded(p) => p.pipeline,
            Self::PipelinePlanned(p) => p.pipeline,
            Self::PipelineStepStarted(p) => p.pipeline,
            Self::PipelineStepFinished(p) => p.pipeline,
            Self::PipelineStepFailed(p) => p.pipeline,
            Self::PipelineFinished(p) => p.pipeline,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.pipeline().execution_id
    }

    pub fn is_command(&self) -> bool {
        self.event_type().is_command()
    }

    /// Wrap this message in a log envelope stamped with the current time
    pub fn to_envelope(&self) -> Result<Envelope> {
        let payload = match self {
            Self::PipelineLoad(r)
            | Self::PipelineStart(r)
            | Self::PipelinePlan(r)
            | Self::PipelineFinish(r)
            | Self::PipelinePause(r)
            | Self::PipelineResume(r)
            | Self::PipelineStarted(r)
            | Self::PipelinePaused(r)
            | Self::PipelineResumed(r) => serde_json::to_value(r)?,
            Self::PipelineQueue(p) | Self::PipelineQueued(p) => serde_json::to_value(p)?,
            Self::PipelineStepStart(p) => serde_json::to_value(p)?,
            Self::PipelineStepFinish(p) => serde_json::to_value(p)?,
            Self::PipelineFail(p) | Self::PipelineFailed(p) => serde_json::to_value(p)?,
            Self::PipelineCancel(p) | Self::PipelineCanceled(p) => serde_json::to_value(p)?,
            Self::PipelineLoaded(p) => serde_json::to_value(p)?,
            Self::PipelinePlanned(p) => serde_json::to_value(p)?,
            Self::PipelineStepStarted(p) => serde_json::to_value(p)?,
            Self::PipelineStepFinished(p) => serde_json::to_value(p)?,
            Self::PipelineStepFailed(p) => serde_json::to_value(p)?,
            Self::PipelineFinished(p) => serde_json::to_value(p)?,
        };

        Ok(Envelope {
            event_type: self.event_type().as_str().to_string(),
            timestamp: Utc::now(),
            payload,
        })
    }

    /// Decode an envelope. Unknown event types yield `Ok(None)`.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>> {
        let Ok(event_type) = envelope.event_type.parse::<EventType>() else {
            return Ok(None);
        };

        let p = &envelope.payload;
        let message = match event_type {
            EventType::PipelineQueue => Self::PipelineQueue(decode(event_type, p)?),
            EventType::PipelineLoad => Self::PipelineLoad(decode(event_type, p)?),
            EventType::PipelineStart => Self::PipelineStart(decode(event_type, p)?),
            EventType::PipelinePlan => Self::PipelinePlan(decode(event_type, p)?),
            EventType::PipelineStepStart => Self::PipelineStepStart(decode(event_type, p)?),
            EventType::PipelineStepFinish => Self::PipelineStepFinish(decode(event_type, p)?),
            EventType::PipelineFinish => Self::PipelineFinish(decode(event_type, p)?),
            EventType::PipelineFail => Self::PipelineFail(decode(event_type, p)?),
            EventType::PipelineCancel => Self::PipelineCancel(decode(event_type, p)?),
            EventType::PipelinePause => Self::PipelinePause(decode(event_type, p)?),
            EventType::PipelineResume => Self::PipelineResume(decode(event_type, p)?),
            EventType::PipelineQueued => Self::PipelineQueued(decode(event_type, p)?),
            EventType::PipelineLoaded => Self::PipelineLoaded(decode(event_type, p)?),
            EventType::PipelineStarted => Self::PipelineStarted(decode(event_type, p)?),
            EventType::PipelinePlanned => Self::PipelinePlanned(decode(event_type, p)?),
            EventType::PipelineStepStarted => Self::PipelineStepStarted(decode(event_type, p)?),
            EventType::PipelineStepFinished => {
                Self::PipelineStepFinished(decode(event_type, p)?)
            }
            EventType::PipelineStepFailed => Self::PipelineStepFailed(decode(event_type, p)?),
            EventType::PipelineFinished => Self::PipelineFinished(decode(event_type, p)?),
            EventType::PipelineFailed => Self::PipelineFailed(decode(event_type, p)?),
            EventType::PipelineCanceled => Self::PipelineCanceled(decode(event_type, p)?),
            EventType::PipelinePaused => Self::PipelinePaused(decode(event_type, p)?),
            EventType::PipelineResumed => Self::PipelineResumed(decode(event_type, p)?),
        };

        Ok(Some(message))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn decode<T: DeserializeOwned>(event_type: EventType, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        OrchestratorError::bad_request(format!("Malformed {} payload: {}", event_type, e))
    })
}
