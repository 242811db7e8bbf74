//! Domain types for the pipeflow orchestrator.
//!
//! This module contains the core data structures:
//! - Events: commands and facts, and their log envelopes
//! - Execution: state rebuilt by replaying an execution's log

pub mod events;
pub mod execution;

pub use events::{
    Envelope, EventType, ForEachContext, Message, NextStep, PipelineCancel, PipelineFail,
    PipelineFinished, PipelineLoaded, PipelinePlanned, PipelineQueue, PipelineRef,
    PipelineStepFailed, PipelineStepFinish, PipelineStepFinished, PipelineStepStart,
    PipelineStepStarted, PlannedExecution,
};
pub use execution::{
    Execution, PendingStep, PipelineExecution, PipelineStatus, StepExecution, StepExecutionStatus,
    StepStatus,
};
