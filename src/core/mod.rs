//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only event log per execution
//! - Pipeline: Pipeline definitions, validation and providers
//! - Planner, for-each expansion and templates: what runs next, with what input
//! - Engine, commands and reactions: the command/event handler pipeline
//! - Nested: child pipelines spawned by `pipeline` steps
//! - Orchestrator: Public entry point

pub mod bus;
pub mod commands;
pub mod engine;
pub mod event_store;
pub mod for_each;
pub mod nested;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod reactions;
pub mod template;

// Re-export commonly used types
pub use bus::{CommandHandler, EventHandler, Handlers};
pub use engine::Engine;
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipeline::{
    DefinitionProvider, DirectoryDefinitions, ErrorConfig, InMemoryDefinitions,
    PipelineDefinition, RetryPolicy, StepDefinition, PIPELINE_STEP_TYPE,
};
