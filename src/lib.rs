//! pipeflow - Event-sourced workflow orchestrator
//!
//! Runs pipelines of dependent steps. Steps are planned as their
//! dependencies complete, can fan out over a list or map, and can run
//! whole pipelines as children.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every command and event is appended to the execution's log first
//! - Current state is derived by replaying the log
//! - Handlers turn commands into events; reactions turn events into the
//!   next commands
//! - A crashed run can be recovered from its log
//!
//! # Modules
//!
//! - `core`: Orchestration logic (EventStore, Planner, Engine, Orchestrator)
//! - `domain`: Data structures (Message, Execution)
//! - `primitives`: The work behind each step type
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! pipeflow run deploy --arg env=staging
//!
//! # Check execution status
//! pipeflow status <execution-id>
//!
//! # Pick up an interrupted execution
//! pipeflow resume <execution-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod primitives;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, PipelineDefinition, StepDefinition};
pub use domain::{Envelope, EventType, Execution, Message, PipelineStatus};
pub use error::{ErrorInfo, ErrorKind, OrchestratorError, Result};
pub use primitives::{Primitive, PrimitiveRegistry, StepContext};
