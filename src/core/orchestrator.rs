//! Public entry point for running and controlling pipelines.
//!
//! The [`Orchestrator`] owns the engine and turns user intent (run, cancel,
//! pause, resume, recover) into commands on the bus. State is always read
//! back from the event log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{self, EngineSettings};
use crate::domain::{
    Envelope, Execution, Message, PipelineCancel, PipelineQueue, PipelineRef, PipelineStatus,
    PipelineStepStart,
};
use crate::error::{OrchestratorError, Result};
use crate::primitives::PrimitiveRegistry;

use super::bus::Handlers;
use super::commands;
use super::engine::Engine;
use super::event_store::EventStore;
use super::nested;
use super::pipeline::{DefinitionProvider, DirectoryDefinitions};
use super::reactions;

/// Main pipeline orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

/// Builds an [`Orchestrator`]; anything left unset comes from the
/// resolved configuration
#[derive(Default)]
pub struct OrchestratorBuilder {
    executions_dir: Option<PathBuf>,
    definitions: Option<Arc<dyn DefinitionProvider>>,
    primitives: Option<PrimitiveRegistry>,
    settings: Option<EngineSettings>,
}

impl OrchestratorBuilder {
    /// Where execution logs live
    pub fn executions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.executions_dir = Some(dir.into());
        self
    }

    pub fn definitions(mut self, definitions: impl DefinitionProvider + 'static) -> Self {
        self.definitions = Some(Arc::new(definitions));
        self
    }

    pub fn primitives(mut self, primitives: PrimitiveRegistry) -> Self {
        self.primitives = Some(primitives);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let executions_dir = match self.executions_dir {
            Some(dir) => dir,
            None => config::executions_dir()?,
        };
        let definitions: Arc<dyn DefinitionProvider> = match self.definitions {
            Some(definitions) => definitions,
            None => Arc::new(DirectoryDefinitions::new(config::pipelines_dir()?)),
        };
        let primitives = match self.primitives {
            Some(primitives) => primitives,
            None => PrimitiveRegistry::with_defaults(&config::config()?.primitives)?,
        };
        let settings = match self.settings {
            Some(settings) => settings,
            None => config::config()?.engine.clone(),
        };

        let handlers = reactions::register(commands::register(Handlers::new()));
        Ok(Orchestrator {
            engine: Arc::new(Engine::new(
                executions_dir,
                definitions,
                primitives,
                settings,
                handlers,
            )),
        })
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// An orchestrator wired entirely from configuration
    pub fn from_config() -> Result<Self> {
        Self::builder().build()
    }

    pub fn definitions(&self) -> &dyn DefinitionProvider {
        self.engine.definitions()
    }

    pub fn primitives(&self) -> &PrimitiveRegistry {
        self.engine.primitives()
    }

    /// Every logged message, as it is logged
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.engine.subscribe()
    }

    /// Start a new execution of `name` and return without waiting
    #[instrument(skip(self, args))]
    pub async fn queue(&self, name: &str, args: Map<String, Value>) -> Result<PipelineRef> {
        let target = PipelineRef::new(Uuid::new_v4(), Uuid::new_v4());
        info!(execution_id = %target.execution_id, "Queueing pipeline");

        self.engine
            .send(Message::PipelineQueue(PipelineQueue {
                pipeline: target,
                name: name.to_string(),
                args,
                parent_step_execution_id: None,
            }))
            .await?;
        Ok(target)
    }

    /// Run `name` to completion and return the final execution state
    pub async fn run(&self, name: &str, args: Map<String, Value>) -> Result<Execution> {
        let target = self.queue(name, args).await?;
        self.wait(target.execution_id).await
    }

    /// Wait until the root pipeline of an execution reaches a terminal
    /// state. Also polls the log, so runs driven by another process are
    /// picked up.
    pub async fn wait(&self, execution_id: Uuid) -> Result<Execution> {
        let mut notifications = self.engine.subscribe();
        let poll = Duration::from_millis(self.engine.settings().poll_interval_ms.max(10));

        loop {
            let execution = self.engine.load(execution_id).await?;
            if execution.root().map_or(false, |root| root.is_terminal()) {
                return Ok(execution);
            }

            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => tokio::time::sleep(poll).await,
                },
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Current state of an execution
    pub async fn status(&self, execution_id: Uuid) -> Result<Execution> {
        self.engine.load(execution_id).await
    }

    /// Raw log of an execution
    pub async fn events(&self, execution_id: Uuid) -> Result<Vec<Envelope>> {
        let store = self.engine.store(execution_id);
        if !store.exists() {
            return Err(OrchestratorError::not_found(format!(
                "Execution {} not found",
                execution_id
            )));
        }
        Ok(store.replay().await?)
    }

    /// Every execution under the executions directory, newest first
    pub async fn list(&self) -> Result<Vec<Execution>> {
        let ids = EventStore::list_executions(self.engine.executions_dir()).await?;

        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.engine.load(id).await {
                Ok(execution) => executions.push(execution),
                Err(err) => warn!(execution_id = %id, error = %err, "Skipping unreadable execution"),
            }
        }
        executions.sort_by_key(|e| std::cmp::Reverse(e.root().map(|r| r.queued_at).ok()));
        Ok(executions)
    }

    /// Cancel the root pipeline; running children are canceled in turn
    pub async fn cancel(&self, execution_id: Uuid, reason: Option<String>) -> Result<()> {
        let (root, status) = self.root_of(execution_id).await?;
        if status.is_terminal() {
            return Err(OrchestratorError::bad_request(format!(
                "Execution {} has already finished",
                execution_id
            )));
        }

        self.engine
            .send(Message::PipelineCancel(PipelineCancel {
                pipeline: root,
                reason,
            }))
            .await
    }

    /// Stop planning new steps for the root pipeline
    pub async fn pause(&self, execution_id: Uuid) -> Result<()> {
        let (root, status) = self.root_of(execution_id).await?;
        if !matches!(status, PipelineStatus::Started | PipelineStatus::Planned) {
            return Err(OrchestratorError::bad_request(format!(
                "Execution {} is {}, only running executions can be paused",
                execution_id,
                status.as_str()
            )));
        }
        self.engine.send(Message::PipelinePause(root)).await
    }

    /// Resume a paused root pipeline
    pub async fn resume(&self, execution_id: Uuid) -> Result<()> {
        let (root, status) = self.root_of(execution_id).await?;
        if status != PipelineStatus::Paused {
            return Err(OrchestratorError::bad_request(format!(
                "Execution {} is not paused",
                execution_id
            )));
        }
        self.engine.send(Message::PipelineResume(root)).await
    }

    /// Pick up an execution whose process died mid-run.
    ///
    /// Every non-terminal, non-paused pipeline execution is nudged forward
    /// from its last recorded state: planned executions that never got a
    /// start command are started, unfinished steps are started again,
    /// terminal children are reported to their parent step, and a plan is
    /// issued so completed pipelines finish.
    #[instrument(skip(self))]
    pub async fn recover(&self, execution_id: Uuid) -> Result<()> {
        let execution = self.engine.load(execution_id).await?;
        if execution.root()?.is_terminal() {
            return Err(OrchestratorError::bad_request(format!(
                "Execution {} has already finished",
                execution_id
            )));
        }

        for pe in execution.pipeline_executions.values() {
            let target = PipelineRef::new(execution_id, pe.id);
            match pe.status {
                PipelineStatus::Queued => self.engine.send(Message::PipelineLoad(target)).await?,
                PipelineStatus::Loaded => self.engine.send(Message::PipelineStart(target)).await?,
                PipelineStatus::Started | PipelineStatus::Planned => {
                    if !pe.pending_steps.is_empty() {
                        info!(pending = pe.pending_steps.len(), "Starting planned steps");
                        reactions::start_pending(&self.engine, &execution, target).await?;
                    }
                    for se in execution.steps_of(pe.id) {
                        if se.status.is_terminal() {
                            continue;
                        }
                        if let Some(child_id) = se.child_pipeline_execution_id {
                            // Running children recover on their own
                            if let Some(finish) = execution
                                .pipeline_executions
                                .get(&child_id)
                                .and_then(|child| nested::parent_step_finish(&execution, child))
                            {
                                self.engine.send(finish).await?;
                            }
                            continue;
                        }

                        info!(step = %se.name, status = se.status.as_str(), "Restarting step");
                        self.engine
                            .send(Message::PipelineStepStart(PipelineStepStart {
                                pipeline: target,
                                step_execution_id: se.id,
                                step_name: se.name.clone(),
                                input: se.input.clone(),
                                for_each: se.for_each.clone(),
                                attempt: se.attempt,
                                retries_remaining: se.retries_remaining,
                                loop_index: se.loop_index,
                                skip: se.skip,
                                idempotency_key: se.idempotency_key.clone(),
                            }))
                            .await?;
                    }
                    self.engine.send(Message::PipelinePlan(target)).await?;
                }
                PipelineStatus::Paused
                | PipelineStatus::Finished
                | PipelineStatus::Failed
                | PipelineStatus::Canceled => {}
            }
        }
        Ok(())
    }

    async fn root_of(&self, execution_id: Uuid) -> Result<(PipelineRef, PipelineStatus)> {
        let execution = self.engine.load(execution_id).await?;
        let root = execution.root()?;
        Ok((PipelineRef::new(execution_id, root.id), root.status))
    }
}
