//! Runtime shared by every handler: the log, the buses and the step limits.
//!
//! Every message goes through [`Engine::send`]: it is appended to the
//! execution's log, broadcast to subscribers, then delivered to its
//! handlers on a fresh task. A handler that panics is treated like one
//! that returned an internal error.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::domain::{Execution, Message, PipelineFail, PipelineRef};
use crate::error::{ErrorInfo, OrchestratorError, Result};
use crate::primitives::PrimitiveRegistry;

use super::bus::Handlers;
use super::event_store::EventStore;
use super::pipeline::DefinitionProvider;

/// Broadcast buffer per subscriber
const NOTIFICATION_CAPACITY: usize = 1024;

pub struct Engine {
    executions_dir: PathBuf,
    definitions: Arc<dyn DefinitionProvider>,
    primitives: PrimitiveRegistry,
    settings: EngineSettings,
    handlers: Handlers,
    step_slots: Arc<Semaphore>,
    planner_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    notifications: broadcast::Sender<Message>,
}

impl Engine {
    pub fn new(
        executions_dir: PathBuf,
        definitions: Arc<dyn DefinitionProvider>,
        primitives: PrimitiveRegistry,
        settings: EngineSettings,
        handlers: Handlers,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            executions_dir,
            definitions,
            step_slots: Arc::new(Semaphore::new(settings.max_concurrent_steps.max(1))),
            primitives,
            settings,
            handlers,
            planner_locks: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn executions_dir(&self) -> &Path {
        &self.executions_dir
    }

    pub fn definitions(&self) -> &dyn DefinitionProvider {
        self.definitions.as_ref()
    }

    pub fn primitives(&self) -> &PrimitiveRegistry {
        &self.primitives
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Log handle for one execution
    pub fn store(&self, execution_id: Uuid) -> EventStore {
        EventStore::at(&self.executions_dir, execution_id)
    }

    /// Rebuild an execution from its log
    pub async fn load(&self, execution_id: Uuid) -> Result<Execution> {
        let store = self.store(execution_id);
        if !store.exists() {
            return Err(OrchestratorError::not_found(format!(
                "Execution {} not found",
                execution_id
            )));
        }
        Ok(store.load().await?)
    }

    /// Receive every message after it has been logged
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.notifications.subscribe()
    }

    /// Serializes planning for one execution
    pub fn planner_lock(&self, execution_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.planner_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(execution_id).or_default())
    }

    /// Cancellation token for a pipeline execution, created on first use
    pub fn cancel_token(&self, pipeline_execution_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancel_tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.entry(pipeline_execution_id).or_default().clone()
    }

    /// Wait for a free step slot
    pub async fn acquire_step_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.step_slots)
            .acquire_owned()
            .await
            .map_err(|e| OrchestratorError::internal(format!("Step limiter closed: {}", e)))
    }

    /// Log a message, then deliver it to its handlers on a new task.
    ///
    /// Boxed: handlers running on tasks spawned here call back into it.
    pub fn send(self: &Arc<Self>, message: Message) -> BoxFuture<'_, Result<()>> {
        self.log_and_dispatch(message).boxed()
    }

    async fn log_and_dispatch(self: &Arc<Self>, message: Message) -> Result<()> {
        let envelope = message.to_envelope()?;
        let store = EventStore::open_in(&self.executions_dir, message.execution_id()).await?;
        store.append(&envelope).await?;

        debug!(
            execution_id = %message.execution_id(),
            event_type = %message.event_type(),
            "Logged"
        );

        // No subscribers is fine
        let _ = self.notifications.send(message.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.dispatch(message).await });
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, message: Message) {
        let event_type = message.event_type();

        if event_type.is_command() {
            let Some(handler) = self.handlers.command_handler(event_type) else {
                warn!(%event_type, "No handler for command");
                return;
            };
            if let Err(err) = guarded(handler.handle(&self, &message)).await {
                error!(
                    target_pipeline = %message.pipeline(),
                    %event_type,
                    error = %err,
                    "Command handler failed"
                );
                if let Err(err) = self.record_failure(message.pipeline(), &err).await {
                    error!(error = %err, "Failed to record pipeline failure");
                }
            }
            return;
        }

        for reaction in self.handlers.reactions_for(event_type) {
            let reaction = Arc::clone(reaction);
            let engine = Arc::clone(&self);
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = guarded(reaction.handle(&engine, &message)).await {
                    error!(
                        reaction = reaction.name(),
                        target_pipeline = %message.pipeline(),
                        error = %err,
                        "Event handler failed"
                    );
                    let fail = Message::PipelineFail(PipelineFail {
                        pipeline: message.pipeline(),
                        error: ErrorInfo::from(&err),
                    });
                    if let Err(err) = engine.send(fail).await {
                        error!(error = %err, "Failed to send pipeline_fail");
                    }
                }
            });
        }
    }

    /// A command handler error fails the pipeline it targeted
    async fn record_failure(self: &Arc<Self>, target: PipelineRef, err: &OrchestratorError) -> Result<()> {
        let lock = self.planner_lock(target.execution_id);
        let _guard = lock.lock().await;

        if let Ok(execution) = self.load(target.execution_id).await {
            if let Ok(pe) = execution.pipeline_execution(target.pipeline_execution_id) {
                if pe.is_terminal() {
                    debug!(%target, "Pipeline already terminal, not recording failure");
                    return Ok(());
                }
            }
        }

        self.send(Message::PipelineFailed(PipelineFail {
            pipeline: target,
            error: ErrorInfo::from(err),
        }))
        .await
    }
}

/// Run a handler, turning a panic into an internal error
async fn guarded<F>(handler: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(OrchestratorError::internal(format!(
            "Handler panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
