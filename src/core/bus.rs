//! Handler traits and the routing table behind the command and event buses.
//!
//! Commands have exactly one handler each. Events fan out to any number of
//! reactions. The [`Engine`](super::engine::Engine) appends every message
//! to the log before looking a handler up here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{EventType, Message};
use crate::error::Result;

use super::engine::Engine;

/// Handles one command type: validate, do the side effect, emit the event
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The command this handler consumes
    fn handles(&self) -> EventType;

    async fn handle(&self, engine: &Arc<Engine>, command: &Message) -> Result<()>;
}

/// Reacts to an event by issuing follow-up commands
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Events this reaction subscribes to
    fn handles(&self) -> &'static [EventType];

    async fn handle(&self, engine: &Arc<Engine>, event: &Message) -> Result<()>;
}

/// Routing table from message type to handlers
#[derive(Default, Clone)]
pub struct Handlers {
    commands: HashMap<EventType, Arc<dyn CommandHandler>>,
    reactions: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler, replacing any previous one for the type
    pub fn command(mut self, handler: impl CommandHandler + 'static) -> Self {
        let handler: Arc<dyn CommandHandler> = Arc::new(handler);
        self.commands.insert(handler.handles(), handler);
        self
    }

    /// Subscribe a reaction to each of its event types
    pub fn reaction(mut self, handler: impl EventHandler + 'static) -> Self {
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        for event_type in handler.handles() {
            self.reactions
                .entry(*event_type)
                .or_default()
                .push(Arc::clone(&handler));
        }
        self
    }

    pub fn command_handler(&self, event_type: EventType) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(&event_type).cloned()
    }

    pub fn reactions_for(&self, event_type: EventType) -> &[Arc<dyn EventHandler>] {
        self.reactions
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Command types without a handler
    pub fn unhandled_commands(&self) -> Vec<EventType> {
        EventType::ALL
            .iter()
            .copied()
            .filter(|t| t.is_command() && !self.commands.contains_key(t))
            .collect()
    }
}
