//! Cloneable façade for feeding commands into the runtime.
//!
//! [`RuntimeHandle`] hides channel plumbing. Commands submitted through it
//! are replayed on every replica at the next tick the runtime runs.
use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};

use super::errors::{Result, RuntimeError};
use crate::events::{Event, EventBus, Topic};
use crate::sim::SimCommand;

/// Client-facing handle to interact with the runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    command_tx: mpsc::Sender<SimCommand>,
    event_bus: EventBus,
}

impl RuntimeHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SimCommand>, event_bus: EventBus) -> Self {
        Self {
            command_tx,
            event_bus,
        }
    }

    /// Queue a command for the next tick.
    ///
    /// Waits while the command buffer is full.
    pub async fn submit(&self, command: SimCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RuntimeError::CommandChannelClosed)
    }

    /// Queue a command without waiting.
    ///
    /// A full buffer hands the command back in
    /// [`RuntimeError::CommandBufferFull`].
    pub fn try_submit(&self, command: SimCommand) -> Result<()> {
        self.command_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(command) => RuntimeError::CommandBufferFull(command),
            mpsc::error::TrySendError::Closed(_) => RuntimeError::CommandChannelClosed,
        })
    }

    /// Subscribe to events from a specific topic
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use runtime::Topic;
    ///
    /// let mut divergence = handle.subscribe(Topic::Divergence);
    /// while let Ok(event) = divergence.recv().await {
    ///     // replicas disagreed
    /// }
    /// ```
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe(topic)
    }

    /// Subscribe to multiple topics at once
    pub fn subscribe_multiple(
        &self,
        topics: &[Topic],
    ) -> HashMap<Topic, broadcast::Receiver<Event>> {
        self.event_bus.subscribe_multiple(topics)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}
