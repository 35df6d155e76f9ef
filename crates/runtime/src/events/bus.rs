//! Topic-based event bus implementation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::{DiagnosticEvent, DivergenceEvent, IdEvent, TickEvent};

/// Topics for event routing
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    /// Tick completion and per-tick digests
    Tick,
    /// Id block requests and grants
    Ids,
    /// Diagnostics reported by replica cores
    Diagnostics,
    /// Cross-replica divergence
    Divergence,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Tick, Topic::Ids, Topic::Diagnostics, Topic::Divergence];
}

/// Event wrapper that carries the topic and typed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Tick(TickEvent),
    Ids(IdEvent),
    Diagnostic(DiagnosticEvent),
    Divergence(DivergenceEvent),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Tick(_) => Topic::Tick,
            Event::Ids(_) => Topic::Ids,
            Event::Diagnostic(_) => Topic::Diagnostics,
            Event::Divergence(_) => Topic::Divergence,
        }
    }
}

/// Topic-based event bus
///
/// Consumers subscribe to the topics they care about. Publishing never
/// blocks; events for topics without subscribers are dropped.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<HashMap<Topic, broadcast::Sender<Event>>>,
}

impl EventBus {
    /// Creates a new event bus with default capacity for each topic
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Creates a new event bus with specified capacity per topic
    pub fn with_capacity(capacity: usize) -> Self {
        let channels = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity.max(1)).0))
            .collect();

        Self {
            channels: Arc::new(channels),
        }
    }

    /// Publish an event to its corresponding topic
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        if let Some(tx) = self.channels.get(&topic)
            && tx.send(event).is_err()
        {
            // No subscribers for this topic - this is normal, not an error
            tracing::trace!(target: "runtime::events", %topic, "no subscribers");
        }
    }

    /// Subscribe to a specific topic
    ///
    /// Returns a receiver that will only receive events for that topic.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        match self.channels.get(&topic) {
            Some(tx) => tx.subscribe(),
            // Every topic is created up front; a detached receiver reports `Closed`.
            None => broadcast::channel(1).1,
        }
    }

    /// Subscribe to multiple topics
    pub fn subscribe_multiple(
        &self,
        topics: &[Topic],
    ) -> HashMap<Topic, broadcast::Receiver<Event>> {
        topics
            .iter()
            .map(|&topic| (topic, self.subscribe(topic)))
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::Tick;

    #[tokio::test]
    async fn subscribers_only_see_their_topic() {
        let bus = EventBus::with_capacity(8);
        let mut ticks = bus.subscribe(Topic::Tick);
        let mut divergence = bus.subscribe(Topic::Divergence);

        bus.publish(Event::Tick(TickEvent {
            tick: Tick(1),
            digest: "00".into(),
            commands: 0,
        }));

        let received = ticks.recv().await.unwrap();
        assert!(matches!(received, Event::Tick(TickEvent { tick: Tick(1), .. })));
        assert!(divergence.try_recv().is_err());
    }
}
