//! ABOUTME: EventBus — broadcast distribution of WorkflowEvents to subscribers
//! ABOUTME: Grounded on llmspell-events::bus::EventBus, slimmed to a single broadcast channel

use crate::event::WorkflowEvent;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1024;

/// In-process event bus. A real deployment fans this out to the external
/// event bus (spec.md §6); this crate only produces and locally
/// broadcasts — consumption is an external collaborator's job.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; `0` is not an error (nobody happened to be listening).
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!("event published with no active subscribers");
                0
            }
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
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
    use crate::event::EventKind;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::new(EventKind::StepStarted, "exec1", "agent1"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::StepStarted);
        assert_eq!(received.execution_id, "exec1");
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        let count = bus.publish(WorkflowEvent::new(EventKind::ExecutionCompleted, "exec1", "agent1"));
        assert_eq!(count, 0);
    }
}
