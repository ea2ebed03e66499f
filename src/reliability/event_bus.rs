//! In-process publish/subscribe for domain events.

use crate::domain::events::EventEnvelope;
use crate::domain::types::EventId;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// A handler failed to process an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler {handler_name} failed on event {event_id}: {message}")]
pub struct DeliveryFailure {
    pub handler_name: String,
    pub event_id: EventId,
    pub message: String,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, recorded in dead letters.
    fn name(&self) -> &str;

    fn handles(&self, _event_type: &str) -> bool {
        true
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers to every interested handler; reports the first failure
    /// after all handlers have been tried.
    async fn publish(&self, event: &EventEnvelope) -> Result<(), DeliveryFailure>;

    /// Publishes in order and returns every failure.
    async fn publish_all(&self, events: &[EventEnvelope]) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        for event in events {
            if let Err(failure) = self.publish(event).await {
                failures.push(failure);
            }
        }
        failures
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>);

    /// Removes every handler registered under `handler_name`.
    fn unsubscribe(&self, handler_name: &str) -> bool;
}

#[derive(Default)]
pub struct InProcessEventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    fn interested(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers
                .iter()
                .filter(|h| h.handles(event_type))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), DeliveryFailure> {
        let mut first_failure = None;
        for handler in self.interested(&event.event_type) {
            if let Err(err) = handler.handle(event).await {
                tracing::debug!(
                    handler = handler.name(),
                    event_id = %event.event_id,
                    error = %err,
                    "event handler failed"
                );
                first_failure.get_or_insert(DeliveryFailure {
                    handler_name: handler.name().to_string(),
                    event_id: event.event_id,
                    message: format!("{:#}", err),
                });
            }
        }
        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    fn unsubscribe(&self, handler_name: &str) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|h| h.name() != handler_name);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }
}
