//! Transactional outbox, relay and dead-letter records.
//!
//! Events are written to the outbox in the same commit as the state change
//! that produced them and handed to in-process subscribers right away. The
//! relay later delivers every unpublished message to the durable sinks,
//! exiling messages that keep failing to the dead-letter queue.

use crate::domain::errors::EngineResult;
use crate::domain::events::EventEnvelope;
use crate::domain::types::{DeadLetterId, EventId, TimestampUtc};
use crate::reliability::event_bus::{DeliveryFailure, EventPublisher};
use crate::reliability::unit_of_work::{StagedWrite, UnitOfWork};
use crate::store::{EngineStore, OutboxStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: String,
    pub payload: serde_json::Value,
    pub aggregate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: TimestampUtc,
    pub created_at: TimestampUtc,
    pub published: bool,
    pub published_at: Option<TimestampUtc>,
    pub retry_count: u32,
}

impl OutboxMessage {
    pub fn pending(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            event_version: envelope.event_version.clone(),
            payload: envelope.payload.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            occurred_at: envelope.occurred_at,
            created_at: TimestampUtc::now(),
            published: false,
            published_at: None,
            retry_count: 0,
        }
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            event_version: self.event_version.clone(),
            aggregate_id: self.aggregate_id.clone(),
            correlation_id: self.correlation_id.clone(),
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
        }
    }
}

/// A delivery that exhausted its retries. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    pub event_id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub aggregate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: TimestampUtc,
    pub handler_name: String,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resolved: bool,
    pub created_at: TimestampUtc,
    pub resolved_at: Option<TimestampUtc>,
}

impl DeadLetterRecord {
    pub fn new(
        message: &OutboxMessage,
        failure: &DeliveryFailure,
        retry_count: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            event_id: message.event_id,
            event_type: message.event_type.clone(),
            payload: message.payload.clone(),
            aggregate_id: message.aggregate_id.clone(),
            correlation_id: message.correlation_id.clone(),
            occurred_at: message.occurred_at,
            handler_name: failure.handler_name.clone(),
            error_message: failure.message.clone(),
            retry_count,
            max_retries,
            resolved: false,
            created_at: TimestampUtc::now(),
            resolved_at: None,
        }
    }
}

/// Commits units of work together with their outbox rows.
#[derive(Clone)]
pub struct TransactionalOutbox {
    store: Arc<dyn EngineStore>,
    local: Arc<dyn EventPublisher>,
}

impl TransactionalOutbox {
    pub fn new(store: Arc<dyn EngineStore>, local: Arc<dyn EventPublisher>) -> Self {
        Self { store, local }
    }

    /// Persists every staged write plus one outbox row per event, then
    /// publishes the events to in-process subscribers.
    ///
    /// Local delivery failures are logged; the relay still delivers the
    /// durable copy.
    pub async fn commit(&self, uow: UnitOfWork) -> EngineResult<Vec<EventEnvelope>> {
        let (mut writes, events) = uow.into_parts();
        writes.extend(
            events
                .iter()
                .map(|event| StagedWrite::AppendOutbox(OutboxMessage::pending(event))),
        );
        self.store.commit(writes).await?;

        for failure in self.local.publish_all(&events).await {
            tracing::warn!(
                handler = %failure.handler_name,
                event_id = %failure.event_id,
                error = %failure.message,
                "local event handler failed"
            );
        }
        Ok(events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// A message is exiled once its retry count exceeds this.
    pub max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Delivers one batch of unpublished messages, oldest first.
    pub async fn relay_once(&self) -> EngineResult<RelayReport> {
        let batch = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for message in batch {
            let outcome = match self.publisher.publish(&message.envelope()).await {
                Ok(()) => self
                    .store
                    .mark_published(message.event_id, TimestampUtc::now())
                    .await
                    .map(|_| report.delivered += 1),
                Err(failure) => self.handle_failure(&message, &failure, &mut report).await,
            };
            if let Err(err) = outcome {
                tracing::error!(
                    event_id = %message.event_id,
                    error = %err,
                    "outbox bookkeeping failed"
                );
            }
        }

        if report != RelayReport::default() {
            tracing::info!(
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "outbox relay batch"
            );
        }
        Ok(report)
    }

    async fn handle_failure(
        &self,
        message: &OutboxMessage,
        failure: &DeliveryFailure,
        report: &mut RelayReport,
    ) -> EngineResult<()> {
        let retry_count = self.store.record_failure(message.event_id).await?;
        if retry_count > self.config.max_retries {
            let record =
                DeadLetterRecord::new(message, failure, retry_count, self.config.max_retries);
            tracing::warn!(
                event_id = %message.event_id,
                event_type = %message.event_type,
                handler = %failure.handler_name,
                retry_count,
                error = %failure.message,
                "outbox message moved to dead-letter queue"
            );
            self.store.exile(record).await?;
            report.dead_lettered += 1;
        } else {
            report.retried += 1;
        }
        Ok(())
    }

    /// Runs `relay_once` on the configured interval until `shutdown` flips
    /// to true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.relay_once().await {
                            tracing::error!(error = %err, "outbox relay pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("outbox relay stopped");
        })
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
