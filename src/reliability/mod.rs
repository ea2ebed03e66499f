//! Reliability substrate: compensation, unit of work, event delivery.

pub mod compensation;
pub mod event_bus;
pub mod journal;
pub mod outbox;
pub mod unit_of_work;

pub use compensation::{Compensation, CompensationExecutor, CompensationStack};
pub use event_bus::{DeliveryFailure, EventHandler, EventPublisher, InProcessEventBus};
pub use journal::EventJournal;
pub use outbox::{DeadLetterRecord, OutboxMessage, OutboxRelay, RelayConfig, RelayReport, TransactionalOutbox};
pub use unit_of_work::{StagedWrite, TransactionMode, UnitOfWork};
