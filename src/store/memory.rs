//! In-memory pass-through store, one instance per engine.

use super::{EngineStore, OutboxStore, RunStore, StoreState};
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::records::{Report, WorkTree};
use crate::domain::run::WorkflowRun;
use crate::domain::types::{
    CheckpointId, DeadLetterId, EventId, ReportId, RunId, TimestampUtc, WorkExecutionId,
};
use crate::domain::work::WorkExecution;
use crate::reliability::outbox::{DeadLetterRecord, OutboxMessage};
use crate::reliability::unit_of_work::{StagedWrite, TransactionMode};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> EngineResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::storage("memory store lock poisoned"))
    }

    /// Copy of everything stored, for inspection.
    pub fn snapshot(&self) -> EngineResult<StoreState> {
        Ok(self.state()?.clone())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn load_run(&self, id: RunId) -> EngineResult<Option<WorkflowRun>> {
        Ok(self.state()?.run(id))
    }

    async fn list_runs(&self) -> EngineResult<Vec<WorkflowRun>> {
        Ok(self.state()?.runs())
    }

    async fn load_work(&self, id: WorkExecutionId) -> EngineResult<Option<WorkExecution>> {
        Ok(self.state()?.work(id))
    }

    async fn list_works(&self, run_id: RunId) -> EngineResult<Vec<WorkExecution>> {
        Ok(self.state()?.works_of(run_id))
    }

    async fn load_checkpoint(&self, id: CheckpointId) -> EngineResult<Option<Checkpoint>> {
        Ok(self.state()?.checkpoint(id))
    }

    async fn list_checkpoints(&self, run_id: RunId) -> EngineResult<Vec<Checkpoint>> {
        Ok(self.state()?.checkpoints_of(run_id))
    }

    async fn list_work_trees(&self, run_id: RunId) -> EngineResult<Vec<WorkTree>> {
        Ok(self.state()?.work_trees_of(run_id))
    }

    async fn list_reports(&self, run_id: RunId) -> EngineResult<Vec<Report>> {
        Ok(self.state()?.reports_of(run_id))
    }

    async fn load_report(&self, id: ReportId) -> EngineResult<Option<Report>> {
        Ok(self.state()?.report(id))
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn fetch_unpublished(&self, limit: usize) -> EngineResult<Vec<OutboxMessage>> {
        Ok(self.state()?.unpublished(limit))
    }

    async fn mark_published(&self, event_id: EventId, at: TimestampUtc) -> EngineResult<()> {
        self.state()?.mark_published(event_id, at)
    }

    async fn record_failure(&self, event_id: EventId) -> EngineResult<u32> {
        self.state()?.record_failure(event_id)
    }

    async fn exile(&self, record: DeadLetterRecord) -> EngineResult<()> {
        self.state()?.exile(record)
    }

    async fn list_dead_letters(
        &self,
        include_resolved: bool,
    ) -> EngineResult<Vec<DeadLetterRecord>> {
        Ok(self.state()?.dead_letters(include_resolved))
    }

    async fn resolve_dead_letter(&self, id: DeadLetterId) -> EngineResult<DeadLetterRecord> {
        self.state()?.resolve_dead_letter(id)
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    fn mode(&self) -> TransactionMode {
        TransactionMode::PassThrough
    }

    async fn commit(&self, writes: Vec<StagedWrite>) -> EngineResult<()> {
        let mut state = self.state()?;
        for write in writes {
            state.apply(write)?;
        }
        Ok(())
    }
}
