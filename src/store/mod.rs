//! Persistence for runs, their records, and the outbox.
//!
//! Both backends share `StoreState`; they differ only in how a committed
//! batch of writes reaches it.

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

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
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read side of run state.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_run(&self, id: RunId) -> EngineResult<Option<WorkflowRun>>;
    async fn list_runs(&self) -> EngineResult<Vec<WorkflowRun>>;
    async fn load_work(&self, id: WorkExecutionId) -> EngineResult<Option<WorkExecution>>;
    /// Executions of a run in sequence order.
    async fn list_works(&self, run_id: RunId) -> EngineResult<Vec<WorkExecution>>;
    async fn load_checkpoint(&self, id: CheckpointId) -> EngineResult<Option<Checkpoint>>;
    async fn list_checkpoints(&self, run_id: RunId) -> EngineResult<Vec<Checkpoint>>;
    async fn list_work_trees(&self, run_id: RunId) -> EngineResult<Vec<WorkTree>>;
    async fn list_reports(&self, run_id: RunId) -> EngineResult<Vec<Report>>;
    async fn load_report(&self, id: ReportId) -> EngineResult<Option<Report>>;
}

/// Outbox and dead-letter bookkeeping used by the relay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished messages, oldest first.
    async fn fetch_unpublished(&self, limit: usize) -> EngineResult<Vec<OutboxMessage>>;
    async fn mark_published(&self, event_id: EventId, at: TimestampUtc) -> EngineResult<()>;
    /// Increments and returns the message's retry count.
    async fn record_failure(&self, event_id: EventId) -> EngineResult<u32>;
    /// Stores the dead letter and marks its message published, atomically.
    async fn exile(&self, record: DeadLetterRecord) -> EngineResult<()>;
    async fn list_dead_letters(&self, include_resolved: bool)
        -> EngineResult<Vec<DeadLetterRecord>>;
    async fn resolve_dead_letter(&self, id: DeadLetterId) -> EngineResult<DeadLetterRecord>;
}

#[async_trait]
pub trait EngineStore: RunStore + OutboxStore {
    fn mode(&self) -> TransactionMode;

    /// Applies a unit of work's writes according to `mode()`.
    async fn commit(&self, writes: Vec<StagedWrite>) -> EngineResult<()>;
}

/// Complete persisted state of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    runs: BTreeMap<RunId, WorkflowRun>,
    #[serde(default)]
    works: BTreeMap<WorkExecutionId, WorkExecution>,
    #[serde(default)]
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
    #[serde(default)]
    work_trees: Vec<WorkTree>,
    #[serde(default)]
    reports: BTreeMap<ReportId, Report>,
    #[serde(default)]
    outbox: Vec<OutboxMessage>,
    #[serde(default)]
    dead_letters: Vec<DeadLetterRecord>,
}

impl StoreState {
    pub fn apply(&mut self, write: StagedWrite) -> EngineResult<()> {
        match write {
            StagedWrite::SaveRun(mut run) => {
                let stored_version = self.runs.get(&run.id()).map(WorkflowRun::version);
                match stored_version {
                    Some(version) if version != run.version() => {
                        return Err(EngineError::ConcurrencyConflict {
                            message: format!(
                                "run {} is at version {}, save was based on {}",
                                run.id(),
                                version,
                                run.version()
                            ),
                        });
                    }
                    None if run.version() != 0 => {
                        return Err(EngineError::ConcurrencyConflict {
                            message: format!("run {} was deleted concurrently", run.id()),
                        });
                    }
                    _ => {}
                }
                run.take_events();
                run.set_version(run.version() + 1);
                self.runs.insert(run.id(), run);
            }
            StagedWrite::SaveWork(mut work) => {
                work.take_events();
                self.works.insert(work.id(), work);
            }
            StagedWrite::DeleteWorks(ids) => {
                for id in ids {
                    self.works.remove(&id);
                }
            }
            StagedWrite::SaveCheckpoint(checkpoint) => {
                self.checkpoints.insert(checkpoint.id(), checkpoint);
            }
            StagedWrite::SaveWorkTree(work_tree) => {
                match self.work_trees.iter_mut().find(|w| {
                    w.run_id == work_tree.run_id && w.repository_id == work_tree.repository_id
                }) {
                    Some(existing) => *existing = work_tree,
                    None => self.work_trees.push(work_tree),
                }
            }
            StagedWrite::SaveReport(report) => {
                self.reports.insert(report.id, report);
            }
            StagedWrite::DeleteReports(work_ids) => {
                self.reports
                    .retain(|_, r| !work_ids.contains(&r.work_execution_id));
            }
            StagedWrite::DeleteRun(run_id) => {
                self.runs.remove(&run_id);
                self.works.retain(|_, w| w.run_id() != run_id);
                self.checkpoints.retain(|_, c| c.run_id() != run_id);
                self.work_trees.retain(|w| w.run_id != run_id);
                self.reports.retain(|_, r| r.run_id != run_id);
            }
            StagedWrite::AppendOutbox(message) => {
                self.outbox.push(message);
            }
        }
        Ok(())
    }

    pub fn run(&self, id: RunId) -> Option<WorkflowRun> {
        self.runs.get(&id).cloned()
    }

    pub fn runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<_> = self.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at());
        runs
    }

    pub fn work(&self, id: WorkExecutionId) -> Option<WorkExecution> {
        self.works.get(&id).cloned()
    }

    pub fn works_of(&self, run_id: RunId) -> Vec<WorkExecution> {
        let mut works: Vec<_> = self
            .works
            .values()
            .filter(|w| w.run_id() == run_id)
            .cloned()
            .collect();
        works.sort_by_key(|w| (w.sequence(), w.created_at()));
        works
    }

    pub fn checkpoint(&self, id: CheckpointId) -> Option<Checkpoint> {
        self.checkpoints.get(&id).cloned()
    }

    pub fn checkpoints_of(&self, run_id: RunId) -> Vec<Checkpoint> {
        let mut checkpoints: Vec<_> = self
            .checkpoints
            .values()
            .filter(|c| c.run_id() == run_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| (c.work_sequence(), c.created_at()));
        checkpoints
    }

    pub fn work_trees_of(&self, run_id: RunId) -> Vec<WorkTree> {
        self.work_trees
            .iter()
            .filter(|w| w.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn reports_of(&self, run_id: RunId) -> Vec<Report> {
        let mut reports: Vec<_> = self
            .reports
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| (r.sequence, r.task_order));
        reports
    }

    pub fn report(&self, id: ReportId) -> Option<Report> {
        self.reports.get(&id).cloned()
    }

    pub fn unpublished(&self, limit: usize) -> Vec<OutboxMessage> {
        let mut pending: Vec<_> = self.outbox.iter().filter(|m| !m.published).collect();
        pending.sort_by_key(|m| m.created_at);
        pending.into_iter().take(limit).cloned().collect()
    }

    pub fn outbox(&self) -> &[OutboxMessage] {
        &self.outbox
    }

    fn message_mut(&mut self, event_id: EventId) -> EngineResult<&mut OutboxMessage> {
        self.outbox
            .iter_mut()
            .find(|m| m.event_id == event_id)
            .ok_or_else(|| EngineError::not_found("outbox message", event_id))
    }

    pub fn mark_published(&mut self, event_id: EventId, at: TimestampUtc) -> EngineResult<()> {
        let message = self.message_mut(event_id)?;
        message.published = true;
        message.published_at = Some(at);
        Ok(())
    }

    pub fn record_failure(&mut self, event_id: EventId) -> EngineResult<u32> {
        let message = self.message_mut(event_id)?;
        message.retry_count += 1;
        Ok(message.retry_count)
    }

    pub fn exile(&mut self, record: DeadLetterRecord) -> EngineResult<()> {
        self.mark_published(record.event_id, record.created_at)?;
        self.dead_letters.push(record);
        Ok(())
    }

    pub fn dead_letters(&self, include_resolved: bool) -> Vec<DeadLetterRecord> {
        self.dead_letters
            .iter()
            .filter(|d| include_resolved || !d.resolved)
            .cloned()
            .collect()
    }

    pub fn resolve_dead_letter(&mut self, id: DeadLetterId) -> EngineResult<DeadLetterRecord> {
        let record = self
            .dead_letters
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| EngineError::not_found("dead letter", id))?;
        if !record.resolved {
            record.resolved = true;
            record.resolved_at = Some(TimestampUtc::now());
        }
        Ok(record.clone())
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
