//! Atomic persistence boundary for a use case.
//!
//! A `UnitOfWork` collects every write a use case wants to make, plus the
//! events its aggregates recorded. The store then applies the whole batch:
//! inside one transaction for a transactional backend, or write by write
//! for a pass-through backend.

use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::EngineResult;
use crate::domain::events::EventEnvelope;
use crate::domain::records::{Report, WorkTree};
use crate::domain::run::WorkflowRun;
use crate::domain::types::{RunId, WorkExecutionId};
use crate::domain::work::WorkExecution;
use crate::reliability::outbox::OutboxMessage;

/// How a store applies a committed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// All writes land or none do.
    Transactional,
    /// Writes are applied in order; a failure leaves earlier writes in place.
    PassThrough,
}

/// One pending write.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    /// Saved with an optimistic check against the run's loaded `version`.
    SaveRun(WorkflowRun),
    SaveWork(WorkExecution),
    DeleteWorks(Vec<WorkExecutionId>),
    SaveCheckpoint(Checkpoint),
    SaveWorkTree(WorkTree),
    SaveReport(Report),
    /// Deletes the reports written by the given executions.
    DeleteReports(Vec<WorkExecutionId>),
    /// Deletes a run and every record it owns.
    DeleteRun(RunId),
    AppendOutbox(OutboxMessage),
}

#[derive(Debug, Default)]
pub struct UnitOfWork {
    correlation_id: Option<RunId>,
    writes: Vec<StagedWrite>,
    events: Vec<EventEnvelope>,
}

impl UnitOfWork {
    /// Starts a unit of work whose events are correlated to `run_id`.
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            correlation_id: Some(run_id),
            ..Self::default()
        }
    }

    pub fn correlation_id(&self) -> Option<RunId> {
        self.correlation_id
    }

    /// Stages the run and drains the events it recorded.
    pub fn save_run(&mut self, run: &mut WorkflowRun) -> EngineResult<()> {
        for event in run.take_events() {
            self.events
                .push(EventEnvelope::wrap(&event, run.id(), self.correlation_id)?);
        }
        self.writes.push(StagedWrite::SaveRun(run.clone()));
        Ok(())
    }

    /// Stages the execution and drains the events it recorded.
    pub fn save_work(&mut self, work: &mut WorkExecution) -> EngineResult<()> {
        for event in work.take_events() {
            self.events
                .push(EventEnvelope::wrap(&event, work.id(), self.correlation_id)?);
        }
        self.writes.push(StagedWrite::SaveWork(work.clone()));
        Ok(())
    }

    pub fn delete_works(&mut self, ids: Vec<WorkExecutionId>) {
        if !ids.is_empty() {
            self.writes.push(StagedWrite::DeleteWorks(ids));
        }
    }

    pub fn save_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.writes.push(StagedWrite::SaveCheckpoint(checkpoint));
    }

    pub fn save_work_tree(&mut self, work_tree: WorkTree) {
        self.writes.push(StagedWrite::SaveWorkTree(work_tree));
    }

    pub fn save_report(&mut self, report: Report) {
        self.writes.push(StagedWrite::SaveReport(report));
    }

    pub fn delete_reports(&mut self, work_execution_ids: Vec<WorkExecutionId>) {
        if !work_execution_ids.is_empty() {
            self.writes
                .push(StagedWrite::DeleteReports(work_execution_ids));
        }
    }

    pub fn delete_run(&mut self, run_id: RunId) {
        self.writes.push(StagedWrite::DeleteRun(run_id));
    }

    pub fn writes(&self) -> &[StagedWrite] {
        &self.writes
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.events.is_empty()
    }

    pub fn into_parts(self) -> (Vec<StagedWrite>, Vec<EventEnvelope>) {
        (self.writes, self.events)
    }
}
