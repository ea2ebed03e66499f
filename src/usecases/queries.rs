use super::Engine;
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::records::Report;
use crate::domain::run::WorkflowRun;
use crate::domain::types::{DeadLetterId, ReportId, RunId};
use crate::domain::work::WorkExecution;
use crate::reliability::outbox::DeadLetterRecord;

impl Engine {
    pub async fn get_run(&self, run_id: RunId) -> EngineResult<WorkflowRun> {
        self.require_run(run_id).await
    }

    pub async fn list_runs(&self) -> EngineResult<Vec<WorkflowRun>> {
        self.store.list_runs().await
    }

    /// Executions still in the run's history, in stage order.
    pub async fn lineage(&self, run_id: RunId) -> EngineResult<Vec<WorkExecution>> {
        let run = self.require_run(run_id).await?;
        let works = self.store.list_works(run_id).await?;
        Ok(run
            .work_execution_ids()
            .iter()
            .filter_map(|id| works.iter().find(|w| w.id() == *id).cloned())
            .collect())
    }

    pub async fn list_checkpoints(&self, run_id: RunId) -> EngineResult<Vec<Checkpoint>> {
        self.require_run(run_id).await?;
        self.store.list_checkpoints(run_id).await
    }

    pub async fn list_reports(&self, run_id: RunId) -> EngineResult<Vec<Report>> {
        self.require_run(run_id).await?;
        self.store.list_reports(run_id).await
    }

    /// The report record together with its content on disk.
    pub async fn read_report(&self, report_id: ReportId) -> EngineResult<(Report, String)> {
        let report = self
            .store
            .load_report(report_id)
            .await?
            .ok_or_else(|| EngineError::not_found("report", report_id))?;
        let content = self.fs.read_file(&report.path).await?;
        Ok((report, content))
    }

    pub async fn list_dead_letters(
        &self,
        include_resolved: bool,
    ) -> EngineResult<Vec<DeadLetterRecord>> {
        self.store.list_dead_letters(include_resolved).await
    }

    pub async fn resolve_dead_letter(&self, id: DeadLetterId) -> EngineResult<DeadLetterRecord> {
        let record = self.store.resolve_dead_letter(id).await?;
        tracing::info!(dead_letter_id = %id, event_id = %record.event_id, "dead letter resolved");
        Ok(record)
    }
}
