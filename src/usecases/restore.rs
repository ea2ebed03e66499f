//! Rewinding a run to a checkpoint.
//!
//! Git and the store share no transaction. Every work tree reset is paired
//! with a compensation back to the commit it had before, and the whole stack
//! is unwound if anything fails before the run's new state is committed.

use super::Engine;
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::run::{RunStatus, WorkflowRun};
use crate::domain::types::{CheckpointId, RunId, WorkExecutionId};
use crate::reliability::compensation::{Compensation, CompensationStack};
use crate::reliability::unit_of_work::UnitOfWork;

impl Engine {
    /// Resets every work tree to the checkpoint's commits and trims the
    /// executions recorded after it.
    ///
    /// The run must be paused or awaiting; a running run is rejected before
    /// any git mutation.
    pub async fn restore_to_checkpoint(
        &self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
    ) -> EngineResult<WorkflowRun> {
        let mut run = self.require_run(run_id).await?;
        if run.status() == RunStatus::Running || run.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "cannot restore run {} while {}",
                run_id,
                run.status()
            )));
        }
        let checkpoint = self
            .store
            .load_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint", checkpoint_id))?;
        if checkpoint.run_id() != run_id {
            return Err(EngineError::invalid_state(format!(
                "checkpoint {} belongs to run {}, not {}",
                checkpoint_id,
                checkpoint.run_id(),
                run_id
            )));
        }

        let mut stack = CompensationStack::new();
        match self
            .try_restore(&mut run, &checkpoint, &mut stack)
            .await
        {
            Ok(trimmed) => {
                self.release_sessions(&trimmed).await;
                tracing::info!(
                    run_id = %run_id,
                    checkpoint_id = %checkpoint_id,
                    work_sequence = checkpoint.work_sequence(),
                    trimmed = trimmed.len(),
                    "run restored to checkpoint"
                );
                self.require_run(run_id).await
            }
            Err(err) => {
                self.unwind(&mut stack, &err).await;
                Err(err)
            }
        }
    }

    async fn try_restore(
        &self,
        run: &mut WorkflowRun,
        checkpoint: &Checkpoint,
        stack: &mut CompensationStack,
    ) -> EngineResult<Vec<WorkExecutionId>> {
        let run_id = run.id();
        for tree in self.active_work_trees(run_id).await? {
            let Some(target) = checkpoint.get_commit_hash(&tree.repository_id) else {
                tracing::warn!(
                    run_id = %run_id,
                    repository_id = %tree.repository_id,
                    "checkpoint has no commit for work tree, leaving it as is"
                );
                continue;
            };
            let before = self.git.current_commit(&tree.path).await?;
            self.git.reset_hard(&tree.path, target).await?;
            stack.push(Compensation::ResetWorkTree {
                repository_id: tree.repository_id.clone(),
                path: tree.path.clone(),
                commit: before,
            });
        }

        let work_sequence = checkpoint.work_sequence();
        let trimmed: Vec<WorkExecutionId> = run
            .work_execution_ids()
            .get(work_sequence..)
            .map(<[WorkExecutionId]>::to_vec)
            .unwrap_or_default();
        run.restore_to_checkpoint(work_sequence)?;

        for work in self.store.list_works(run_id).await? {
            if !trimmed.contains(&work.id()) {
                continue;
            }
            let stage_dir = self.layout.stage_dir(run_id, work.sequence(), work.id());
            if let Err(err) = self.fs.delete_directory(&stage_dir).await {
                tracing::warn!(path = %stage_dir.display(), error = %err, "failed to remove stage workspace");
            }
        }
        for report in self.store.list_reports(run_id).await? {
            if !trimmed.contains(&report.work_execution_id) {
                continue;
            }
            if let Err(err) = self.fs.delete_file(&report.path).await {
                tracing::warn!(path = %report.path.display(), error = %err, "failed to remove report");
            }
        }

        // The run goes first: a version conflict must stop pass-through
        // stores before any record is deleted.
        let mut uow = UnitOfWork::for_run(run_id);
        uow.save_run(run)?;
        uow.delete_reports(trimmed.clone());
        uow.delete_works(trimmed.clone());
        self.outbox.commit(uow).await?;
        stack.clear();
        Ok(trimmed)
    }
}
