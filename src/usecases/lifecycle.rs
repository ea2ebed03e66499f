//! Run lifecycle: create, start, pause, resume, cancel, delete, edit.

use super::{require_status, Engine};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::factory::{WorkflowRunFactory, WorkflowTemplate};
use crate::domain::node_config::WorkNodeConfig;
use crate::domain::run::{RunStatus, WorkflowRun};
use crate::domain::types::{CheckpointId, IssueKey, RepositoryId, RunId, WorkflowId};
use crate::reliability::unit_of_work::UnitOfWork;
use std::collections::BTreeMap;

impl Engine {
    /// Freezes the stored template for `workflow_id` into a new `INITIALIZED` run.
    pub async fn create_run(
        &self,
        workflow_id: &WorkflowId,
        issue_key: IssueKey,
        seed_values: BTreeMap<String, String>,
    ) -> EngineResult<WorkflowRun> {
        let template = self.templates.read(workflow_id).await?;
        self.create_run_from_template(&template, issue_key, seed_values)
            .await
    }

    pub async fn create_run_from_template(
        &self,
        template: &WorkflowTemplate,
        issue_key: IssueKey,
        seed_values: BTreeMap<String, String>,
    ) -> EngineResult<WorkflowRun> {
        let run = WorkflowRunFactory::create(template, issue_key, seed_values)?;
        let run = self.save_run(run).await?;
        tracing::info!(
            run_id = %run.id(),
            workflow_id = %run.workflow_id(),
            issue_key = %run.issue_key(),
            stages = run.total_work_count(),
            "run created"
        );
        Ok(run)
    }

    /// Creates a run and starts it in the same commit.
    pub async fn start_run(
        &self,
        workflow_id: &WorkflowId,
        issue_key: IssueKey,
        seed_values: BTreeMap<String, String>,
    ) -> EngineResult<WorkflowRun> {
        let template = self.templates.read(workflow_id).await?;
        self.start_run_from_template(&template, issue_key, seed_values)
            .await
    }

    pub async fn start_run_from_template(
        &self,
        template: &WorkflowTemplate,
        issue_key: IssueKey,
        seed_values: BTreeMap<String, String>,
    ) -> EngineResult<WorkflowRun> {
        let mut run = WorkflowRunFactory::create(template, issue_key, seed_values)?;
        run.start()?;
        let run = self.save_run(run).await?;
        tracing::info!(run_id = %run.id(), workflow_id = %run.workflow_id(), "run started");
        Ok(run)
    }

    /// Starts a run that was created earlier.
    pub async fn begin_run(&self, run_id: RunId) -> EngineResult<WorkflowRun> {
        let mut run = self.require_run(run_id).await?;
        run.start()?;
        let run = self.save_run(run).await?;
        tracing::info!(run_id = %run_id, "run started");
        Ok(run)
    }

    pub async fn pause_run(&self, run_id: RunId) -> EngineResult<WorkflowRun> {
        let mut run = self.require_run(run_id).await?;
        run.pause()?;
        let run = self.save_run(run).await?;
        tracing::info!(run_id = %run_id, "run paused");
        Ok(run)
    }

    /// Resumes a paused or awaiting run, optionally rewinding it first.
    pub async fn resume_run(
        &self,
        run_id: RunId,
        checkpoint_id: Option<CheckpointId>,
    ) -> EngineResult<WorkflowRun> {
        if let Some(checkpoint_id) = checkpoint_id {
            self.restore_to_checkpoint(run_id, checkpoint_id).await?;
        }
        let mut run = self.require_run(run_id).await?;
        run.resume()?;
        let run = self.save_run(run).await?;
        tracing::info!(
            run_id = %run_id,
            work_index = run.current_work_index(),
            "run resumed"
        );
        Ok(run)
    }

    /// Cancels the run and its current stage.
    ///
    /// An in-flight query is not interrupted; the stage's agent session is
    /// stopped after the commit.
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        reason: impl Into<String>,
    ) -> EngineResult<WorkflowRun> {
        let mut run = self.require_run(run_id).await?;
        run.cancel(reason)?;

        let mut uow = UnitOfWork::for_run(run_id);
        let current = run
            .work_execution_ids()
            .get(run.current_work_index())
            .copied();
        if let Some(work_id) = current {
            if let Some(mut work) = self.store.load_work(work_id).await? {
                work.cancel();
                uow.save_work(&mut work)?;
            }
        }
        uow.save_run(&mut run)?;
        self.outbox.commit(uow).await?;

        if let Some(work_id) = current {
            self.release_session(work_id).await;
        }
        tracing::info!(run_id = %run_id, reason = run.cancellation_reason().unwrap_or(""), "run cancelled");
        self.require_run(run_id).await
    }

    /// Removes a finished run with its work trees, branches and workspace.
    ///
    /// Disk and git cleanup is best-effort; records are always deleted.
    pub async fn delete_run(&self, run_id: RunId) -> EngineResult<()> {
        let run = self.require_run(run_id).await?;
        if !run.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "cannot delete run {} while {}",
                run_id,
                run.status()
            )));
        }

        for tree in self.active_work_trees(run_id).await? {
            let Some(git_ref) = run
                .git_ref_pool()
                .iter()
                .find(|r| r.repository_id == tree.repository_id)
            else {
                tracing::warn!(
                    run_id = %run_id,
                    repository_id = %tree.repository_id,
                    "work tree has no repository in the run's pool"
                );
                continue;
            };
            let repository_path = &git_ref.repository_path;
            if let Err(err) = self.git.delete_worktree(repository_path, &tree.path).await {
                tracing::warn!(path = %tree.path.display(), error = %err, "failed to remove work tree");
            }
            match self.git.branch_exists(repository_path, &tree.branch).await {
                Ok(true) => {
                    if let Err(err) = self.git.delete_branch(repository_path, &tree.branch).await {
                        tracing::warn!(branch = %tree.branch, error = %err, "failed to delete run branch");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(branch = %tree.branch, error = %err, "failed to look up run branch")
                }
            }
        }
        self.release_sessions(run.work_execution_ids()).await;
        let run_dir = self.layout.run_dir(run_id);
        if let Err(err) = self.fs.delete_directory(&run_dir).await {
            tracing::warn!(path = %run_dir.display(), error = %err, "failed to remove run workspace");
        }

        let mut uow = UnitOfWork::for_run(run_id);
        uow.delete_run(run_id);
        self.outbox.commit(uow).await?;
        tracing::info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    /// Replaces the frozen config of a stage that has not started yet.
    pub async fn edit_work_node_config(
        &self,
        run_id: RunId,
        config: WorkNodeConfig,
    ) -> EngineResult<WorkflowRun> {
        let mut run = self.require_run(run_id).await?;
        if run.is_stage_executed(config.sequence()) {
            return Err(EngineError::invalid_state(format!(
                "stage {} of run {} has already been executed",
                config.sequence(),
                run_id
            )));
        }
        run.update_work_node_config(config)?;
        self.save_run(run).await
    }

    /// Pushes the run branch of every work tree of a completed run.
    pub async fn push_completed_branches(&self, run_id: RunId) -> EngineResult<Vec<RepositoryId>> {
        let run = self.require_run(run_id).await?;
        require_status(&run, RunStatus::Completed, "push branches of")?;

        let mut pushed = Vec::new();
        for tree in self.active_work_trees(run_id).await? {
            self.git.push_branch(&tree.path, &tree.branch).await?;
            tracing::info!(run_id = %run_id, repository_id = %tree.repository_id, branch = %tree.branch, "branch pushed");
            pushed.push(tree.repository_id);
        }
        Ok(pushed)
    }

    pub(super) async fn save_run(&self, mut run: WorkflowRun) -> EngineResult<WorkflowRun> {
        let run_id = run.id();
        let mut uow = UnitOfWork::for_run(run_id);
        uow.save_run(&mut run)?;
        self.outbox.commit(uow).await?;
        self.require_run(run_id).await
    }
}
