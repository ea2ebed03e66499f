//! Stage use cases: start the next stage, send a task's query, record its
//! answer, and contain a failure the pipeline could not retry past.

use super::{require_status, Engine};
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::node_config::WorkNodeConfig;
use crate::domain::records::{Report, WorkTree};
use crate::domain::run::{RunStatus, WorkflowRun};
use crate::domain::types::{ReportId, RunId, TimestampUtc, WorkExecutionId};
use crate::domain::work::{TaskExecution, WorkExecution};
use crate::reliability::compensation::{Compensation, CompensationStack};
use crate::reliability::unit_of_work::UnitOfWork;
use crate::services::{SessionAttribution, SessionRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Result of asking for the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStart {
    /// This execution is ready for queries.
    Started(WorkExecutionId),
    /// Nothing to run now: every stage is done, or the run stopped at a
    /// stage boundary.
    Complete,
}

/// What `complete_task` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub has_next_task: bool,
    pub stage_completed: bool,
    pub run_status: RunStatus,
}

impl Engine {
    pub async fn start_next_stage(&self, run_id: RunId) -> EngineResult<StageStart> {
        loop {
            let mut run = self.require_run(run_id).await?;
            require_status(&run, RunStatus::Running, "start the next stage of")?;
            let index = run.current_work_index();
            if index >= run.total_work_count() {
                return Ok(StageStart::Complete);
            }
            let config = run
                .current_work_node_config()
                .cloned()
                .ok_or_else(|| EngineError::not_found("stage", index))?;

            let existing = run.work_execution_ids().get(index).copied();
            let Some(work_id) = existing else {
                let work_id = self.provision_stage(run, &config).await?;
                return Ok(StageStart::Started(work_id));
            };

            let work = self.require_work(work_id).await?;
            if !work.is_terminal() {
                self.ensure_session(&run, &work, &config).await?;
                return Ok(StageStart::Started(work_id));
            }
            if work.is_cancelled() {
                return Err(EngineError::invalid_state(format!(
                    "stage {} of run {} was cancelled",
                    index, run_id
                )));
            }

            // Completed while the run was paused; finish the boundary now.
            tracing::info!(run_id = %run_id, work_execution_id = %work_id, "finalizing completed stage");
            let mut uow = UnitOfWork::for_run(run_id);
            self.finish_stage(&mut run, &work, &mut uow).await?;
            self.outbox.commit(uow).await?;
            self.release_session(work_id).await;
            if run.status() != RunStatus::Running {
                return Ok(StageStart::Complete);
            }
        }
    }

    /// Sends the current task's query to the stage's agent session.
    pub async fn send_query(&self, work_id: WorkExecutionId) -> EngineResult<String> {
        let work = self.require_work(work_id).await?;
        let task = open_task(&work)?;
        let session_id = self
            .agents
            .find_session_by_work_execution_id(work_id)
            .await?
            .ok_or_else(|| EngineError::not_found("agent session", work_id))?;

        tracing::debug!(
            work_execution_id = %work_id,
            task_order = task.order,
            session_id = %session_id,
            "sending query"
        );
        let response = self
            .agents
            .send_query(&session_id, &render_prompt(task))
            .await?;
        Ok(response)
    }

    /// Records the answer to the current task and moves on.
    ///
    /// When this finishes the stage of a running run, the stage boundary is
    /// committed with it: checkpoint, run advance, and `AWAITING` for
    /// `pause_after` stages.
    pub async fn complete_task(
        &self,
        work_id: WorkExecutionId,
        response: &str,
    ) -> EngineResult<TaskOutcome> {
        let mut work = self.require_work(work_id).await?;
        let mut run = self.require_run(work.run_id()).await?;
        let mut stack = CompensationStack::new();
        match self
            .try_complete_task(&mut run, &mut work, response, &mut stack)
            .await
        {
            Ok(outcome) => {
                if outcome.stage_completed {
                    self.release_session(work_id).await;
                }
                Ok(outcome)
            }
            Err(err) => {
                self.unwind(&mut stack, &err).await;
                Err(err)
            }
        }
    }

    /// Skips the current task after unrecoverable query failures and pauses
    /// the run for a human to look at, in one commit.
    pub async fn contain_failure(&self, work_id: WorkExecutionId) -> EngineResult<()> {
        let mut work = self.require_work(work_id).await?;
        let mut run = self.require_run(work.run_id()).await?;
        let mut uow = UnitOfWork::for_run(run.id());
        if !work.is_terminal() {
            work.fail_current_task()?;
            work.advance_to_next_task();
            uow.save_work(&mut work)?;
        }
        if run.can_pause() {
            run.pause()?;
            uow.save_run(&mut run)?;
        }
        self.outbox.commit(uow).await?;
        tracing::warn!(
            run_id = %run.id(),
            work_execution_id = %work_id,
            run_status = %run.status(),
            "query failure contained"
        );
        Ok(())
    }

    async fn try_complete_task(
        &self,
        run: &mut WorkflowRun,
        work: &mut WorkExecution,
        response: &str,
        stack: &mut CompensationStack,
    ) -> EngineResult<TaskOutcome> {
        let run_id = run.id();
        let task = open_task(work)?.clone();
        let mut uow = UnitOfWork::for_run(run_id);

        let report_id = if task.report_outline.is_some() {
            let path = self
                .layout
                .report_path(run_id, work.sequence(), work.id(), task.order);
            self.fs.create_file(&path, response).await?;
            stack.push(Compensation::RemoveFile { path: path.clone() });
            let report = Report {
                id: ReportId::new(),
                run_id,
                work_execution_id: work.id(),
                sequence: work.sequence(),
                task_order: task.order,
                path,
                created_at: TimestampUtc::now(),
            };
            let id = report.id;
            uow.save_report(report);
            Some(id)
        } else {
            None
        };

        work.complete_current_task(report_id)?;
        let has_next_task = work.advance_to_next_task();
        let stage_completed = work.is_completed();
        uow.save_work(work)?;
        if stage_completed && run.status() == RunStatus::Running {
            self.finish_stage(run, work, &mut uow).await?;
        }
        self.outbox.commit(uow).await?;
        stack.clear();

        tracing::info!(
            run_id = %run_id,
            work_execution_id = %work.id(),
            task_order = task.order,
            stage_completed,
            "task completed"
        );
        Ok(TaskOutcome {
            has_next_task,
            stage_completed,
            run_status: run.status(),
        })
    }

    /// Checkpoints every active work tree, then advances the run.
    async fn finish_stage(
        &self,
        run: &mut WorkflowRun,
        work: &WorkExecution,
        uow: &mut UnitOfWork,
    ) -> EngineResult<()> {
        let trees = self.active_work_trees(run.id()).await?;
        if !trees.is_empty() {
            let mut commits = BTreeMap::new();
            for tree in &trees {
                let commit = self.git.current_commit(&tree.path).await?;
                commits.insert(tree.repository_id.clone(), commit);
            }
            let checkpoint = Checkpoint::new(
                run.id(),
                run.workflow_id().clone(),
                work.id(),
                work.sequence() + 1,
                commits,
            )?;
            tracing::debug!(
                run_id = %run.id(),
                checkpoint_id = %checkpoint.id(),
                work_sequence = checkpoint.work_sequence(),
                "checkpoint recorded"
            );
            uow.save_checkpoint(checkpoint);
        }

        let pause_after = run
            .work_node_config(work.sequence())
            .is_some_and(WorkNodeConfig::pause_after);
        run.advance_work()?;
        if pause_after && run.status() == RunStatus::Running {
            run.mark_awaiting()?;
        }
        uow.save_run(run)
    }

    async fn provision_stage(
        &self,
        mut run: WorkflowRun,
        config: &WorkNodeConfig,
    ) -> EngineResult<WorkExecutionId> {
        let mut stack = CompensationStack::new();
        match self.try_provision_stage(&mut run, config, &mut stack).await {
            Ok(work_id) => Ok(work_id),
            Err(err) => {
                self.unwind(&mut stack, &err).await;
                Err(err)
            }
        }
    }

    async fn try_provision_stage(
        &self,
        run: &mut WorkflowRun,
        config: &WorkNodeConfig,
        stack: &mut CompensationStack,
    ) -> EngineResult<WorkExecutionId> {
        let run_id = run.id();
        let mut uow = UnitOfWork::for_run(run_id);
        let trees = self.ensure_work_trees(run, config, &mut uow, stack).await?;

        let mut work = WorkExecution::new(run_id, run.workflow_id().clone(), config)?;
        let work_id = work.id();
        let stage_dir = self.layout.stage_dir(run_id, config.sequence(), work_id);
        self.fs.create_directory(&stage_dir).await?;
        stack.push(Compensation::RemoveDirectory {
            path: stage_dir.clone(),
        });
        self.copy_linked_reports(run_id, config, work_id).await?;

        run.add_work_execution(work_id)?;
        let working_dir = self.working_dir(run_id, config, work_id, &trees);
        self.open_session(run, &work, config, working_dir, stack)
            .await?;

        uow.save_work(&mut work)?;
        uow.save_run(run)?;
        self.outbox.commit(uow).await?;
        stack.clear();

        tracing::info!(
            run_id = %run_id,
            work_execution_id = %work_id,
            sequence = config.sequence(),
            tasks = config.tasks().len(),
            "stage started"
        );
        Ok(work_id)
    }

    /// Work trees for the stage's repositories, created once per run.
    async fn ensure_work_trees(
        &self,
        run: &WorkflowRun,
        config: &WorkNodeConfig,
        uow: &mut UnitOfWork,
        stack: &mut CompensationStack,
    ) -> EngineResult<Vec<WorkTree>> {
        let existing = self.active_work_trees(run.id()).await?;
        let mut trees = Vec::new();
        for git_ref in config.git_refs() {
            if let Some(tree) = existing
                .iter()
                .find(|t| t.repository_id == git_ref.repository_id)
            {
                trees.push(tree.clone());
                continue;
            }

            let repository_path = &git_ref.repository_path;
            let path =
                self.layout
                    .work_tree_path(run.id(), &git_ref.repository_id, repository_path);
            let branch = self.layout.run_branch(run.id());
            // Left behind by an earlier attempt that was rolled back.
            if self.git.branch_exists(repository_path, &branch).await? {
                self.git.delete_branch(repository_path, &branch).await?;
            }
            self.git
                .create_worktree(repository_path, &path, &branch, &git_ref.base_branch)
                .await?;
            stack.push(Compensation::RemoveWorkTree {
                repository_path: repository_path.clone(),
                path: path.clone(),
            });

            let tree = WorkTree {
                run_id: run.id(),
                repository_id: git_ref.repository_id.clone(),
                path,
                branch,
                active: true,
            };
            uow.save_work_tree(tree.clone());
            trees.push(tree);
        }
        Ok(trees)
    }

    async fn copy_linked_reports(
        &self,
        run_id: RunId,
        config: &WorkNodeConfig,
        work_id: WorkExecutionId,
    ) -> EngineResult<()> {
        let linked = config.linked_report_sequences();
        if linked.is_empty() {
            return Ok(());
        }
        let dir = self
            .layout
            .linked_reports_dir(run_id, config.sequence(), work_id);
        for report in self.store.list_reports(run_id).await? {
            if !linked.contains(&report.sequence) {
                continue;
            }
            let Some(file_name) = report.path.file_name() else {
                continue;
            };
            let target = dir.join(format!(
                "{:02}-{}",
                report.sequence,
                file_name.to_string_lossy()
            ));
            self.fs.copy(&report.path, &target).await?;
        }
        Ok(())
    }

    /// Starts a session for a stage that lost its own, e.g. after a restart.
    async fn ensure_session(
        &self,
        run: &WorkflowRun,
        work: &WorkExecution,
        config: &WorkNodeConfig,
    ) -> EngineResult<()> {
        if self
            .agents
            .find_session_by_work_execution_id(work.id())
            .await?
            .is_some()
        {
            return Ok(());
        }
        let trees = self.active_work_trees(run.id()).await?;
        let working_dir = self.working_dir(run.id(), config, work.id(), &trees);
        let mut stack = CompensationStack::new();
        if let Err(err) = self
            .open_session(run, work, config, working_dir, &mut stack)
            .await
        {
            self.unwind(&mut stack, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn open_session(
        &self,
        run: &WorkflowRun,
        work: &WorkExecution,
        config: &WorkNodeConfig,
        working_dir: PathBuf,
        stack: &mut CompensationStack,
    ) -> EngineResult<()> {
        let session_id = self
            .agents
            .start(SessionRequest {
                run_id: run.id(),
                work_execution_id: work.id(),
                model: work.model().to_string(),
                working_dir,
                mcp_servers: config.mcp_servers().to_vec(),
            })
            .await?;
        stack.push(Compensation::StopSession {
            session_id: session_id.clone(),
        });
        if self.agents.capabilities().per_session_attribution {
            let attribution = SessionAttribution {
                run_id: run.id(),
                workflow_id: run.workflow_id().clone(),
                issue_key: run.issue_key().clone(),
            };
            self.agents.attribute(&session_id, &attribution).await?;
        }
        Ok(())
    }

    /// The first repository's work tree, or the stage directory.
    fn working_dir(
        &self,
        run_id: RunId,
        config: &WorkNodeConfig,
        work_id: WorkExecutionId,
        trees: &[WorkTree],
    ) -> PathBuf {
        config
            .git_refs()
            .first()
            .and_then(|r| trees.iter().find(|t| t.repository_id == r.repository_id))
            .map(|t| t.path.clone())
            .unwrap_or_else(|| self.layout.stage_dir(run_id, config.sequence(), work_id))
    }
}

fn open_task(work: &WorkExecution) -> EngineResult<&TaskExecution> {
    match work.current_task() {
        Some(task) if !work.is_terminal() => Ok(task),
        _ => Err(EngineError::invalid_state(format!(
            "stage {} has no open task",
            work.id()
        ))),
    }
}

fn render_prompt(task: &TaskExecution) -> String {
    match &task.report_outline {
        Some(outline) => format!(
            "{}\n\nWrite your answer as a report that follows this outline:\n{}",
            task.query, outline
        ),
        None => task.query.clone(),
    }
}
