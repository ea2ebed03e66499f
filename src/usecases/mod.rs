//! Use cases that drive runs and stages.
//!
//! Every use case loads aggregates from the store, mutates them, and commits
//! the result through one `UnitOfWork`. External side effects (work trees,
//! directories, agent sessions) are paired with a `Compensation` so a failed
//! commit can be rolled back.

pub mod compensator;
pub mod lifecycle;
pub mod queries;
pub mod restore;
pub mod stage;

pub use compensator::ServiceCompensator;
pub use stage::{StageStart, TaskOutcome};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::records::WorkTree;
use crate::domain::run::{RunStatus, WorkflowRun};
use crate::domain::types::{RunId, WorkExecutionId};
use crate::domain::work::WorkExecution;
use crate::engine_paths::WorkspaceLayout;
use crate::pipeline::guard::RunGuard;
use crate::reliability::compensation::CompensationStack;
use crate::reliability::event_bus::EventPublisher;
use crate::reliability::outbox::TransactionalOutbox;
use crate::services::{AgentSessionService, FileSystem, GitService, WorkflowConfigReader};
use crate::store::EngineStore;
use futures::future::join_all;
use std::sync::Arc;

/// Collaborators an `Engine` is built from.
pub struct EngineParts {
    pub store: Arc<dyn EngineStore>,
    /// In-process subscribers that see events right after each commit.
    pub local_events: Arc<dyn EventPublisher>,
    pub agents: Arc<dyn AgentSessionService>,
    pub git: Arc<dyn GitService>,
    pub fs: Arc<dyn FileSystem>,
    pub templates: Arc<dyn WorkflowConfigReader>,
    pub layout: WorkspaceLayout,
}

pub struct Engine {
    store: Arc<dyn EngineStore>,
    outbox: TransactionalOutbox,
    agents: Arc<dyn AgentSessionService>,
    git: Arc<dyn GitService>,
    fs: Arc<dyn FileSystem>,
    templates: Arc<dyn WorkflowConfigReader>,
    layout: WorkspaceLayout,
    compensator: ServiceCompensator,
    run_guard: RunGuard,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        let compensator =
            ServiceCompensator::new(parts.git.clone(), parts.fs.clone(), parts.agents.clone());
        Self {
            outbox: TransactionalOutbox::new(parts.store.clone(), parts.local_events),
            store: parts.store,
            agents: parts.agents,
            git: parts.git,
            fs: parts.fs,
            templates: parts.templates,
            layout: parts.layout,
            compensator,
            run_guard: RunGuard::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Runs currently held by a pipeline driver.
    pub fn run_guard(&self) -> &RunGuard {
        &self.run_guard
    }

    async fn require_run(&self, run_id: RunId) -> EngineResult<WorkflowRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    async fn require_work(&self, work_id: WorkExecutionId) -> EngineResult<WorkExecution> {
        self.store
            .load_work(work_id)
            .await?
            .ok_or_else(|| EngineError::not_found("work execution", work_id))
    }

    async fn active_work_trees(&self, run_id: RunId) -> EngineResult<Vec<WorkTree>> {
        Ok(self
            .store
            .list_work_trees(run_id)
            .await?
            .into_iter()
            .filter(|w| w.active)
            .collect())
    }

    async fn unwind(&self, stack: &mut CompensationStack, cause: &EngineError) {
        if stack.is_empty() {
            return;
        }
        let report = stack.run_all(&self.compensator).await;
        tracing::warn!(
            error = %cause,
            compensated = report.succeeded,
            failed = report.failed.len(),
            "rolled back side effects"
        );
    }

    /// Stops and deletes the session serving `work_id`, logging failures.
    async fn release_session(&self, work_id: WorkExecutionId) {
        let session_id = match self.agents.find_session_by_work_execution_id(work_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(work_execution_id = %work_id, error = %err, "session lookup failed");
                return;
            }
        };
        if let Err(err) = self.agents.stop(&session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to stop agent session");
        }
        if let Err(err) = self.agents.delete_session(&session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to delete agent session");
        }
    }

    async fn release_sessions(&self, work_ids: &[WorkExecutionId]) {
        join_all(work_ids.iter().map(|id| self.release_session(*id))).await;
    }
}

fn require_status(run: &WorkflowRun, expected: RunStatus, action: &str) -> EngineResult<()> {
    if run.status() != expected {
        return Err(EngineError::invalid_state(format!(
            "cannot {} run {} while {}",
            action,
            run.id(),
            run.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod lifecycle_tests;

#[cfg(test)]
#[path = "tests/stage_tests.rs"]
mod stage_tests;

#[cfg(test)]
#[path = "tests/restore_tests.rs"]
mod restore_tests;
