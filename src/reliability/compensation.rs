//! LIFO rollback of external side effects.
//!
//! Each compensating action is a plain value (operation + arguments), so a
//! stack can be logged or persisted before it is unwound.

use crate::domain::types::{CommitHash, RepositoryId, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Compensation {
    /// Hard-reset a work tree back to a captured commit.
    ResetWorkTree {
        repository_id: RepositoryId,
        path: PathBuf,
        commit: CommitHash,
    },
    /// Remove a work tree that was just added.
    RemoveWorkTree {
        repository_path: PathBuf,
        path: PathBuf,
    },
    RemoveDirectory {
        path: PathBuf,
    },
    RemoveFile {
        path: PathBuf,
    },
    /// Stop and delete an agent session that was just started.
    StopSession {
        session_id: SessionId,
    },
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetWorkTree {
                repository_id,
                commit,
                ..
            } => write!(f, "reset {} to {}", repository_id, commit),
            Self::RemoveWorkTree { path, .. } => write!(f, "remove work tree {}", path.display()),
            Self::RemoveDirectory { path } => write!(f, "remove directory {}", path.display()),
            Self::RemoveFile { path } => write!(f, "remove file {}", path.display()),
            Self::StopSession { session_id } => write!(f, "stop session {}", session_id),
        }
    }
}

/// Performs one compensating action.
#[async_trait]
pub trait CompensationExecutor: Send + Sync {
    async fn execute(&self, action: &Compensation) -> anyhow::Result<()>;
}

/// Result of unwinding a stack.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnwindReport {
    pub succeeded: usize,
    pub failed: Vec<(Compensation, String)>,
}

/// Per-invocation stack of compensating actions.
#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Compensation] {
        &self.actions
    }

    /// Drops every action once the guarded operation has succeeded.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Runs every action newest-first and empties the stack.
    ///
    /// A failing action is logged and skipped; the rest still run.
    pub async fn run_all(&mut self, executor: &dyn CompensationExecutor) -> UnwindReport {
        let mut report = UnwindReport::default();
        while let Some(action) = self.actions.pop() {
            match executor.execute(&action).await {
                Ok(()) => {
                    tracing::debug!(action = %action, "compensation applied");
                    report.succeeded += 1;
                }
                Err(err) => {
                    tracing::warn!(action = %action, error = %err, "compensation failed");
                    report.failed.push((action, format!("{:#}", err)));
                }
            }
        }
        report
    }
}
