//! Persisted side records owned by a run.

use crate::domain::types::{
    ReportId, RepositoryId, RunId, TimestampUtc, WorkExecutionId,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A git work tree checked out for one repository of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTree {
    pub run_id: RunId,
    pub repository_id: RepositoryId,
    pub path: PathBuf,
    pub branch: String,
    /// False once the work tree has been removed from disk.
    pub active: bool,
}

/// The artifact written for a task that carries a report outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub run_id: RunId,
    pub work_execution_id: WorkExecutionId,
    pub sequence: usize,
    pub task_order: u32,
    pub path: PathBuf,
    pub created_at: TimestampUtc,
}
