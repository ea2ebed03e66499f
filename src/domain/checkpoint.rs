//! Immutable per-repository commit snapshots taken at stage boundaries.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::types::{
    CheckpointId, CommitHash, RepositoryId, RunId, TimestampUtc, WorkExecutionId, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rewind target for a run.
///
/// `work_sequence` is the number of executions kept when restoring, so a
/// checkpoint taken after stage `n` finishes carries `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CheckpointRecord")]
pub struct Checkpoint {
    id: CheckpointId,
    run_id: RunId,
    workflow_id: WorkflowId,
    work_execution_id: WorkExecutionId,
    work_sequence: usize,
    commit_hashes: BTreeMap<RepositoryId, CommitHash>,
    created_at: TimestampUtc,
}

#[derive(Deserialize)]
struct CheckpointRecord {
    id: CheckpointId,
    run_id: RunId,
    workflow_id: WorkflowId,
    work_execution_id: WorkExecutionId,
    work_sequence: usize,
    commit_hashes: BTreeMap<RepositoryId, CommitHash>,
    created_at: TimestampUtc,
}

impl TryFrom<CheckpointRecord> for Checkpoint {
    type Error = EngineError;

    fn try_from(record: CheckpointRecord) -> Result<Self, Self::Error> {
        ensure_commits(&record.commit_hashes)?;
        Ok(Self {
            id: record.id,
            run_id: record.run_id,
            workflow_id: record.workflow_id,
            work_execution_id: record.work_execution_id,
            work_sequence: record.work_sequence,
            commit_hashes: record.commit_hashes,
            created_at: record.created_at,
        })
    }
}

fn ensure_commits(commit_hashes: &BTreeMap<RepositoryId, CommitHash>) -> EngineResult<()> {
    if commit_hashes.is_empty() {
        return Err(EngineError::invalid_state(
            "a checkpoint must record at least one commit",
        ));
    }
    Ok(())
}

impl Checkpoint {
    pub fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        work_execution_id: WorkExecutionId,
        work_sequence: usize,
        commit_hashes: BTreeMap<RepositoryId, CommitHash>,
    ) -> EngineResult<Self> {
        ensure_commits(&commit_hashes)?;
        Ok(Self {
            id: CheckpointId::new(),
            run_id,
            workflow_id,
            work_execution_id,
            work_sequence,
            commit_hashes,
            created_at: TimestampUtc::now(),
        })
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn work_execution_id(&self) -> WorkExecutionId {
        self.work_execution_id
    }

    pub fn work_sequence(&self) -> usize {
        self.work_sequence
    }

    pub fn commit_hashes(&self) -> &BTreeMap<RepositoryId, CommitHash> {
        &self.commit_hashes
    }

    /// Commit recorded for `repository_id`, if the repository was captured.
    pub fn get_commit_hash(&self, repository_id: &RepositoryId) -> Option<&CommitHash> {
        self.commit_hashes.get(repository_id)
    }

    pub fn created_at(&self) -> TimestampUtc {
        self.created_at
    }
}
