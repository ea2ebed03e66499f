//! The `WorkflowRun` aggregate and its lifecycle state machine.
//!
//! All mutation goes through `record`, which applies the event to the
//! aggregate and buffers it. A rejected transition returns
//! `EngineError::InvalidState` and leaves the run untouched.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::events::WorkflowRunEvent;
use crate::domain::node_config::{GitRefNodeConfig, McpServerRefNodeConfig, WorkNodeConfig};
use crate::domain::types::{IssueKey, RunId, TimestampUtc, WorkExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initialized,
    Running,
    Paused,
    Awaiting,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Awaiting => "AWAITING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Everything the factory freezes into a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: WorkflowId,
    pub issue_key: IssueKey,
    pub seed_values: BTreeMap<String, String>,
    pub git_ref_pool: Vec<GitRefNodeConfig>,
    pub mcp_server_ref_pool: Vec<McpServerRefNodeConfig>,
    pub work_node_configs: Vec<WorkNodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    id: RunId,
    workflow_id: WorkflowId,
    issue_key: IssueKey,
    status: RunStatus,
    current_work_index: usize,
    total_work_count: usize,
    work_execution_ids: Vec<WorkExecutionId>,
    cancelled_at_work_index: Option<usize>,
    cancellation_reason: Option<String>,
    seed_values: BTreeMap<String, String>,
    git_ref_pool: Vec<GitRefNodeConfig>,
    mcp_server_ref_pool: Vec<McpServerRefNodeConfig>,
    work_node_configs: Vec<WorkNodeConfig>,
    restored_to_checkpoint: bool,
    version: u64,
    created_at: TimestampUtc,
    updated_at: TimestampUtc,
    #[serde(skip)]
    pending: Vec<WorkflowRunEvent>,
}

impl WorkflowRun {
    /// Creates an `INITIALIZED` run over a frozen, sequence-ordered config list.
    pub fn new(params: NewRun) -> EngineResult<Self> {
        if params.work_node_configs.is_empty() {
            return Err(EngineError::invalid_config(
                "a run needs at least one stage",
            ));
        }
        for (index, config) in params.work_node_configs.iter().enumerate() {
            if config.sequence() != index {
                return Err(EngineError::invalid_config(format!(
                    "stage at position {} has sequence {}",
                    index,
                    config.sequence()
                )));
            }
            config.validate()?;
        }

        let now = TimestampUtc::now();
        let mut run = Self {
            id: RunId::new(),
            workflow_id: params.workflow_id,
            issue_key: params.issue_key,
            status: RunStatus::Initialized,
            current_work_index: 0,
            total_work_count: params.work_node_configs.len(),
            work_execution_ids: Vec::new(),
            cancelled_at_work_index: None,
            cancellation_reason: None,
            seed_values: params.seed_values,
            git_ref_pool: params.git_ref_pool,
            mcp_server_ref_pool: params.mcp_server_ref_pool,
            work_node_configs: params.work_node_configs,
            restored_to_checkpoint: false,
            version: 0,
            created_at: now,
            updated_at: now,
            pending: Vec::new(),
        };
        run.record(WorkflowRunEvent::RunCreated {
            run_id: run.id,
            workflow_id: run.workflow_id.clone(),
            issue_key: run.issue_key.clone(),
            total_work_count: run.total_work_count,
            created_at: now,
        });
        Ok(run)
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn issue_key(&self) -> &IssueKey {
        &self.issue_key
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_work_index(&self) -> usize {
        self.current_work_index
    }

    pub fn total_work_count(&self) -> usize {
        self.total_work_count
    }

    pub fn work_execution_ids(&self) -> &[WorkExecutionId] {
        &self.work_execution_ids
    }

    pub fn cancelled_at_work_index(&self) -> Option<usize> {
        self.cancelled_at_work_index
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn seed_values(&self) -> &BTreeMap<String, String> {
        &self.seed_values
    }

    pub fn git_ref_pool(&self) -> &[GitRefNodeConfig] {
        &self.git_ref_pool
    }

    pub fn mcp_server_ref_pool(&self) -> &[McpServerRefNodeConfig] {
        &self.mcp_server_ref_pool
    }

    pub fn work_node_configs(&self) -> &[WorkNodeConfig] {
        &self.work_node_configs
    }

    pub fn work_node_config(&self, sequence: usize) -> Option<&WorkNodeConfig> {
        self.work_node_configs.get(sequence)
    }

    /// Config of the stage `current_work_index` points at, if any remain.
    pub fn current_work_node_config(&self) -> Option<&WorkNodeConfig> {
        self.work_node_configs.get(self.current_work_index)
    }

    pub fn restored_to_checkpoint(&self) -> bool {
        self.restored_to_checkpoint
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Set by stores after a successful save.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn created_at(&self) -> TimestampUtc {
        self.created_at
    }

    pub fn updated_at(&self) -> TimestampUtc {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once a work execution exists for the stage `sequence`.
    pub fn is_stage_executed(&self, sequence: usize) -> bool {
        sequence < self.work_execution_ids.len()
    }

    pub fn start(&mut self) -> EngineResult<()> {
        if self.status != RunStatus::Initialized {
            return Err(self.rejected("start"));
        }
        self.record(WorkflowRunEvent::RunStarted {
            started_at: TimestampUtc::now(),
        });
        Ok(())
    }

    pub fn can_pause(&self) -> bool {
        matches!(self.status, RunStatus::Running | RunStatus::Awaiting)
    }

    pub fn pause(&mut self) -> EngineResult<()> {
        if !self.can_pause() {
            return Err(self.rejected("pause"));
        }
        self.record(WorkflowRunEvent::RunPaused {
            paused_at: TimestampUtc::now(),
        });
        Ok(())
    }

    /// Moves a running run to `AWAITING` after a `pause_after` stage.
    pub fn mark_awaiting(&mut self) -> EngineResult<()> {
        if self.status != RunStatus::Running {
            return Err(self.rejected("await"));
        }
        self.record(WorkflowRunEvent::RunAwaiting {
            work_index: self.current_work_index,
            awaiting_at: TimestampUtc::now(),
        });
        Ok(())
    }

    pub fn can_resume(&self) -> bool {
        matches!(self.status, RunStatus::Paused | RunStatus::Awaiting)
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        if !self.can_resume() {
            return Err(self.rejected("resume"));
        }
        self.record(WorkflowRunEvent::RunResumed {
            resumed_at: TimestampUtc::now(),
        });
        Ok(())
    }

    /// Moves to the next stage, completing the run once none remain.
    pub fn advance_work(&mut self) -> EngineResult<()> {
        if self.status != RunStatus::Running {
            return Err(self.rejected("advance"));
        }
        let work_index = self.current_work_index + 1;
        self.record(WorkflowRunEvent::WorkAdvanced { work_index });
        if work_index >= self.total_work_count {
            self.record(WorkflowRunEvent::RunCompleted {
                completed_at: TimestampUtc::now(),
            });
        }
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(self.rejected("cancel"));
        }
        self.record(WorkflowRunEvent::RunCancelled {
            cancelled_at_work_index: self.current_work_index,
            reason: reason.into(),
            cancelled_at: TimestampUtc::now(),
        });
        Ok(())
    }

    /// Appends the execution created for the current stage.
    pub fn add_work_execution(&mut self, id: WorkExecutionId) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(self.rejected("add a work execution to"));
        }
        if self.work_execution_ids.len() != self.current_work_index {
            return Err(EngineError::invalid_state(format!(
                "run {} already has {} executions for stage index {}",
                self.id,
                self.work_execution_ids.len(),
                self.current_work_index
            )));
        }
        self.record(WorkflowRunEvent::WorkExecutionAdded {
            work_execution_id: id,
            sequence: self.current_work_index,
        });
        Ok(())
    }

    /// Replaces the frozen config in the slot with the same sequence.
    ///
    /// Callers decide whether the stage may still be edited.
    pub fn update_work_node_config(&mut self, config: WorkNodeConfig) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(self.rejected("edit"));
        }
        let slot = self
            .work_node_configs
            .get(config.sequence())
            .ok_or_else(|| EngineError::not_found("stage", config.sequence()))?;
        if slot.id() != config.id() {
            return Err(EngineError::invalid_state(format!(
                "config {} does not belong to stage {}",
                config.id(),
                config.sequence()
            )));
        }
        config.validate()?;
        self.record(WorkflowRunEvent::WorkNodeConfigUpdated { config });
        Ok(())
    }

    /// Rewinds the execution history to `work_sequence` entries.
    ///
    /// Status is left alone; the run must not be running.
    pub fn restore_to_checkpoint(&mut self, work_sequence: usize) -> EngineResult<()> {
        if self.is_terminal() || self.status == RunStatus::Running {
            return Err(self.rejected("restore"));
        }
        if work_sequence > self.work_execution_ids.len() {
            return Err(EngineError::invalid_state(format!(
                "run {} has only {} executions, cannot restore to {}",
                self.id,
                self.work_execution_ids.len(),
                work_sequence
            )));
        }
        let trimmed = self.work_execution_ids[work_sequence..].to_vec();
        self.record(WorkflowRunEvent::RestoredToCheckpoint {
            work_sequence,
            trimmed,
            restored_at: TimestampUtc::now(),
        });
        Ok(())
    }

    /// Drains events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<WorkflowRunEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_events(&self) -> &[WorkflowRunEvent] {
        &self.pending
    }

    fn rejected(&self, action: &str) -> EngineError {
        EngineError::invalid_state(format!(
            "cannot {} run {} while {}",
            action, self.id, self.status
        ))
    }

    fn record(&mut self, event: WorkflowRunEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    fn apply(&mut self, event: &WorkflowRunEvent) {
        match event {
            WorkflowRunEvent::RunCreated { .. } => {}
            WorkflowRunEvent::RunStarted { started_at: at }
            | WorkflowRunEvent::RunResumed { resumed_at: at } => {
                self.status = RunStatus::Running;
                self.updated_at = *at;
            }
            WorkflowRunEvent::RunPaused { paused_at } => {
                self.status = RunStatus::Paused;
                self.updated_at = *paused_at;
            }
            WorkflowRunEvent::RunAwaiting { awaiting_at, .. } => {
                self.status = RunStatus::Awaiting;
                self.updated_at = *awaiting_at;
            }
            WorkflowRunEvent::WorkExecutionAdded {
                work_execution_id, ..
            } => {
                self.work_execution_ids.push(*work_execution_id);
            }
            WorkflowRunEvent::WorkAdvanced { work_index } => {
                self.current_work_index = *work_index;
            }
            WorkflowRunEvent::RunCompleted { completed_at } => {
                self.status = RunStatus::Completed;
                self.updated_at = *completed_at;
            }
            WorkflowRunEvent::RunCancelled {
                cancelled_at_work_index,
                reason,
                cancelled_at,
            } => {
                self.status = RunStatus::Cancelled;
                self.cancelled_at_work_index = Some(*cancelled_at_work_index);
                self.cancellation_reason = Some(reason.clone());
                self.updated_at = *cancelled_at;
            }
            WorkflowRunEvent::WorkNodeConfigUpdated { config } => {
                if let Some(slot) = self.work_node_configs.get_mut(config.sequence()) {
                    *slot = config.clone();
                }
            }
            WorkflowRunEvent::RestoredToCheckpoint {
                work_sequence,
                restored_at,
                ..
            } => {
                self.work_execution_ids.truncate(*work_sequence);
                self.current_work_index = *work_sequence;
                self.restored_to_checkpoint = true;
                self.updated_at = *restored_at;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/run_tests.rs"]
mod tests;
