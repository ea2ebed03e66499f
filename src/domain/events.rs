//! Domain events emitted by the run and stage aggregates.
//!
//! Events are facts. Aggregates apply them to themselves first, then buffer
//! them so the calling use case can persist and publish them together with
//! the state change that produced them.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::node_config::WorkNodeConfig;
use crate::domain::types::{
    EventId, IssueKey, ReportId, RunId, TimestampUtc, WorkExecutionId, WorkflowId,
};
use cqrs_es::DomainEvent;
use serde::{Deserialize, Serialize};

/// Events emitted by the `WorkflowRun` aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunEvent {
    RunCreated {
        run_id: RunId,
        workflow_id: WorkflowId,
        issue_key: IssueKey,
        total_work_count: usize,
        created_at: TimestampUtc,
    },
    RunStarted {
        started_at: TimestampUtc,
    },
    RunPaused {
        paused_at: TimestampUtc,
    },
    /// A stage with `pause_after` finished and the run waits for a human.
    RunAwaiting {
        work_index: usize,
        awaiting_at: TimestampUtc,
    },
    RunResumed {
        resumed_at: TimestampUtc,
    },
    WorkExecutionAdded {
        work_execution_id: WorkExecutionId,
        sequence: usize,
    },
    WorkAdvanced {
        work_index: usize,
    },
    RunCompleted {
        completed_at: TimestampUtc,
    },
    RunCancelled {
        cancelled_at_work_index: usize,
        reason: String,
        cancelled_at: TimestampUtc,
    },
    WorkNodeConfigUpdated {
        config: WorkNodeConfig,
    },
    RestoredToCheckpoint {
        work_sequence: usize,
        trimmed: Vec<WorkExecutionId>,
        restored_at: TimestampUtc,
    },
}

impl DomainEvent for WorkflowRunEvent {
    fn event_type(&self) -> String {
        match self {
            Self::RunCreated { .. } => "RunCreated",
            Self::RunStarted { .. } => "RunStarted",
            Self::RunPaused { .. } => "RunPaused",
            Self::RunAwaiting { .. } => "RunAwaiting",
            Self::RunResumed { .. } => "RunResumed",
            Self::WorkExecutionAdded { .. } => "WorkExecutionAdded",
            Self::WorkAdvanced { .. } => "WorkAdvanced",
            Self::RunCompleted { .. } => "RunCompleted",
            Self::RunCancelled { .. } => "RunCancelled",
            Self::WorkNodeConfigUpdated { .. } => "WorkNodeConfigUpdated",
            Self::RestoredToCheckpoint { .. } => "RestoredToCheckpoint",
        }
        .to_string()
    }

    fn event_version(&self) -> String {
        "1".to_string()
    }
}

/// Events emitted by the `WorkExecution` aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkExecutionEvent {
    WorkExecutionStarted {
        work_execution_id: WorkExecutionId,
        run_id: RunId,
        sequence: usize,
        task_count: usize,
        started_at: TimestampUtc,
    },
    TaskCompleted {
        task_index: usize,
        report_id: Option<ReportId>,
        completed_at: TimestampUtc,
    },
    TaskFailed {
        task_index: usize,
        failed_at: TimestampUtc,
    },
    TaskAdvanced {
        task_index: usize,
    },
    WorkExecutionCompleted {
        completed_at: TimestampUtc,
    },
    WorkExecutionCancelled {
        cancelled_at: TimestampUtc,
    },
    WorkExecutionReset {
        from_index: usize,
        reset_at: TimestampUtc,
    },
}

impl DomainEvent for WorkExecutionEvent {
    fn event_type(&self) -> String {
        match self {
            Self::WorkExecutionStarted { .. } => "WorkExecutionStarted",
            Self::TaskCompleted { .. } => "TaskCompleted",
            Self::TaskFailed { .. } => "TaskFailed",
            Self::TaskAdvanced { .. } => "TaskAdvanced",
            Self::WorkExecutionCompleted { .. } => "WorkExecutionCompleted",
            Self::WorkExecutionCancelled { .. } => "WorkExecutionCancelled",
            Self::WorkExecutionReset { .. } => "WorkExecutionReset",
        }
        .to_string()
    }

    fn event_version(&self) -> String {
        "1".to_string()
    }
}

/// Transport form of a domain event, as stored in the outbox and handed
/// to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: String,
    pub aggregate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: TimestampUtc,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wraps an event raised by the aggregate `aggregate_id`.
    pub fn wrap<E: DomainEvent>(
        event: &E,
        aggregate_id: impl ToString,
        correlation_id: Option<RunId>,
    ) -> EngineResult<Self> {
        let payload = serde_json::to_value(event).map_err(|e| {
            EngineError::storage(format!(
                "failed to serialize {} event: {}",
                event.event_type(),
                e
            ))
        })?;
        Ok(Self {
            event_id: EventId::new(),
            event_type: event.event_type(),
            event_version: event.event_version(),
            aggregate_id: Some(aggregate_id.to_string()),
            correlation_id: correlation_id.map(|id| id.to_string()),
            occurred_at: TimestampUtc::now(),
            payload,
        })
    }
}
