//! Execution records for one stage and its tasks.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::events::WorkExecutionEvent;
use crate::domain::node_config::WorkNodeConfig;
use crate::domain::types::{
    ReportId, RunId, TimestampUtc, WorkExecutionId, WorkNodeId, WorkflowId,
};
use serde::{Deserialize, Serialize};

/// Outcome of one task. Exactly one terminal state can hold at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub order: u32,
    pub query: String,
    pub report_outline: Option<String>,
    pub report_id: Option<ReportId>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkExecution {
    id: WorkExecutionId,
    run_id: RunId,
    workflow_id: WorkflowId,
    work_node_id: WorkNodeId,
    sequence: usize,
    model: String,
    tasks: Vec<TaskExecution>,
    current_task_index: usize,
    completed: bool,
    cancelled: bool,
    created_at: TimestampUtc,
    #[serde(skip)]
    pending: Vec<WorkExecutionEvent>,
}

impl WorkExecution {
    /// Materializes a stage config into a fresh execution.
    pub fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        config: &WorkNodeConfig,
    ) -> EngineResult<Self> {
        if config.tasks().is_empty() {
            return Err(EngineError::invalid_config(format!(
                "stage {} has no tasks",
                config.sequence()
            )));
        }
        let tasks = config
            .tasks()
            .iter()
            .map(|task| TaskExecution {
                order: task.order(),
                query: task.query().to_string(),
                report_outline: task.report_outline().map(str::to_string),
                report_id: None,
                status: TaskStatus::Pending,
            })
            .collect::<Vec<_>>();
        let now = TimestampUtc::now();
        let mut work = Self {
            id: WorkExecutionId::new(),
            run_id,
            workflow_id,
            work_node_id: config.id(),
            sequence: config.sequence(),
            model: config.model().to_string(),
            tasks,
            current_task_index: 0,
            completed: false,
            cancelled: false,
            created_at: now,
            pending: Vec::new(),
        };
        work.record(WorkExecutionEvent::WorkExecutionStarted {
            work_execution_id: work.id,
            run_id,
            sequence: work.sequence,
            task_count: work.tasks.len(),
            started_at: now,
        });
        Ok(work)
    }

    pub fn id(&self) -> WorkExecutionId {
        self.id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn work_node_id(&self) -> WorkNodeId {
        self.work_node_id
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn tasks(&self) -> &[TaskExecution] {
        &self.tasks
    }

    pub fn current_task_index(&self) -> usize {
        self.current_task_index
    }

    pub fn current_task(&self) -> Option<&TaskExecution> {
        self.tasks.get(self.current_task_index)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.cancelled
    }

    pub fn created_at(&self) -> TimestampUtc {
        self.created_at
    }

    pub fn complete_current_task(&mut self, report_id: Option<ReportId>) -> EngineResult<()> {
        self.ensure_open_task("complete")?;
        self.record(WorkExecutionEvent::TaskCompleted {
            task_index: self.current_task_index,
            report_id,
            completed_at: TimestampUtc::now(),
        });
        Ok(())
    }

    pub fn fail_current_task(&mut self) -> EngineResult<()> {
        self.ensure_open_task("fail")?;
        self.record(WorkExecutionEvent::TaskFailed {
            task_index: self.current_task_index,
            failed_at: TimestampUtc::now(),
        });
        Ok(())
    }

    /// Moves to the next task.
    ///
    /// Returns false once the last task has been passed; the stage is then
    /// completed and the completion event is recorded exactly once.
    pub fn advance_to_next_task(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.current_task_index + 1 >= self.tasks.len() {
            self.record(WorkExecutionEvent::WorkExecutionCompleted {
                completed_at: TimestampUtc::now(),
            });
            return false;
        }
        self.record(WorkExecutionEvent::TaskAdvanced {
            task_index: self.current_task_index + 1,
        });
        true
    }

    /// Cancels the stage and every task that has not finished yet.
    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.record(WorkExecutionEvent::WorkExecutionCancelled {
            cancelled_at: TimestampUtc::now(),
        });
    }

    /// Reopens the stage at `from_index`; earlier tasks keep their outcome.
    pub fn reset(&mut self, from_index: usize) -> EngineResult<()> {
        if from_index >= self.tasks.len() {
            return Err(EngineError::invalid_state(format!(
                "stage {} has {} tasks, cannot reset from {}",
                self.id,
                self.tasks.len(),
                from_index
            )));
        }
        self.record(WorkExecutionEvent::WorkExecutionReset {
            from_index,
            reset_at: TimestampUtc::now(),
        });
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<WorkExecutionEvent> {
        std::mem::take(&mut self.pending)
    }

    fn ensure_open_task(&self, action: &str) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "cannot {} a task of finished stage {}",
                action, self.id
            )));
        }
        match self.current_task() {
            Some(task) if !task.status.is_terminal() => Ok(()),
            _ => Err(EngineError::invalid_state(format!(
                "stage {} has no open task at index {}",
                self.id, self.current_task_index
            ))),
        }
    }

    fn record(&mut self, event: WorkExecutionEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    fn apply(&mut self, event: &WorkExecutionEvent) {
        match event {
            WorkExecutionEvent::WorkExecutionStarted { .. } => {}
            WorkExecutionEvent::TaskCompleted {
                task_index,
                report_id,
                ..
            } => {
                if let Some(task) = self.tasks.get_mut(*task_index) {
                    task.status = TaskStatus::Completed;
                    task.report_id = *report_id;
                }
            }
            WorkExecutionEvent::TaskFailed { task_index, .. } => {
                if let Some(task) = self.tasks.get_mut(*task_index) {
                    task.status = TaskStatus::Failed;
                }
            }
            WorkExecutionEvent::TaskAdvanced { task_index } => {
                self.current_task_index = *task_index;
            }
            WorkExecutionEvent::WorkExecutionCompleted { .. } => {
                self.completed = true;
            }
            WorkExecutionEvent::WorkExecutionCancelled { .. } => {
                self.cancelled = true;
                for task in self.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                    task.status = TaskStatus::Cancelled;
                }
            }
            WorkExecutionEvent::WorkExecutionReset { from_index, .. } => {
                for task in self.tasks.iter_mut().skip(*from_index) {
                    task.status = TaskStatus::Pending;
                    task.report_id = None;
                }
                self.current_task_index = *from_index;
                self.completed = false;
                self.cancelled = false;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/work_tests.rs"]
mod tests;
