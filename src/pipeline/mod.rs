//! Background loop that drives a run from stage to stage.
//!
//! The driver never propagates errors: it logs a start and an end line for
//! every invocation and reports how it stopped through `DriveOutcome`.

pub mod guard;

pub use guard::{RunGuard, RunLease};

use crate::domain::errors::EngineResult;
use crate::domain::run::RunStatus;
use crate::domain::types::{RunId, WorkExecutionId};
use crate::usecases::{Engine, StageStart};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Fixed-delay retry for agent queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for QueryRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The run left `RUNNING`, or has no stage left to run.
    Finished { status: RunStatus },
    RunMissing,
    /// Another driver holds the run.
    AlreadyActive,
    Errored,
}

pub struct PipelineDriver {
    engine: Arc<Engine>,
    retry: QueryRetryPolicy,
}

impl PipelineDriver {
    pub fn new(engine: Arc<Engine>, retry: QueryRetryPolicy) -> Self {
        Self { engine, retry }
    }

    /// Lease table shared by every driver of the same engine.
    pub fn guard(&self) -> &RunGuard {
        self.engine.run_guard()
    }

    /// Runs `drive` on a tokio task.
    pub fn spawn(self: &Arc<Self>, run_id: RunId) -> JoinHandle<DriveOutcome> {
        let driver = Arc::clone(self);
        tokio::spawn(async move { driver.drive(run_id).await })
    }

    /// Drives the run until it stops running.
    pub async fn drive(&self, run_id: RunId) -> DriveOutcome {
        let Some(_lease) = self.guard().try_acquire(run_id) else {
            tracing::info!(run_id = %run_id, "pipeline already active for run");
            return DriveOutcome::AlreadyActive;
        };

        tracing::info!(run_id = %run_id, "pipeline started");
        let outcome = match self.drive_loop(run_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(run_id = %run_id, error = %err, "pipeline stopped on error");
                DriveOutcome::Errored
            }
        };
        tracing::info!(run_id = %run_id, outcome = ?outcome, "pipeline finished");
        outcome
    }

    async fn drive_loop(&self, run_id: RunId) -> EngineResult<DriveOutcome> {
        loop {
            let run = match self.engine.get_run(run_id).await {
                Ok(run) => run,
                Err(err) if err.is_not_found() => return Ok(DriveOutcome::RunMissing),
                Err(err) => return Err(err),
            };
            if run.status() != RunStatus::Running {
                return Ok(DriveOutcome::Finished {
                    status: run.status(),
                });
            }

            match self.engine.start_next_stage(run_id).await? {
                StageStart::Started(work_id) => self.run_stage(run_id, work_id).await?,
                StageStart::Complete => {
                    let run = self.engine.get_run(run_id).await?;
                    return Ok(DriveOutcome::Finished {
                        status: run.status(),
                    });
                }
            }
        }
    }

    /// Runs tasks of one stage until it completes or the run stops.
    async fn run_stage(&self, run_id: RunId, work_id: WorkExecutionId) -> EngineResult<()> {
        loop {
            let response = match self.send_with_retry(work_id).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        run_id = %run_id,
                        work_execution_id = %work_id,
                        error = %err,
                        "query failed, containing"
                    );
                    if let Err(err) = self.engine.contain_failure(work_id).await {
                        tracing::error!(
                            run_id = %run_id,
                            work_execution_id = %work_id,
                            error = %err,
                            "failure containment failed"
                        );
                    }
                    return Ok(());
                }
            };

            // Cancelled while the query was in flight.
            if self.engine.get_run(run_id).await?.is_terminal() {
                return Ok(());
            }
            let outcome = self.engine.complete_task(work_id, &response).await?;
            if !outcome.has_next_task
                || outcome.stage_completed
                || outcome.run_status != RunStatus::Running
            {
                return Ok(());
            }
        }
    }

    async fn send_with_retry(&self, work_id: WorkExecutionId) -> EngineResult<String> {
        let mut retries = 0;
        loop {
            match self.engine.send_query(work_id).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_not_found() || retries >= self.retry.max_retries => {
                    return Err(err)
                }
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        work_execution_id = %work_id,
                        retry = retries,
                        max_retries = self.retry.max_retries,
                        error = %err,
                        "query failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
