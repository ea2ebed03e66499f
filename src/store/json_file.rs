//! Transactional store backed by a single JSON document.
//!
//! - Writers hold an exclusive `fs2` lock on a sidecar lock file
//! - A commit applies every write to a fresh copy of the state and only
//!   then replaces the document (temp file + rename), so it lands whole
//!   or not at all

use super::{EngineStore, OutboxStore, RunStore, StoreState};
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::records::{Report, WorkTree};
use crate::domain::run::WorkflowRun;
use crate::domain::types::{
    CheckpointId, DeadLetterId, EventId, ReportId, RunId, TimestampUtc, WorkExecutionId,
};
use crate::domain::work::WorkExecution;
use crate::reliability::outbox::{DeadLetterRecord, OutboxMessage};
use crate::reliability::unit_of_work::{StagedWrite, TransactionMode};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> EngineResult<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error("create store directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| io_error("open lock file", e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| io_error("lock store", e))?;
        Ok(file)
    }

    fn load(&self) -> EngineResult<StoreState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(StoreState::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                EngineError::storage(format!("corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(io_error("read store", e)),
        }
    }

    fn save(&self, state: &StoreState) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::storage(format!("serialize store: {}", e)))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| io_error("write store", e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| io_error("replace store", e))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> EngineResult<T> {
        let lock = self.lock(false)?;
        let result = self.load().map(|state| f(&state));
        drop(lock);
        result
    }

    /// Loads, mutates and saves under the exclusive lock. Nothing is
    /// written when `f` fails.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> EngineResult<T>) -> EngineResult<T> {
        let lock = self.lock(true)?;
        let mut state = self.load()?;
        let value = f(&mut state)?;
        self.save(&state)?;
        drop(lock);
        Ok(value)
    }
}

fn io_error(action: &str, err: std::io::Error) -> EngineError {
    EngineError::storage(format!("{}: {}", action, err))
}

#[async_trait]
impl RunStore for JsonFileStore {
    async fn load_run(&self, id: RunId) -> EngineResult<Option<WorkflowRun>> {
        self.read(|s| s.run(id))
    }

    async fn list_runs(&self) -> EngineResult<Vec<WorkflowRun>> {
        self.read(StoreState::runs)
    }

    async fn load_work(&self, id: WorkExecutionId) -> EngineResult<Option<WorkExecution>> {
        self.read(|s| s.work(id))
    }

    async fn list_works(&self, run_id: RunId) -> EngineResult<Vec<WorkExecution>> {
        self.read(|s| s.works_of(run_id))
    }

    async fn load_checkpoint(&self, id: CheckpointId) -> EngineResult<Option<Checkpoint>> {
        self.read(|s| s.checkpoint(id))
    }

    async fn list_checkpoints(&self, run_id: RunId) -> EngineResult<Vec<Checkpoint>> {
        self.read(|s| s.checkpoints_of(run_id))
    }

    async fn list_work_trees(&self, run_id: RunId) -> EngineResult<Vec<WorkTree>> {
        self.read(|s| s.work_trees_of(run_id))
    }

    async fn list_reports(&self, run_id: RunId) -> EngineResult<Vec<Report>> {
        self.read(|s| s.reports_of(run_id))
    }

    async fn load_report(&self, id: ReportId) -> EngineResult<Option<Report>> {
        self.read(|s| s.report(id))
    }
}

#[async_trait]
impl OutboxStore for JsonFileStore {
    async fn fetch_unpublished(&self, limit: usize) -> EngineResult<Vec<OutboxMessage>> {
        self.read(|s| s.unpublished(limit))
    }

    async fn mark_published(&self, event_id: EventId, at: TimestampUtc) -> EngineResult<()> {
        self.mutate(|s| s.mark_published(event_id, at))
    }

    async fn record_failure(&self, event_id: EventId) -> EngineResult<u32> {
        self.mutate(|s| s.record_failure(event_id))
    }

    async fn exile(&self, record: DeadLetterRecord) -> EngineResult<()> {
        self.mutate(|s| s.exile(record))
    }

    async fn list_dead_letters(
        &self,
        include_resolved: bool,
    ) -> EngineResult<Vec<DeadLetterRecord>> {
        self.read(|s| s.dead_letters(include_resolved))
    }

    async fn resolve_dead_letter(&self, id: DeadLetterId) -> EngineResult<DeadLetterRecord> {
        self.mutate(|s| s.resolve_dead_letter(id))
    }
}

#[async_trait]
impl EngineStore for JsonFileStore {
    fn mode(&self) -> TransactionMode {
        TransactionMode::Transactional
    }

    async fn commit(&self, writes: Vec<StagedWrite>) -> EngineResult<()> {
        self.mutate(|state| {
            for write in writes {
                state.apply(write)?;
            }
            Ok(())
        })
    }
}
