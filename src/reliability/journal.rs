//! JSONL journal of delivered domain events.
//!
//! Each line carries:
//! - a monotonic sequence number
//! - an ISO 8601 timestamp with microsecond precision
//! - the component (aggregate kind) and the full event envelope

use crate::domain::events::EventEnvelope;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::event_bus::EventHandler;

pub const JOURNAL_HANDLER_NAME: &str = "event-journal";

pub struct EventJournal {
    seq: AtomicU64,
    file: Mutex<File>,
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub ts: String,
    pub component: String,
    pub event: Value,
}

impl EventJournal {
    /// Opens (or creates) `<dir>/events.jsonl` for appending.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            seq: AtomicU64::new(0),
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, component: &str, event: impl Serialize) -> anyhow::Result<()> {
        let entry = JournalEntry {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            component: component.to_string(),
            event: serde_json::to_value(event)?,
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("journal file lock poisoned"))?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

fn component_of(event_type: &str) -> &'static str {
    if event_type.starts_with("Task") || event_type.starts_with("WorkExecution") {
        if event_type == "WorkExecutionAdded" {
            return "Run";
        }
        return "Work";
    }
    "Run"
}

#[async_trait]
impl EventHandler for EventJournal {
    fn name(&self) -> &str {
        JOURNAL_HANDLER_NAME
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.append(component_of(&event.event_type), event)
    }
}
