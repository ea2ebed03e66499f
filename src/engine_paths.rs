//! Home-based storage paths for all engine persistence.
//!
//! Everything lives under `~/.workflow-engine/` (or `$WORKFLOW_ENGINE_HOME`):
//! - `config.yaml` - engine configuration
//! - `engine.json` - JSON-file store
//! - `journal/events.jsonl` - delivered domain events
//! - `templates/` - workflow templates
//! - `workspaces/` - per-run workspaces and work trees

use crate::domain::types::{RepositoryId, RunId, WorkExecutionId};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const ENGINE_DIR: &str = ".workflow-engine";

/// Overrides the home-based engine directory.
pub const HOME_ENV: &str = "WORKFLOW_ENGINE_HOME";

/// Returns the engine directory, creating it if needed.
pub fn engine_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory for engine storage")?
            .join(ENGINE_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create engine directory: {}", dir.display()))?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(engine_home_dir()?.join("config.yaml"))
}

pub fn store_path() -> Result<PathBuf> {
    Ok(engine_home_dir()?.join("engine.json"))
}

pub fn journal_dir() -> Result<PathBuf> {
    Ok(engine_home_dir()?.join("journal"))
}

pub fn templates_dir() -> Result<PathBuf> {
    Ok(engine_home_dir()?.join("templates"))
}

pub fn workspaces_dir() -> Result<PathBuf> {
    Ok(engine_home_dir()?.join("workspaces"))
}

/// SHA-256 of the path, truncated to 12 hex characters.
///
/// Canonicalizes first so symlinked paths hash alike.
pub fn path_hash(path: &Path) -> String {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hex_encode(&hasher.finalize()[..6])
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic on-disk layout of run workspaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn stage_dir(&self, run_id: RunId, sequence: usize, work_id: WorkExecutionId) -> PathBuf {
        self.run_dir(run_id)
            .join("stages")
            .join(format!("{:02}-{}", sequence, work_id))
    }

    pub fn report_path(
        &self,
        run_id: RunId,
        sequence: usize,
        work_id: WorkExecutionId,
        task_order: u32,
    ) -> PathBuf {
        self.stage_dir(run_id, sequence, work_id)
            .join("reports")
            .join(format!("task-{:02}.md", task_order))
    }

    /// Where reports of earlier stages are copied for a stage to read.
    pub fn linked_reports_dir(
        &self,
        run_id: RunId,
        sequence: usize,
        work_id: WorkExecutionId,
    ) -> PathBuf {
        self.stage_dir(run_id, sequence, work_id).join("linked")
    }

    /// Work tree of one repository; unique per run and repository.
    pub fn work_tree_path(
        &self,
        run_id: RunId,
        repository_id: &RepositoryId,
        repository_path: &Path,
    ) -> PathBuf {
        self.run_dir(run_id).join("repos").join(format!(
            "{}-{}",
            repository_id,
            path_hash(repository_path)
        ))
    }

    pub fn run_branch(&self, run_id: RunId) -> String {
        format!("run/{}", run_id)
    }
}
