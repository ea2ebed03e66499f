//! Narrow interfaces to the engine's external collaborators.
//!
//! Implementations return `anyhow::Result`; a collaborator that wants the
//! engine to treat a failure as "target is gone" wraps an
//! `EngineError::NotFound` in the `anyhow::Error`.

pub mod agent;
pub mod fs;
pub mod git;
pub mod templates;

pub use agent::CliAgentSessions;
pub use fs::LocalFileSystem;
pub use git::GitCli;
pub use templates::YamlTemplateReader;

use crate::domain::factory::WorkflowTemplate;
use crate::domain::node_config::McpServerRefNodeConfig;
use crate::domain::types::{CommitHash, IssueKey, RunId, SessionId, WorkExecutionId, WorkflowId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Optional features an agent session service declares up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCapabilities {
    /// Sessions can be tagged with the run and issue they work for.
    pub per_session_attribution: bool,
}

/// What a new agent session is started for.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub run_id: RunId,
    pub work_execution_id: WorkExecutionId,
    pub model: String,
    pub working_dir: PathBuf,
    pub mcp_servers: Vec<McpServerRefNodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttribution {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub issue_key: IssueKey,
}

/// One external coding-agent session per stage.
#[async_trait]
pub trait AgentSessionService: Send + Sync {
    fn capabilities(&self) -> AgentCapabilities;

    async fn start(&self, request: SessionRequest) -> anyhow::Result<SessionId>;

    /// Only called when `capabilities().per_session_attribution` is set.
    async fn attribute(
        &self,
        _session_id: &SessionId,
        _attribution: &SessionAttribution,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_query(&self, session_id: &SessionId, query: &str) -> anyhow::Result<String>;

    async fn stop(&self, session_id: &SessionId) -> anyhow::Result<()>;

    async fn delete_session(&self, session_id: &SessionId) -> anyhow::Result<()>;

    /// The live session serving a stage, if any.
    async fn find_session_by_work_execution_id(
        &self,
        work_execution_id: WorkExecutionId,
    ) -> anyhow::Result<Option<SessionId>>;
}

#[async_trait]
pub trait GitService: Send + Sync {
    /// Adds `worktree` on a new `branch` starting at `base`.
    async fn create_worktree(
        &self,
        repository_path: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> anyhow::Result<()>;

    async fn reset_hard(&self, worktree: &Path, commit: &CommitHash) -> anyhow::Result<()>;

    async fn current_commit(&self, worktree: &Path) -> anyhow::Result<CommitHash>;

    async fn delete_worktree(&self, repository_path: &Path, worktree: &Path)
        -> anyhow::Result<()>;

    async fn branch_exists(&self, repository_path: &Path, branch: &str) -> anyhow::Result<bool>;

    async fn delete_branch(&self, repository_path: &Path, branch: &str) -> anyhow::Result<()>;

    async fn push_branch(&self, worktree: &Path, branch: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub len: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn create_directory(&self, path: &Path) -> anyhow::Result<()>;
    async fn delete_directory(&self, path: &Path) -> anyhow::Result<()>;
    async fn create_file(&self, path: &Path, content: &str) -> anyhow::Result<()>;
    async fn read_file(&self, path: &Path) -> anyhow::Result<String>;
    async fn delete_file(&self, path: &Path) -> anyhow::Result<()>;
    /// `None` when nothing exists at `path`.
    async fn stat(&self, path: &Path) -> anyhow::Result<Option<FileStat>>;
    async fn list(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>>;
    async fn copy(&self, from: &Path, to: &Path) -> anyhow::Result<()>;
    async fn move_path(&self, from: &Path, to: &Path) -> anyhow::Result<()>;
}

/// Source of the workflow templates runs are built from.
#[async_trait]
pub trait WorkflowConfigReader: Send + Sync {
    async fn read(&self, workflow_id: &WorkflowId) -> anyhow::Result<WorkflowTemplate>;
}
