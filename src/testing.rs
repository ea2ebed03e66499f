//! Fixtures and scripted fakes shared by unit tests.

use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::factory::{TaskTemplate, WorkNodeTemplate, WorkflowRunFactory, WorkflowTemplate};
use crate::domain::node_config::GitRefNodeConfig;
use crate::domain::records::{Report, WorkTree};
use crate::domain::run::WorkflowRun;
use crate::domain::types::{
    CheckpointId, CommitHash, DeadLetterId, EventId, ReportId, RunId, SessionId, TimestampUtc,
    WorkExecutionId, WorkflowId,
};
use crate::domain::work::WorkExecution;
use crate::engine_paths::WorkspaceLayout;
use crate::pipeline::{PipelineDriver, QueryRetryPolicy};
use crate::reliability::event_bus::InProcessEventBus;
use crate::reliability::outbox::{DeadLetterRecord, OutboxMessage};
use crate::reliability::unit_of_work::{StagedWrite, TransactionMode};
use crate::services::{
    AgentCapabilities, AgentSessionService, GitService, LocalFileSystem, SessionAttribution,
    SessionRequest, WorkflowConfigReader,
};
use crate::store::{EngineStore, MemoryStore, OutboxStore, RunStore};
use crate::usecases::{Engine, EngineParts};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const ISSUE: &str = "ENG-1";

pub fn repo_ref(id: &str) -> GitRefNodeConfig {
    GitRefNodeConfig {
        repository_id: id.into(),
        repository_path: PathBuf::from(format!("/repos/{}", id)),
        base_branch: "main".to_string(),
    }
}

/// A stage of `tasks` tasks, each with a report outline.
pub fn stage(tasks: usize) -> WorkNodeTemplate {
    WorkNodeTemplate {
        model: "sonnet".to_string(),
        tasks: (1..=tasks)
            .map(|i| TaskTemplate {
                query: format!("Step {} for {{{{issue_key}}}}", i),
                report_outline: Some("## Findings".to_string()),
            })
            .collect(),
        git_refs: Vec::new(),
        mcp_servers: Vec::new(),
        pause_after: false,
        linked_reports: Vec::new(),
    }
}

/// Template with `backend` and `frontend` in its repository pool.
pub fn template(works: Vec<WorkNodeTemplate>) -> WorkflowTemplate {
    WorkflowTemplate {
        id: WorkflowId::from("feature"),
        name: "Feature".to_string(),
        git_refs: vec![repo_ref("backend"), repo_ref("frontend")],
        mcp_servers: Vec::new(),
        works,
    }
}

/// An `INITIALIZED` run of `stage_count` single-task stages.
pub fn new_run(stage_count: usize) -> WorkflowRun {
    let works = (0..stage_count).map(|_| stage(1)).collect();
    WorkflowRunFactory::create(&template(works), ISSUE.into(), BTreeMap::new()).unwrap()
}

pub fn new_work(run: &WorkflowRun, sequence: usize) -> WorkExecution {
    let config = run.work_node_config(sequence).unwrap();
    WorkExecution::new(run.id(), run.workflow_id().clone(), config).unwrap()
}

#[derive(Default)]
struct GitState {
    heads: HashMap<PathBuf, CommitHash>,
    branches: HashSet<(PathBuf, String)>,
    resets: Vec<(PathBuf, CommitHash)>,
    failing_resets: HashSet<PathBuf>,
    pushed: Vec<String>,
}

/// Git with work trees tracked as path -> HEAD.
#[derive(Default)]
pub struct FakeGit {
    state: Mutex<GitState>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self, worktree: &Path) -> Option<CommitHash> {
        self.state.lock().unwrap().heads.get(worktree).cloned()
    }

    /// Simulates the agent committing in a work tree.
    pub fn set_head(&self, worktree: &Path, commit: &str) {
        self.state
            .lock()
            .unwrap()
            .heads
            .insert(worktree.to_path_buf(), commit.into());
    }

    pub fn fail_resets_of(&self, worktree: &Path) {
        self.state
            .lock()
            .unwrap()
            .failing_resets
            .insert(worktree.to_path_buf());
    }

    pub fn resets(&self) -> Vec<(PathBuf, CommitHash)> {
        self.state.lock().unwrap().resets.clone()
    }

    pub fn worktrees(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.state.lock().unwrap().heads.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }
}

#[async_trait]
impl GitService for FakeGit {
    async fn create_worktree(
        &self,
        repository_path: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .heads
            .insert(worktree.to_path_buf(), format!("{}-base", base).into());
        state
            .branches
            .insert((repository_path.to_path_buf(), branch.to_string()));
        Ok(())
    }

    async fn reset_hard(&self, worktree: &Path, commit: &CommitHash) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_resets.contains(worktree) {
            anyhow::bail!("reset of {} rejected", worktree.display());
        }
        if !state.heads.contains_key(worktree) {
            anyhow::bail!("{} is not a work tree", worktree.display());
        }
        state.resets.push((worktree.to_path_buf(), commit.clone()));
        state.heads.insert(worktree.to_path_buf(), commit.clone());
        Ok(())
    }

    async fn current_commit(&self, worktree: &Path) -> anyhow::Result<CommitHash> {
        self.head(worktree)
            .ok_or_else(|| anyhow::anyhow!("{} is not a work tree", worktree.display()))
    }

    async fn delete_worktree(&self, _repository_path: &Path, worktree: &Path) -> anyhow::Result<()> {
        self.state.lock().unwrap().heads.remove(worktree);
        Ok(())
    }

    async fn branch_exists(&self, repository_path: &Path, branch: &str) -> anyhow::Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .branches
            .contains(&(repository_path.to_path_buf(), branch.to_string())))
    }

    async fn delete_branch(&self, repository_path: &Path, branch: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .branches
            .remove(&(repository_path.to_path_buf(), branch.to_string()));
        Ok(())
    }

    async fn push_branch(&self, _worktree: &Path, branch: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().pushed.push(branch.to_string());
        Ok(())
    }
}

struct FakeSession {
    work_execution_id: WorkExecutionId,
    working_dir: PathBuf,
    active: bool,
}

#[derive(Default)]
struct AgentState {
    sessions: HashMap<SessionId, FakeSession>,
    next_id: usize,
    failures_left: usize,
    stop_failures_left: usize,
    queries: Vec<String>,
    attributions: Vec<SessionAttribution>,
}

/// Agent sessions whose queries can be scripted to fail.
pub struct FakeAgents {
    attribution: bool,
    state: Mutex<AgentState>,
}

impl Default for FakeAgents {
    fn default() -> Self {
        Self {
            attribution: true,
            state: Mutex::new(AgentState::default()),
        }
    }
}

impl FakeAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_attribution() -> Self {
        Self {
            attribution: false,
            ..Self::default()
        }
    }

    /// The next `n` queries fail with a transient error.
    pub fn fail_next_queries(&self, n: usize) {
        self.state.lock().unwrap().failures_left = n;
    }

    pub fn fail_next_stops(&self, n: usize) {
        self.state.lock().unwrap().stop_failures_left = n;
    }

    /// Sessions that were started and not deleted, stopped ones included.
    pub fn known_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Every query attempt, failed ones included.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn attributions(&self) -> Vec<SessionAttribution> {
        self.state.lock().unwrap().attributions.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.active)
            .count()
    }

    pub fn working_dir_of(&self, work_id: WorkExecutionId) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| s.work_execution_id == work_id)
            .map(|s| s.working_dir.clone())
    }

    /// Drops every session, as a process restart would.
    pub fn forget_sessions(&self) {
        self.state.lock().unwrap().sessions.clear();
    }
}

#[async_trait]
impl AgentSessionService for FakeAgents {
    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            per_session_attribution: self.attribution,
        }
    }

    async fn start(&self, request: SessionRequest) -> anyhow::Result<SessionId> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = SessionId::from(format!("session-{}", state.next_id));
        state.sessions.insert(
            id.clone(),
            FakeSession {
                work_execution_id: request.work_execution_id,
                working_dir: request.working_dir,
                active: true,
            },
        );
        Ok(id)
    }

    async fn attribute(
        &self,
        _session_id: &SessionId,
        attribution: &SessionAttribution,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .attributions
            .push(attribution.clone());
        Ok(())
    }

    async fn send_query(&self, session_id: &SessionId, query: &str) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(query.to_string());
        if !state.sessions.get(session_id).is_some_and(|s| s.active) {
            return Err(EngineError::not_found("agent session", session_id).into());
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            anyhow::bail!("agent process crashed");
        }
        let first_line = query.lines().next().unwrap_or_default();
        Ok(format!("# Report\n\nAnswer to: {}\n", first_line))
    }

    async fn stop(&self, session_id: &SessionId) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stop_failures_left > 0 {
            state.stop_failures_left -= 1;
            anyhow::bail!("agent process did not exit");
        }
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.active = false;
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> anyhow::Result<()> {
        self.state.lock().unwrap().sessions.remove(session_id);
        Ok(())
    }

    async fn find_session_by_work_execution_id(
        &self,
        work_execution_id: WorkExecutionId,
    ) -> anyhow::Result<Option<SessionId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|(_, s)| s.active && s.work_execution_id == work_execution_id)
            .map(|(id, _)| id.clone()))
    }
}

#[derive(Default)]
pub struct StaticTemplates {
    templates: Mutex<HashMap<WorkflowId, WorkflowTemplate>>,
}

impl StaticTemplates {
    pub fn insert(&self, template: WorkflowTemplate) {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id.clone(), template);
    }
}

#[async_trait]
impl WorkflowConfigReader for StaticTemplates {
    async fn read(&self, workflow_id: &WorkflowId) -> anyhow::Result<WorkflowTemplate> {
        self.templates
            .lock()
            .unwrap()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow template", workflow_id).into())
    }
}

/// Memory store whose next commits can be made to fail.
#[derive(Default)]
pub struct FailingCommits {
    inner: MemoryStore,
    failures_left: AtomicUsize,
    conflicts_left: AtomicUsize,
}

impl FailingCommits {
    pub fn fail_next_commits(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Bumps every run the next `n` commits save, as a concurrent writer would.
    pub fn conflict_next_commits(&self, n: usize) {
        self.conflicts_left.store(n, Ordering::SeqCst);
    }

    async fn bump_saved_runs(&self, writes: &[StagedWrite]) -> EngineResult<()> {
        for write in writes {
            let StagedWrite::SaveRun(run) = write else {
                continue;
            };
            if let Some(stored) = self.inner.load_run(run.id()).await? {
                self.inner.commit(vec![StagedWrite::SaveRun(stored)]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for FailingCommits {
    async fn load_run(&self, id: RunId) -> EngineResult<Option<WorkflowRun>> {
        self.inner.load_run(id).await
    }
    async fn list_runs(&self) -> EngineResult<Vec<WorkflowRun>> {
        self.inner.list_runs().await
    }
    async fn load_work(&self, id: WorkExecutionId) -> EngineResult<Option<WorkExecution>> {
        self.inner.load_work(id).await
    }
    async fn list_works(&self, run_id: RunId) -> EngineResult<Vec<WorkExecution>> {
        self.inner.list_works(run_id).await
    }
    async fn load_checkpoint(&self, id: CheckpointId) -> EngineResult<Option<Checkpoint>> {
        self.inner.load_checkpoint(id).await
    }
    async fn list_checkpoints(&self, run_id: RunId) -> EngineResult<Vec<Checkpoint>> {
        self.inner.list_checkpoints(run_id).await
    }
    async fn list_work_trees(&self, run_id: RunId) -> EngineResult<Vec<WorkTree>> {
        self.inner.list_work_trees(run_id).await
    }
    async fn list_reports(&self, run_id: RunId) -> EngineResult<Vec<Report>> {
        self.inner.list_reports(run_id).await
    }
    async fn load_report(&self, id: ReportId) -> EngineResult<Option<Report>> {
        self.inner.load_report(id).await
    }
}

#[async_trait]
impl OutboxStore for FailingCommits {
    async fn fetch_unpublished(&self, limit: usize) -> EngineResult<Vec<OutboxMessage>> {
        self.inner.fetch_unpublished(limit).await
    }
    async fn mark_published(&self, event_id: EventId, at: TimestampUtc) -> EngineResult<()> {
        self.inner.mark_published(event_id, at).await
    }
    async fn record_failure(&self, event_id: EventId) -> EngineResult<u32> {
        self.inner.record_failure(event_id).await
    }
    async fn exile(&self, record: DeadLetterRecord) -> EngineResult<()> {
        self.inner.exile(record).await
    }
    async fn list_dead_letters(
        &self,
        include_resolved: bool,
    ) -> EngineResult<Vec<DeadLetterRecord>> {
        self.inner.list_dead_letters(include_resolved).await
    }
    async fn resolve_dead_letter(&self, id: DeadLetterId) -> EngineResult<DeadLetterRecord> {
        self.inner.resolve_dead_letter(id).await
    }
}

#[async_trait]
impl EngineStore for FailingCommits {
    fn mode(&self) -> TransactionMode {
        self.inner.mode()
    }

    async fn commit(&self, writes: Vec<StagedWrite>) -> EngineResult<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::storage("injected commit failure"));
        }
        let conflicts = self.conflicts_left.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.conflicts_left.store(conflicts - 1, Ordering::SeqCst);
            self.bump_saved_runs(&writes).await?;
        }
        self.inner.commit(writes).await
    }
}

/// An engine over fakes, with a real file system in a temp directory.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn EngineStore>,
    pub git: Arc<FakeGit>,
    pub agents: Arc<FakeAgents>,
    pub templates: Arc<StaticTemplates>,
    pub bus: Arc<InProcessEventBus>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(MemoryStore::new()), FakeAgents::new())
    }

    pub fn build(store: Arc<dyn EngineStore>, agents: FakeAgents) -> Self {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(FakeGit::new());
        let agents = Arc::new(agents);
        let templates = Arc::new(StaticTemplates::default());
        let bus = Arc::new(InProcessEventBus::new());
        let engine = Arc::new(Engine::new(EngineParts {
            store: store.clone(),
            local_events: bus.clone(),
            agents: agents.clone(),
            git: git.clone(),
            fs: Arc::new(LocalFileSystem::new()),
            templates: templates.clone(),
            layout: WorkspaceLayout::new(dir.path().join("workspaces")),
        }));
        Self {
            engine,
            store,
            git,
            agents,
            templates,
            bus,
            dir,
        }
    }

    /// Driver with the default retry count and no delay.
    pub fn driver(&self) -> Arc<PipelineDriver> {
        Arc::new(PipelineDriver::new(
            self.engine.clone(),
            QueryRetryPolicy {
                delay: Duration::ZERO,
                ..QueryRetryPolicy::default()
            },
        ))
    }

    pub async fn started_run(&self, template: &WorkflowTemplate) -> WorkflowRun {
        self.engine
            .start_run_from_template(template, ISSUE.into(), BTreeMap::new())
            .await
            .unwrap()
    }

    /// Work tree path the engine assigns to `repository_id` in `run_id`.
    pub fn work_tree(&self, run_id: RunId, repository_id: &str) -> PathBuf {
        let git_ref = repo_ref(repository_id);
        self.engine.layout().work_tree_path(
            run_id,
            &git_ref.repository_id,
            &git_ref.repository_path,
        )
    }
}
