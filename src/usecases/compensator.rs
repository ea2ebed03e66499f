use crate::reliability::compensation::{Compensation, CompensationExecutor};
use crate::services::{AgentSessionService, FileSystem, GitService};
use async_trait::async_trait;
use std::sync::Arc;

/// Executes compensations against the engine's collaborators.
#[derive(Clone)]
pub struct ServiceCompensator {
    git: Arc<dyn GitService>,
    fs: Arc<dyn FileSystem>,
    agents: Arc<dyn AgentSessionService>,
}

impl ServiceCompensator {
    pub fn new(
        git: Arc<dyn GitService>,
        fs: Arc<dyn FileSystem>,
        agents: Arc<dyn AgentSessionService>,
    ) -> Self {
        Self { git, fs, agents }
    }
}

#[async_trait]
impl CompensationExecutor for ServiceCompensator {
    async fn execute(&self, action: &Compensation) -> anyhow::Result<()> {
        match action {
            Compensation::ResetWorkTree { path, commit, .. } => {
                self.git.reset_hard(path, commit).await
            }
            Compensation::RemoveWorkTree {
                repository_path,
                path,
            } => self.git.delete_worktree(repository_path, path).await,
            Compensation::RemoveDirectory { path } => self.fs.delete_directory(path).await,
            Compensation::RemoveFile { path } => self.fs.delete_file(path).await,
            Compensation::StopSession { session_id } => {
                let stopped = self.agents.stop(session_id).await;
                let deleted = self.agents.delete_session(session_id).await;
                stopped.and(deleted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{RunId, WorkExecutionId};
    use crate::services::{LocalFileSystem, SessionRequest};
    use crate::testing::{FakeAgents, FakeGit};

    #[tokio::test]
    async fn failed_stop_still_deletes_the_session() {
        let agents = Arc::new(FakeAgents::new());
        let compensator = ServiceCompensator::new(
            Arc::new(FakeGit::new()),
            Arc::new(LocalFileSystem::new()),
            agents.clone(),
        );
        let session_id = agents
            .start(SessionRequest {
                run_id: RunId::new(),
                work_execution_id: WorkExecutionId::new(),
                model: "sonnet".to_string(),
                working_dir: std::env::temp_dir(),
                mcp_servers: Vec::new(),
            })
            .await
            .unwrap();
        agents.fail_next_stops(1);

        let result = compensator
            .execute(&Compensation::StopSession { session_id })
            .await;

        assert!(result.unwrap_err().to_string().contains("did not exit"));
        assert_eq!(agents.known_sessions(), 0);
    }
}
