//! Agent sessions that invoke a CLI coding agent once per query.

use super::{AgentCapabilities, AgentSessionService, SessionAttribution, SessionRequest};
use crate::domain::errors::EngineError;
use crate::domain::node_config::McpServerRefNodeConfig;
use crate::domain::types::{SessionId, WorkExecutionId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct AgentSession {
    work_execution_id: WorkExecutionId,
    model: String,
    working_dir: PathBuf,
    mcp_servers: Vec<McpServerRefNodeConfig>,
    env: Vec<(String, String)>,
    active: bool,
}

/// Runs `<command> <args...> --model <model> [--mcp-config <json>] <query>`
/// in the stage's working directory.
pub struct CliAgentSessions {
    command: String,
    args: Vec<String>,
    sessions: Mutex<HashMap<SessionId, AgentSession>>,
}

impl CliAgentSessions {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<SessionId, AgentSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("agent session table lock poisoned"))
    }

    fn active_session(&self, session_id: &SessionId) -> Result<AgentSession> {
        match self.sessions()?.get(session_id) {
            Some(session) if session.active => Ok(session.clone()),
            _ => Err(EngineError::not_found("agent session", session_id).into()),
        }
    }
}

fn mcp_config(servers: &[McpServerRefNodeConfig]) -> serde_json::Value {
    let entries: serde_json::Map<String, serde_json::Value> = servers
        .iter()
        .map(|s| {
            (
                s.name.clone(),
                serde_json::json!({ "command": s.command, "args": s.args }),
            )
        })
        .collect();
    serde_json::json!({ "mcpServers": entries })
}

#[async_trait]
impl AgentSessionService for CliAgentSessions {
    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            per_session_attribution: true,
        }
    }

    async fn start(&self, request: SessionRequest) -> Result<SessionId> {
        let session_id = SessionId::from(Uuid::new_v4().to_string());
        let session = AgentSession {
            work_execution_id: request.work_execution_id,
            model: request.model,
            working_dir: request.working_dir,
            mcp_servers: request.mcp_servers,
            env: vec![(
                "WORKFLOW_ENGINE_RUN_ID".to_string(),
                request.run_id.to_string(),
            )],
            active: true,
        };
        self.sessions()?.insert(session_id.clone(), session);
        tracing::debug!(session_id = %session_id, "agent session started");
        Ok(session_id)
    }

    async fn attribute(
        &self,
        session_id: &SessionId,
        attribution: &SessionAttribution,
    ) -> Result<()> {
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::not_found("agent session", session_id))?;
        session.env.push((
            "WORKFLOW_ENGINE_WORKFLOW_ID".to_string(),
            attribution.workflow_id.to_string(),
        ));
        session.env.push((
            "WORKFLOW_ENGINE_ISSUE_KEY".to_string(),
            attribution.issue_key.to_string(),
        ));
        Ok(())
    }

    async fn send_query(&self, session_id: &SessionId, query: &str) -> Result<String> {
        let session = self.active_session(session_id)?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg("--model").arg(&session.model);
        if !session.mcp_servers.is_empty() {
            cmd.arg("--mcp-config")
                .arg(mcp_config(&session.mcp_servers).to_string());
        }
        cmd.arg(query);
        cmd.envs(session.env.iter().map(|(k, v)| (k, v)));
        cmd.current_dir(&session.working_dir);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn agent {}", self.command))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "agent exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stop(&self, session_id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::not_found("agent session", session_id))?;
        session.active = false;
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<()> {
        self.sessions()?.remove(session_id);
        Ok(())
    }

    async fn find_session_by_work_execution_id(
        &self,
        work_execution_id: WorkExecutionId,
    ) -> Result<Option<SessionId>> {
        Ok(self
            .sessions()?
            .iter()
            .find(|(_, s)| s.active && s.work_execution_id == work_execution_id)
            .map(|(id, _)| id.clone()))
    }
}
