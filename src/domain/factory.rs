//! Workflow templates and the factory that freezes them into runs.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::node_config::{
    GitRefNodeConfig, McpServerRefNodeConfig, TaskNodeConfig, WorkNodeConfig,
};
use crate::domain::run::{NewRun, WorkflowRun};
use crate::domain::types::{IssueKey, RepositoryId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seed key that always resolves to the run's issue key.
pub const ISSUE_KEY_SEED: &str = "issue_key";

/// A reusable workflow definition, usually read from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub git_refs: Vec<GitRefNodeConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerRefNodeConfig>,
    pub works: Vec<WorkNodeTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkNodeTemplate {
    pub model: String,
    pub tasks: Vec<TaskTemplate>,
    /// Repository ids from the template's `git_refs` pool.
    #[serde(default)]
    pub git_refs: Vec<RepositoryId>,
    /// Server names from the template's `mcp_servers` pool.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub pause_after: bool,
    #[serde(default)]
    pub linked_reports: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub query: String,
    #[serde(default)]
    pub report_outline: Option<String>,
}

pub struct WorkflowRunFactory;

impl WorkflowRunFactory {
    /// Builds an `INITIALIZED` run with every stage copied by value.
    pub fn create(
        template: &WorkflowTemplate,
        issue_key: IssueKey,
        mut seed_values: BTreeMap<String, String>,
    ) -> EngineResult<WorkflowRun> {
        if template.works.is_empty() {
            return Err(EngineError::invalid_config(format!(
                "workflow {} has no stages",
                template.id
            )));
        }
        seed_values.insert(ISSUE_KEY_SEED.to_string(), issue_key.to_string());

        let work_node_configs = template
            .works
            .iter()
            .enumerate()
            .map(|(sequence, work)| freeze_stage(template, sequence, work, &seed_values))
            .collect::<EngineResult<Vec<_>>>()?;

        WorkflowRun::new(NewRun {
            workflow_id: template.id.clone(),
            issue_key,
            seed_values,
            git_ref_pool: template.git_refs.clone(),
            mcp_server_ref_pool: template.mcp_servers.clone(),
            work_node_configs,
        })
    }
}

fn freeze_stage(
    template: &WorkflowTemplate,
    sequence: usize,
    work: &WorkNodeTemplate,
    seeds: &BTreeMap<String, String>,
) -> EngineResult<WorkNodeConfig> {
    let tasks = work
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            TaskNodeConfig::new(index as u32 + 1, &task.query, task.report_outline.clone())
        })
        .collect();

    let git_refs = work
        .git_refs
        .iter()
        .map(|id| {
            template
                .git_refs
                .iter()
                .find(|r| &r.repository_id == id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_config(format!(
                        "stage {} references unknown repository {}",
                        sequence, id
                    ))
                })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let mcp_servers = work
        .mcp_servers
        .iter()
        .map(|name| {
            template
                .mcp_servers
                .iter()
                .find(|s| &s.name == name)
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_config(format!(
                        "stage {} references unknown MCP server {}",
                        sequence, name
                    ))
                })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let config = WorkNodeConfig::new(sequence, &work.model, tasks)?
        .with_git_refs(git_refs)
        .with_mcp_servers(mcp_servers)
        .with_pause_after(work.pause_after)
        .with_linked_reports(work.linked_reports.clone())
        .resolved(seeds);
    config.validate()?;
    Ok(config)
}
