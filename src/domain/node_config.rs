//! Frozen run configuration value objects.
//!
//! A run copies these by value at creation time, so later template edits
//! never leak into a run that is already executing. Every `with_*` method
//! returns a new value and keeps the original `id`.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::types::{RepositoryId, WorkNodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A repository a run may check out into a work tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRefNodeConfig {
    pub repository_id: RepositoryId,
    /// Path of the local clone work trees are added from.
    pub repository_path: PathBuf,
    /// Branch (or any commit-ish) new work trees start from.
    pub base_branch: String,
}

/// An MCP tool server made available to the agent of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerRefNodeConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One query/response step of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNodeConfig {
    order: u32,
    query: String,
    report_outline: Option<String>,
}

impl TaskNodeConfig {
    pub fn new(order: u32, query: impl Into<String>, report_outline: Option<String>) -> Self {
        Self {
            order,
            query: query.into(),
            report_outline,
        }
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn report_outline(&self) -> Option<&str> {
        self.report_outline.as_deref()
    }

    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }

    pub fn with_report_outline(&self, outline: Option<String>) -> Self {
        Self {
            report_outline: outline,
            ..self.clone()
        }
    }

    /// Replaces `{{key}}` placeholders in the query and outline.
    pub fn resolved(&self, seeds: &BTreeMap<String, String>) -> Self {
        Self {
            order: self.order,
            query: substitute(&self.query, seeds),
            report_outline: self.report_outline.as_ref().map(|o| substitute(o, seeds)),
        }
    }
}

/// Configuration of one stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkNodeConfig {
    id: WorkNodeId,
    sequence: usize,
    model: String,
    tasks: Vec<TaskNodeConfig>,
    git_refs: Vec<GitRefNodeConfig>,
    mcp_servers: Vec<McpServerRefNodeConfig>,
    pause_after: bool,
    linked_report_sequences: Vec<usize>,
}

impl WorkNodeConfig {
    /// Builds a validated stage configuration.
    ///
    /// Tasks are kept sorted by `order`; at least one task is required and
    /// linked reports must come from strictly earlier stages.
    pub fn new(
        sequence: usize,
        model: impl Into<String>,
        tasks: Vec<TaskNodeConfig>,
    ) -> EngineResult<Self> {
        let config = Self {
            id: WorkNodeId::new(),
            sequence,
            model: model.into(),
            tasks: sorted_tasks(tasks),
            git_refs: Vec::new(),
            mcp_servers: Vec::new(),
            pause_after: false,
            linked_report_sequences: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::invalid_config(format!(
                "stage {} must have at least one task",
                self.sequence
            )));
        }
        if self.model.trim().is_empty() {
            return Err(EngineError::invalid_config(format!(
                "stage {} has no model",
                self.sequence
            )));
        }
        if let Some(bad) = self
            .linked_report_sequences
            .iter()
            .find(|linked| **linked >= self.sequence)
        {
            return Err(EngineError::invalid_config(format!(
                "stage {} links reports of stage {}, which does not run before it",
                self.sequence, bad
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> WorkNodeId {
        self.id
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn tasks(&self) -> &[TaskNodeConfig] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&TaskNodeConfig> {
        self.tasks.get(index)
    }

    pub fn git_refs(&self) -> &[GitRefNodeConfig] {
        &self.git_refs
    }

    pub fn mcp_servers(&self) -> &[McpServerRefNodeConfig] {
        &self.mcp_servers
    }

    pub fn pause_after(&self) -> bool {
        self.pause_after
    }

    pub fn linked_report_sequences(&self) -> &[usize] {
        &self.linked_report_sequences
    }

    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn with_tasks(&self, tasks: Vec<TaskNodeConfig>) -> Self {
        Self {
            tasks: sorted_tasks(tasks),
            ..self.clone()
        }
    }

    pub fn with_git_refs(&self, git_refs: Vec<GitRefNodeConfig>) -> Self {
        Self {
            git_refs,
            ..self.clone()
        }
    }

    pub fn with_mcp_servers(&self, mcp_servers: Vec<McpServerRefNodeConfig>) -> Self {
        Self {
            mcp_servers,
            ..self.clone()
        }
    }

    pub fn with_pause_after(&self, pause_after: bool) -> Self {
        Self {
            pause_after,
            ..self.clone()
        }
    }

    pub fn with_linked_reports(&self, sequences: Vec<usize>) -> Self {
        Self {
            linked_report_sequences: sequences,
            ..self.clone()
        }
    }

    /// Returns a copy with every task resolved against the seed values.
    pub fn resolved(&self, seeds: &BTreeMap<String, String>) -> Self {
        Self {
            tasks: self.tasks.iter().map(|t| t.resolved(seeds)).collect(),
            ..self.clone()
        }
    }
}

fn sorted_tasks(mut tasks: Vec<TaskNodeConfig>) -> Vec<TaskNodeConfig> {
    tasks.sort_by_key(|t| t.order);
    tasks
}

/// Replaces every `{{key}}` with its seed value. Unknown keys are left as-is.
pub fn substitute(template: &str, seeds: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in seeds {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

#[cfg(test)]
#[path = "tests/node_config_tests.rs"]
mod tests;
