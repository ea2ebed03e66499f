//! Workflow templates stored as `<dir>/<workflow-id>.yaml`.

use super::WorkflowConfigReader;
use crate::domain::factory::WorkflowTemplate;
use crate::domain::types::WorkflowId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Parses a template file.
pub fn load_template(path: &Path) -> Result<WorkflowTemplate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow template: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse workflow template: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct YamlTemplateReader {
    dir: PathBuf,
}

impl YamlTemplateReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.yaml", workflow_id))
    }
}

#[async_trait]
impl WorkflowConfigReader for YamlTemplateReader {
    async fn read(&self, workflow_id: &WorkflowId) -> Result<WorkflowTemplate> {
        let template = load_template(&self.path_for(workflow_id))?;
        if &template.id != workflow_id {
            anyhow::bail!(
                "template {} declares id {}",
                self.path_for(workflow_id).display(),
                template.id
            );
        }
        Ok(template)
    }
}
