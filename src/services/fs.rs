//! `FileSystem` over the local disk.

use super::{FileStat, FileSystem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn create_directory(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))
    }

    async fn delete_directory(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn create_file(&self, path: &Path, content: &str) -> Result<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileStat>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(FileStat {
                is_dir: meta.is_dir(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        }
    }

    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to list {}", path.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        ensure_parent(to).await?;
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        Ok(())
    }

    async fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        ensure_parent(to).await?;
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_round_trip_and_listing() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let report = dir.path().join("reports/a.md");

        fs.create_file(&report, "# A").await.unwrap();
        assert_eq!(fs.read_file(&report).await.unwrap(), "# A");
        assert_eq!(
            fs.stat(&report).await.unwrap(),
            Some(FileStat { is_dir: false, len: 3 })
        );

        let copy = dir.path().join("reports/b.md");
        fs.copy(&report, &copy).await.unwrap();
        let moved = dir.path().join("archive/c.md");
        fs.move_path(&copy, &moved).await.unwrap();
        assert_eq!(
            fs.list(&dir.path().join("reports")).await.unwrap(),
            vec![report.clone()]
        );
        assert!(fs.stat(&moved).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleting_missing_paths_is_not_an_error() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        fs.delete_file(&dir.path().join("nope.md")).await.unwrap();
        fs.delete_directory(&dir.path().join("nope")).await.unwrap();
        assert_eq!(fs.stat(&dir.path().join("nope")).await.unwrap(), None);
    }
}
