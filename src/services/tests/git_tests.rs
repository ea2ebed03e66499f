use super::*;
use tempfile::tempdir;

/// Initializes a repo with one commit.
async fn init_repo(dir: &Path) -> Result<CommitHash> {
    git(dir, &["init", "-q", "-b", "main"]).await?;
    tokio::fs::write(dir.join("README.md"), "hello\n").await?;
    git(dir, &["add", "."]).await?;
    git(
        dir,
        &[
            "-c",
            "user.name=Engine Test",
            "-c",
            "user.email=engine@example.com",
            "commit",
            "-q",
            "-m",
            "init",
        ],
    )
    .await?;
    GitCli::new().current_commit(dir).await
}

#[tokio::test]
async fn current_commit_fails_outside_a_repository() {
    let dir = tempdir().unwrap();
    assert!(GitCli::new().current_commit(dir.path()).await.is_err());
}

#[tokio::test]
async fn worktree_lifecycle() {
    let repo = tempdir().unwrap();
    let head = init_repo(repo.path())
        .await
        .expect("git must be installed to run this test");
    let trees = tempdir().unwrap();
    let worktree = trees.path().join("backend");
    let cli = GitCli::new();

    cli.create_worktree(repo.path(), &worktree, "run/test", "main")
        .await
        .unwrap();
    assert_eq!(cli.current_commit(&worktree).await.unwrap(), head);
    assert!(cli.branch_exists(repo.path(), "run/test").await.unwrap());
    assert!(!cli.branch_exists(repo.path(), "run/other").await.unwrap());

    tokio::fs::write(worktree.join("change.txt"), "x").await.unwrap();
    git(&worktree, &["add", "."]).await.unwrap();
    git(
        &worktree,
        &[
            "-c",
            "user.name=Engine Test",
            "-c",
            "user.email=engine@example.com",
            "commit",
            "-q",
            "-m",
            "change",
        ],
    )
    .await
    .unwrap();
    assert_ne!(cli.current_commit(&worktree).await.unwrap(), head);

    cli.reset_hard(&worktree, &head).await.unwrap();
    assert_eq!(cli.current_commit(&worktree).await.unwrap(), head);

    cli.delete_worktree(repo.path(), &worktree).await.unwrap();
    cli.delete_branch(repo.path(), "run/test").await.unwrap();
    assert!(!cli.branch_exists(repo.path(), "run/test").await.unwrap());
}
