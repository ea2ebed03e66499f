use crate::domain::errors::EngineError;
use crate::domain::factory::WorkNodeTemplate;
use crate::domain::run::RunStatus;
use crate::domain::types::{RepositoryId, WorkflowId};
use crate::domain::work::TaskStatus;
use crate::testing::{self, Harness, ISSUE};
use crate::usecases::StageStart;
use std::collections::BTreeMap;

fn with_backend(mut stage: WorkNodeTemplate) -> WorkNodeTemplate {
    stage.git_refs = vec![RepositoryId::from("backend")];
    stage
}

#[tokio::test]
async fn create_run_reads_template_and_persists_initialized_run() {
    let h = Harness::new();
    h.templates.insert(testing::template(vec![testing::stage(1)]));

    let mut seeds = BTreeMap::new();
    seeds.insert("team".to_string(), "payments".to_string());
    let run = h
        .engine
        .create_run(&WorkflowId::from("feature"), ISSUE.into(), seeds)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Initialized);
    assert_eq!(run.version(), 1);
    assert_eq!(run.work_node_configs()[0].tasks()[0].query(), "Step 1 for ENG-1");

    let started = h.engine.begin_run(run.id()).await.unwrap();
    assert_eq!(started.status(), RunStatus::Running);
    assert_eq!(started.version(), 2);
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let h = Harness::new();
    let err = h
        .engine
        .start_run(&WorkflowId::from("missing"), ISSUE.into(), BTreeMap::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h.engine.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn pause_and_resume_follow_the_state_machine() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;

    let paused = h.engine.pause_run(run.id()).await.unwrap();
    assert_eq!(paused.status(), RunStatus::Paused);

    let err = h.engine.pause_run(run.id()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert_eq!(h.engine.get_run(run.id()).await.unwrap(), paused);

    let resumed = h.engine.resume_run(run.id(), None).await.unwrap();
    assert_eq!(resumed.status(), RunStatus::Running);

    let err = h.engine.resume_run(run.id(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn cancel_run_cancels_the_current_stage_and_its_session() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(2)])).await;
    let StageStart::Started(work_id) = h.engine.start_next_stage(run.id()).await.unwrap() else {
        panic!("expected a stage");
    };
    assert_eq!(h.agents.active_sessions(), 1);

    let cancelled = h.engine.cancel_run(run.id(), "superseded").await.unwrap();

    assert_eq!(cancelled.status(), RunStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason(), Some("superseded"));
    assert_eq!(cancelled.cancelled_at_work_index(), Some(0));
    let work = h.store.load_work(work_id).await.unwrap().unwrap();
    assert!(work.is_cancelled());
    assert!(work.tasks().iter().all(|t| t.status == TaskStatus::Cancelled));
    assert_eq!(h.agents.active_sessions(), 0);

    let err = h.engine.cancel_run(run.id(), "again").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn delete_run_requires_a_terminal_run_and_cascades() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![with_backend(testing::stage(2))]))
        .await;
    h.engine.start_next_stage(run.id()).await.unwrap();
    assert_eq!(h.git.worktrees().len(), 1);

    let err = h.engine.delete_run(run.id()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    h.engine.cancel_run(run.id(), "abandoned").await.unwrap();
    h.engine.delete_run(run.id()).await.unwrap();

    assert!(h.engine.get_run(run.id()).await.unwrap_err().is_not_found());
    assert!(h.git.worktrees().is_empty());
    assert!(h.store.list_works(run.id()).await.unwrap().is_empty());
    assert!(h.store.list_work_trees(run.id()).await.unwrap().is_empty());
    assert!(!h.engine.layout().run_dir(run.id()).exists());
}

#[tokio::test]
async fn only_unexecuted_stages_can_be_edited() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![testing::stage(1), testing::stage(1)]))
        .await;
    h.engine.start_next_stage(run.id()).await.unwrap();

    let first = run.work_node_config(0).unwrap().with_model("opus");
    let err = h
        .engine
        .edit_work_node_config(run.id(), first)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    let second = run
        .work_node_config(1)
        .unwrap()
        .with_model("opus")
        .with_pause_after(true);
    let edited = h.engine.edit_work_node_config(run.id(), second).await.unwrap();
    let config = edited.work_node_config(1).unwrap();
    assert_eq!(config.model(), "opus");
    assert!(config.pause_after());
}

#[tokio::test]
async fn completed_runs_push_their_branches() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![with_backend(testing::stage(1))]))
        .await;

    let err = h.engine.push_completed_branches(run.id()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    h.driver().drive(run.id()).await;
    let pushed = h.engine.push_completed_branches(run.id()).await.unwrap();

    assert_eq!(pushed, vec![RepositoryId::from("backend")]);
    assert_eq!(h.git.pushed(), vec![format!("run/{}", run.id())]);
}
