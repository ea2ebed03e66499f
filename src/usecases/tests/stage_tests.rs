use crate::domain::errors::EngineError;
use crate::domain::events::EventEnvelope;
use crate::domain::factory::WorkNodeTemplate;
use crate::domain::run::RunStatus;
use crate::domain::types::{RepositoryId, WorkExecutionId};
use crate::domain::work::TaskStatus;
use crate::reliability::event_bus::{EventHandler, EventPublisher};
use crate::testing::{self, FailingCommits, FakeAgents, Harness, ISSUE};
use crate::usecases::StageStart;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn with_repos(mut stage: WorkNodeTemplate, repos: &[&str]) -> WorkNodeTemplate {
    stage.git_refs = repos.iter().map(|r| RepositoryId::from(*r)).collect();
    stage
}

fn started(start: StageStart) -> WorkExecutionId {
    match start {
        StageStart::Started(id) => id,
        StageStart::Complete => panic!("expected a stage to start"),
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.event_type.clone());
        Ok(())
    }
}

#[tokio::test]
async fn next_stage_provisions_work_trees_directory_and_session() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![with_repos(testing::stage(1), &["backend"])]))
        .await;

    let work_id = started(h.engine.start_next_stage(run.id()).await.unwrap());

    let run = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(run.work_execution_ids(), &[work_id]);
    let tree = h.work_tree(run.id(), "backend");
    assert_eq!(h.git.worktrees(), vec![tree.clone()]);
    assert_eq!(h.agents.working_dir_of(work_id), Some(tree));
    assert!(h.engine.layout().stage_dir(run.id(), 0, work_id).is_dir());
    let attributions = h.agents.attributions();
    assert_eq!(attributions.len(), 1);
    assert_eq!(attributions[0].issue_key.as_str(), ISSUE);

    // An open stage is reused rather than provisioned twice.
    let again = started(h.engine.start_next_stage(run.id()).await.unwrap());
    assert_eq!(again, work_id);
    assert_eq!(h.agents.active_sessions(), 1);
}

#[tokio::test]
async fn stages_without_repositories_work_in_their_directory() {
    let h = Harness::build(
        Arc::new(crate::store::MemoryStore::new()),
        FakeAgents::without_attribution(),
    );
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;

    let work_id = started(h.engine.start_next_stage(run.id()).await.unwrap());

    assert_eq!(
        h.agents.working_dir_of(work_id),
        Some(h.engine.layout().stage_dir(run.id(), 0, work_id))
    );
    assert!(h.agents.attributions().is_empty());
    assert!(h.git.worktrees().is_empty());
}

#[tokio::test]
async fn next_stage_requires_a_running_run() {
    let h = Harness::new();
    let run = h
        .engine
        .create_run_from_template(
            &testing::template(vec![testing::stage(1)]),
            ISSUE.into(),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let err = h.engine.start_next_stage(run.id()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn completing_tasks_writes_reports_and_finishes_the_run() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(2)])).await;
    let work_id = started(h.engine.start_next_stage(run.id()).await.unwrap());

    let response = h.engine.send_query(work_id).await.unwrap();
    assert!(response.contains("Step 1 for ENG-1"));
    assert!(h.agents.queries()[0].contains("## Findings"));

    let first = h.engine.complete_task(work_id, &response).await.unwrap();
    assert!(first.has_next_task);
    assert!(!first.stage_completed);
    assert_eq!(first.run_status, RunStatus::Running);

    let reports = h.engine.list_reports(run.id()).await.unwrap();
    assert_eq!(reports.len(), 1);
    let (report, content) = h.engine.read_report(reports[0].id).await.unwrap();
    assert_eq!(report.task_order, 1);
    assert_eq!(content, response);

    let response = h.engine.send_query(work_id).await.unwrap();
    let second = h.engine.complete_task(work_id, &response).await.unwrap();
    assert!(!second.has_next_task);
    assert!(second.stage_completed);
    assert_eq!(second.run_status, RunStatus::Completed);

    let work = h.store.load_work(work_id).await.unwrap().unwrap();
    assert!(work.is_completed());
    assert!(work.tasks().iter().all(|t| t.status == TaskStatus::Completed));
    assert!(work.tasks().iter().all(|t| t.report_id.is_some()));
    assert_eq!(h.agents.active_sessions(), 0);
    // No work trees, so nothing to checkpoint.
    assert!(h.engine.list_checkpoints(run.id()).await.unwrap().is_empty());
}

#[tokio::test]
async fn pause_after_stage_awaits_with_a_checkpoint() {
    let h = Harness::new();
    let mut first = with_repos(testing::stage(1), &["backend"]);
    first.pause_after = true;
    let run = h
        .started_run(&testing::template(vec![first, testing::stage(1)]))
        .await;
    let work_id = started(h.engine.start_next_stage(run.id()).await.unwrap());
    h.git.set_head(&h.work_tree(run.id(), "backend"), "b1");

    let response = h.engine.send_query(work_id).await.unwrap();
    let outcome = h.engine.complete_task(work_id, &response).await.unwrap();

    assert_eq!(outcome.run_status, RunStatus::Awaiting);
    let run = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(run.current_work_index(), 1);
    let checkpoints = h.engine.list_checkpoints(run.id()).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].work_sequence(), 1);
    assert_eq!(checkpoints[0].work_execution_id(), work_id);
    assert_eq!(
        checkpoints[0]
            .get_commit_hash(&RepositoryId::from("backend"))
            .map(|c| c.as_str()),
        Some("b1")
    );
}

#[tokio::test]
async fn lost_sessions_are_not_found_and_restarted_on_next_stage() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    let work_id = started(h.engine.start_next_stage(run.id()).await.unwrap());
    h.agents.forget_sessions();

    let err = h.engine.send_query(work_id).await.unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(
        started(h.engine.start_next_stage(run.id()).await.unwrap()),
        work_id
    );
    assert_eq!(h.agents.active_sessions(), 1);
    assert!(h.engine.send_query(work_id).await.is_ok());
}

#[tokio::test]
async fn linked_reports_are_copied_into_the_next_stage() {
    let h = Harness::new();
    let mut second = testing::stage(1);
    second.linked_reports = vec![0];
    let run = h
        .started_run(&testing::template(vec![testing::stage(1), second]))
        .await;
    let first_id = started(h.engine.start_next_stage(run.id()).await.unwrap());
    let response = h.engine.send_query(first_id).await.unwrap();
    h.engine.complete_task(first_id, &response).await.unwrap();

    let second_id = started(h.engine.start_next_stage(run.id()).await.unwrap());

    let linked = h
        .engine
        .layout()
        .linked_reports_dir(run.id(), 1, second_id)
        .join("00-task-01.md");
    assert_eq!(std::fs::read_to_string(linked).unwrap(), response);
}

#[tokio::test]
async fn failed_provisioning_rolls_back_side_effects() {
    let store = Arc::new(FailingCommits::default());
    let h = Harness::build(store.clone(), FakeAgents::new());
    let run = h
        .started_run(&testing::template(vec![with_repos(testing::stage(1), &["backend"])]))
        .await;

    store.fail_next_commits(1);
    let err = h.engine.start_next_stage(run.id()).await.unwrap_err();

    assert!(matches!(err, EngineError::Storage { .. }));
    assert!(h.git.worktrees().is_empty());
    assert_eq!(h.agents.active_sessions(), 0);
    let stages = h.engine.layout().run_dir(run.id()).join("stages");
    assert_eq!(std::fs::read_dir(stages).unwrap().count(), 0);
    let run = h.engine.get_run(run.id()).await.unwrap();
    assert!(run.work_execution_ids().is_empty());

    // The retry starts cleanly.
    started(h.engine.start_next_stage(run.id()).await.unwrap());
    assert_eq!(h.git.worktrees().len(), 1);
}

#[tokio::test]
async fn events_reach_local_subscribers_and_the_outbox_in_order() {
    let h = Harness::new();
    let recorder = Arc::new(Recorder::default());
    h.bus.subscribe(recorder.clone());

    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    h.engine.start_next_stage(run.id()).await.unwrap();

    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![
            "RunCreated",
            "RunStarted",
            "WorkExecutionStarted",
            "WorkExecutionAdded"
        ]
    );
    let pending = h.store.fetch_unpublished(100).await.unwrap();
    assert_eq!(pending.len(), 4);
    assert!(pending
        .iter()
        .all(|m| m.correlation_id.as_deref() == Some(run.id().to_string().as_str())));
}
