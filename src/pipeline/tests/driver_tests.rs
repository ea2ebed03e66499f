use super::*;
use crate::domain::work::TaskStatus;
use crate::testing::{self, Harness};
use crate::usecases::StageStart;

fn finished(status: RunStatus) -> DriveOutcome {
    DriveOutcome::Finished { status }
}

#[tokio::test]
async fn two_sequential_stages_complete_the_run() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![testing::stage(1), testing::stage(1)]))
        .await;

    let outcome = h.driver().drive(run.id()).await;

    assert_eq!(outcome, finished(RunStatus::Completed));
    let run = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(run.work_execution_ids().len(), 2);
    assert_eq!(h.agents.queries().len(), 2);
}

#[tokio::test]
async fn pause_after_stage_stops_the_loop_awaiting() {
    let h = Harness::new();
    let mut first = testing::stage(1);
    first.pause_after = true;
    let run = h
        .started_run(&testing::template(vec![first, testing::stage(1)]))
        .await;

    let outcome = h.driver().drive(run.id()).await;

    assert_eq!(outcome, finished(RunStatus::Awaiting));
    let awaiting = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(awaiting.work_execution_ids().len(), 1);
    assert_eq!(h.agents.queries().len(), 1);

    h.engine.resume_run(run.id(), None).await.unwrap();
    assert_eq!(
        h.driver().drive(run.id()).await,
        finished(RunStatus::Completed)
    );
    let run = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(run.work_execution_ids().len(), 2);
}

#[tokio::test]
async fn query_succeeding_on_third_attempt_needs_no_containment() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    h.agents.fail_next_queries(2);

    let outcome = h.driver().drive(run.id()).await;

    assert_eq!(outcome, finished(RunStatus::Completed));
    assert_eq!(h.agents.queries().len(), 3);
    let works = h.store.list_works(run.id()).await.unwrap();
    assert!(works[0]
        .tasks()
        .iter()
        .all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn exhausted_retries_skip_the_task_and_pause_the_run() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(2)])).await;
    h.agents.fail_next_queries(3);

    let outcome = h.driver().drive(run.id()).await;

    assert_eq!(outcome, finished(RunStatus::Paused));
    assert_eq!(h.agents.queries().len(), 3);
    let work = h.store.list_works(run.id()).await.unwrap().remove(0);
    assert_eq!(work.current_task_index(), 1);
    assert_eq!(work.tasks()[0].status, TaskStatus::Failed);
    assert_eq!(work.tasks()[1].status, TaskStatus::Pending);
    assert!(!work.is_terminal());

    h.engine.resume_run(run.id(), None).await.unwrap();
    assert_eq!(
        h.driver().drive(run.id()).await,
        finished(RunStatus::Completed)
    );
    let work = h.store.load_work(work.id()).await.unwrap().unwrap();
    assert_eq!(work.tasks()[1].status, TaskStatus::Completed);
}

#[tokio::test]
async fn stage_finished_by_containment_is_finalized_on_resume() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![testing::stage(1), testing::stage(1)]))
        .await;
    h.agents.fail_next_queries(3);

    assert_eq!(h.driver().drive(run.id()).await, finished(RunStatus::Paused));
    let paused = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(paused.current_work_index(), 0);
    let work = h.store.list_works(run.id()).await.unwrap().remove(0);
    assert!(work.is_completed());

    h.engine.resume_run(run.id(), None).await.unwrap();
    assert_eq!(
        h.driver().drive(run.id()).await,
        finished(RunStatus::Completed)
    );
    let run = h.engine.get_run(run.id()).await.unwrap();
    assert_eq!(run.work_execution_ids().len(), 2);
    assert_eq!(run.work_execution_ids()[0], work.id());
}

#[tokio::test]
async fn missing_sessions_are_not_retried() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    let StageStart::Started(work_id) = h.engine.start_next_stage(run.id()).await.unwrap() else {
        panic!("expected a stage");
    };
    h.agents.forget_sessions();
    let driver = PipelineDriver::new(
        h.engine.clone(),
        QueryRetryPolicy {
            max_retries: 2,
            delay: Duration::from_secs(3600),
        },
    );

    let result =
        tokio::time::timeout(Duration::from_secs(5), driver.send_with_retry(work_id)).await;

    let err = result.expect("not-found errors must not wait for a retry").unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn concurrent_drive_of_the_same_run_is_refused() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    let driver = h.driver();
    let lease = driver.guard().try_acquire(run.id()).unwrap();

    assert_eq!(driver.drive(run.id()).await, DriveOutcome::AlreadyActive);
    assert!(h.agents.queries().is_empty());
    assert_eq!(
        h.engine.get_run(run.id()).await.unwrap().status(),
        RunStatus::Running
    );

    drop(lease);
    assert_eq!(
        driver.drive(run.id()).await,
        finished(RunStatus::Completed)
    );
}

#[tokio::test]
async fn separate_drivers_share_the_run_lease() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    let (first, second) = (h.driver(), h.driver());

    let (a, b) = tokio::join!(first.drive(run.id()), second.drive(run.id()));

    assert_eq!(a, finished(RunStatus::Completed));
    assert_eq!(b, DriveOutcome::AlreadyActive);
    assert_eq!(h.agents.queries().len(), 1);
    assert!(!h.engine.run_guard().is_active(run.id()));
}

#[tokio::test]
async fn unknown_runs_are_reported_missing() {
    let h = Harness::new();
    assert_eq!(
        h.driver().drive(RunId::new()).await,
        DriveOutcome::RunMissing
    );
}

#[tokio::test]
async fn spawned_driver_runs_in_the_background() {
    let h = Harness::new();
    let run = h
        .started_run(&testing::template(vec![testing::stage(2), testing::stage(1)]))
        .await;

    let outcome = h.driver().spawn(run.id()).await.unwrap();

    assert_eq!(outcome, finished(RunStatus::Completed));
    assert_eq!(h.agents.queries().len(), 3);
    assert_eq!(h.engine.lineage(run.id()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cancelled_runs_are_left_alone() {
    let h = Harness::new();
    let run = h.started_run(&testing::template(vec![testing::stage(1)])).await;
    h.engine.cancel_run(run.id(), "not needed").await.unwrap();

    assert_eq!(
        h.driver().drive(run.id()).await,
        finished(RunStatus::Cancelled)
    );
    assert!(h.agents.queries().is_empty());
}
