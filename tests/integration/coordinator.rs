//! End-to-end coordinator tests.
//!
//! Each test runs a plan with real `sh` workers. Workers record what they
//! did in a scratch directory so the tests can check ordering, retries and
//! operator intervention from the outside.

use std::fs::File;
use std::time::Duration;

use fs2::FileExt;

use tokio_util::sync::CancellationToken;

use baton::config::Config;
use baton::core::{PhaseStatus, PlanStatus, TaskStatus};
use baton::orchestration::{
    send_command, ControlCommand, Coordinator, EventBus, EventPayload, EventType, IpcServer,
    OrchestratorContext, RunState,
};
use baton::state::{StatusStore, TransitionMeta};

use crate::fixtures::{
    fast_health, run_state, task_became, tool_started, EventLog, TestEnv, CHAIN_PLAN,
    DIAMOND_PLAN, SINGLE_PLAN, TWO_PHASE_PLAN,
};

const WAIT: Duration = Duration::from_secs(10);

fn coordinator(env: &TestEnv, text: &str, worker: &str) -> (Coordinator, EventLog) {
    coordinator_with(env, text, env.config(worker))
}

fn coordinator_with(env: &TestEnv, text: &str, config: Config) -> (Coordinator, EventLog) {
    assert_eq!(config.state_dir, env.state_dir);
    let ctx = OrchestratorContext::from_text(text, config).unwrap();
    let bus = EventBus::new();
    let events = EventLog::attach(&bus);
    (Coordinator::new(ctx, bus).unwrap(), events)
}

/// Appends `$1` to `ran.txt` and succeeds.
fn recording_worker(env: &TestEnv) -> String {
    env.worker(
        "record",
        &format!("echo \"$1\" >> {}", env.scratch_file("ran.txt").display()),
    )
}

/// Blocks on the first attempt of each task, succeeds afterwards.
fn hang_once_worker(env: &TestEnv) -> String {
    let marker = env.scratch.display();
    env.worker(
        "hang-once",
        &format!(
            "if [ ! -f {marker}/$1.ran ]; then\n  touch {marker}/$1.ran\n  exec sleep 30\nfi\nexit 0",
            marker = marker
        ),
    )
}

/// Blocks whenever it runs task 1.1, succeeds for everything else.
fn hang_on_first_worker(env: &TestEnv) -> String {
    env.worker("hang-first", "if [ \"$1\" = 1.1 ]; then\n  exec sleep 30\nfi\nexit 0")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plan_runs_to_completion_in_dependency_order() {
    let env = TestEnv::new();
    let (mut coordinator, mut events) =
        coordinator(&env, DIAMOND_PLAN, &recording_worker(&env));

    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.batches, 4);

    let ran = env.lines("ran.txt");
    let pos = |id: &str| ran.iter().position(|r| r == id).unwrap();
    assert_eq!(ran.len(), 5);
    assert!(pos("1.1") < pos("1.2") && pos("1.1") < pos("1.3"));
    assert!(pos("1.2") < pos("1.4") && pos("1.3") < pos("1.4"));
    assert_eq!(pos("2.1"), 4);

    // The store on disk agrees with the coordinator.
    let on_disk = StatusStore::new(coordinator.context().config.state_path())
        .read()
        .unwrap();
    assert_eq!(on_disk.plan.status, PlanStatus::Completed);
    assert_eq!(on_disk.counts(), coordinator.state().counts());

    assert_eq!(events.count(|p| p.event_type() == EventType::ToolStarted), 5);
    assert_eq!(
        events.count(|p| matches!(p, EventPayload::ToolCompleted { success: true, .. })),
        5
    );
    assert!(events.any(|p| matches!(
        p,
        EventPayload::PhaseChanged { phase_id, status: PhaseStatus::Completed }
            if phase_id == "2"
    )));
    assert!(events.any(run_state(RunState::Finished)));
    let instance = coordinator.instance_id().to_string();
    assert!(events.events.iter().all(|e| e.instance_id == instance));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_task_exhausts_retries() {
    let env = TestEnv::new();
    let worker = env.worker("fail", "echo \"cannot build $1\" >&2\nexit 3");
    let (coordinator, mut events) = coordinator(&env, SINGLE_PLAN, &worker);
    let mut coordinator = coordinator.with_health(fast_health(2, Duration::from_secs(60)));

    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Failed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.batches, 2);

    let task = coordinator.state().task(&"1.1".into()).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    let error = task.last_error.as_deref().unwrap();
    assert!(error.contains("cannot build 1.1"), "lastError was {:?}", error);

    assert_eq!(
        events.count(|p| matches!(
            p,
            EventPayload::ToolCompleted { exit_code: Some(3), success: false, .. }
        )),
        2
    );
    // One automatic re-queue between the two attempts.
    assert_eq!(events.count(task_became("1.1", TaskStatus::Pending)), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flaky_task_recovers_on_retry() {
    let env = TestEnv::new();
    let marker = env.scratch.display();
    let worker = env.worker(
        "flaky",
        &format!(
            "if [ ! -f {marker}/$1.seen ]; then\n  touch {marker}/$1.seen\n  exit 1\nfi\nexit 0",
            marker = marker
        ),
    );
    let (coordinator, _events) = coordinator(&env, CHAIN_PLAN, &worker);
    let mut coordinator = coordinator.with_health(fast_health(3, Duration::from_secs(60)));

    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    for id in ["1.1", "1.2"] {
        assert_eq!(coordinator.state().task(&id.into()).unwrap().retry_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permanent_failure_blocks_then_operator_retry_unblocks() {
    let env = TestEnv::new();
    let gate = env.scratch_file("fixed");
    let worker = env.worker(
        "gated",
        &format!(
            "if [ \"$1\" = 1.1 ] && [ ! -f {} ]; then\n  exit 1\nfi\nexit 0",
            gate.display()
        ),
    );

    let (coordinator, mut events) = coordinator(&env, CHAIN_PLAN, &worker);
    let mut coordinator = coordinator.with_health(fast_health(0, Duration::from_secs(60)));
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Blocked);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.pending, 1);
    assert!(events.any(run_state(RunState::Blocked)));
    let config = coordinator.context().config.clone();
    drop(coordinator);

    // The operator fixes the cause and re-queues the task with no orchestrator running.
    std::fs::write(&gate, "").unwrap();
    StatusStore::new(config.state_path())
        .apply_transition(&"1.1".into(), TaskStatus::Pending, TransitionMeta::default())
        .unwrap();

    let (mut coordinator, _events) = coordinator_with(&env, CHAIN_PLAN, config);
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_task_is_reported_and_retried_by_operator() {
    let env = TestEnv::new();
    let (coordinator, mut events) = coordinator(&env, SINGLE_PLAN, &hang_once_worker(&env));
    let mut coordinator = coordinator.with_health(fast_health(3, Duration::from_millis(150)));
    let control = coordinator.control_handle();

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(
            events
                .wait_for(
                    |p| matches!(
                        p,
                        EventPayload::OrchestratorState { state: RunState::Stuck, task_id: Some(id), .. }
                            if id.as_str() == "1.1"
                    ),
                    WAIT,
                )
                .await,
            "no stuck report"
        );
        // Reported, not killed.
        assert!(!events.any(|p| matches!(p, EventPayload::ToolCompleted { .. })));

        let response = control
            .send(ControlCommand::RetryTask {
                task_id: "1.1".into(),
            })
            .await
            .unwrap();
        assert!(response.ok, "{:?}", response.error);
    });
    let summary = summary.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.batches, 2);
    let task = coordinator.state().task(&"1.1".into()).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("retried by operator"));
    assert_eq!(events.count(task_became("1.1", TaskStatus::Failed)), 1);
    assert_eq!(events.count(tool_started("1.1")), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_skip_running_task() {
    let env = TestEnv::new();
    let (mut coordinator, mut events) =
        coordinator(&env, CHAIN_PLAN, &hang_on_first_worker(&env));
    let control = coordinator.control_handle();

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(events.wait_for(tool_started("1.1"), WAIT).await);
        let response = control
            .send(ControlCommand::SkipTask {
                task_id: "1.1".into(),
            })
            .await
            .unwrap();
        assert!(response.ok, "{:?}", response.error);

        // Skipping again is rejected by the transition check.
        let again = control
            .send(ControlCommand::SkipTask {
                task_id: "1.1".into(),
            })
            .await
            .unwrap();
        assert!(!again.ok);
        assert!(again.error.unwrap().contains("Invalid transition"));
    });
    let summary = summary.unwrap();

    // 1.2 still runs because skipped dependencies count as satisfied.
    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(
        coordinator.state().status_of(&"1.1".into()),
        Some(TaskStatus::Skipped)
    );
    assert_eq!(events.count(tool_started("1.1")), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_holds_next_batch_until_resume() {
    let env = TestEnv::new();
    let worker = env.worker(
        "slow",
        &format!(
            "sleep 0.3\necho \"$1\" >> {}",
            env.scratch_file("ran.txt").display()
        ),
    );
    let (mut coordinator, mut events) = coordinator(&env, TWO_PHASE_PLAN, &worker);
    let control = coordinator.control_handle();

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(events.wait_for(tool_started("1.1"), WAIT).await);
        assert!(control.send(ControlCommand::Pause).await.unwrap().ok);
        let twice = control.send(ControlCommand::Pause).await.unwrap();
        assert!(!twice.ok);

        // In-flight work finishes; nothing new starts.
        assert!(events.wait_for(task_became("1.2", TaskStatus::Completed), WAIT).await);
        assert!(events.wait_for(run_state(RunState::Paused), WAIT).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!events.any(tool_started("2.1")));
        assert_eq!(env.lines("ran.txt").len(), 2);

        assert!(control.send(ControlCommand::Resume).await.unwrap().ok);
        // 2.1 is still running, so the coordinator answers.
        assert!(!control.send(ControlCommand::Resume).await.unwrap().ok);
    });
    let summary = summary.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.completed, 3);
    assert!(events.any(run_state(RunState::Resumed)));
    assert!(events.any(|p| matches!(
        p,
        EventPayload::StatusUpdated { plan_status: PlanStatus::Paused, .. }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_over_socket_leaves_plan_resumable() {
    let env = TestEnv::new();
    let worker = env.worker(
        "slow",
        &format!("sleep 1\necho \"$1\" >> {}", env.scratch_file("ran.txt").display()),
    );
    let mut config = env.config(&worker);
    config.execution.shutdown_grace_secs = 0;
    let socket = config.socket_path();
    let (coordinator, mut events) = coordinator_with(&env, CHAIN_PLAN, config.clone());
    let mut coordinator = coordinator.with_health(fast_health(1, Duration::from_secs(60)));
    let server = IpcServer::bind(
        &socket,
        coordinator.control_handle().sender(),
        CancellationToken::new(),
    )
    .unwrap();

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(events.wait_for(tool_started("1.1"), WAIT).await);
        let response = send_command(&socket, &ControlCommand::Shutdown).await.unwrap();
        assert!(response.ok, "{:?}", response.error);
    });
    let summary = summary.unwrap();
    server.shutdown().await;

    assert_eq!(summary.plan_status, PlanStatus::Paused);
    assert_eq!(summary.failed, 0);
    let task = coordinator.state().task(&"1.1".into()).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.retry_count, 0);
    assert!(task.released_at.is_some());
    assert!(events.any(run_state(RunState::ShuttingDown)));
    assert!(!socket.exists());
    drop(coordinator);

    // The worker was left to finish on its own.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(env.lines("ran.txt"), vec!["1.1"]);

    // The next run requeues 1.1 without charging the attempt.
    let (coordinator, mut events) = coordinator_with(&env, CHAIN_PLAN, config);
    let mut coordinator = coordinator.with_health(fast_health(1, Duration::from_secs(60)));
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(coordinator.state().task(&"1.1".into()).unwrap().retry_count, 0);
    assert!(events.any(task_became("1.1", TaskStatus::Pending)));
    assert_eq!(env.lines("ran.txt"), vec!["1.1", "1.1", "1.2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_contention_mid_batch_is_retried() {
    let env = TestEnv::new();
    let worker = env.worker("brief", "sleep 0.2");
    let config = env.config(&worker);
    let store = StatusStore::new(config.state_path());
    let (mut coordinator, mut events) = coordinator_with(&env, SINGLE_PLAN, config);

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(events.wait_for(tool_started("1.1"), WAIT).await);
        let holder = File::create(store.lock_path()).unwrap();
        holder.lock_exclusive().unwrap();
        // The worker ends while the lock is held; its result waits.
        assert!(events.wait_for(run_state(RunState::StoreUnavailable), WAIT).await);
        FileExt::unlock(&holder).unwrap();
    });
    let summary = summary.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.completed, 1);
    assert_eq!(
        store.read().unwrap().status_of(&"1.1".into()),
        Some(TaskStatus::Completed)
    );
    assert_eq!(events.count(tool_started("1.1")), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_errors_for_unknown_task() {
    let env = TestEnv::new();
    let (mut coordinator, mut events) =
        coordinator(&env, CHAIN_PLAN, &hang_on_first_worker(&env));
    let control = coordinator.control_handle();

    let (summary, _) = tokio::join!(coordinator.run(), async {
        assert!(events.wait_for(tool_started("1.1"), WAIT).await);
        let response = control
            .send(ControlCommand::RetryTask {
                task_id: "9.9".into(),
            })
            .await
            .unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("9.9"));

        // A pending task has nothing to retry.
        let response = control
            .send(ControlCommand::RetryTask {
                task_id: "1.2".into(),
            })
            .await
            .unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("pending -> pending"));

        let response = control
            .send(ControlCommand::SkipTask {
                task_id: "1.1".into(),
            })
            .await
            .unwrap();
        assert!(response.ok);
    });
    let summary = summary.unwrap();
    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_worker_binary_counts_as_failure() {
    let env = TestEnv::new();
    let (coordinator, mut events) =
        coordinator(&env, SINGLE_PLAN, "baton-test-no-such-worker {task_id}");
    let mut coordinator = coordinator.with_health(fast_health(1, Duration::from_secs(60)));

    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Failed);
    let task = coordinator.state().task(&"1.1".into()).unwrap();
    assert_eq!(task.retry_count, 1);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("failed to start worker"));
    assert_eq!(events.count(tool_started("1.1")), 0);
}
