//! Status store durability tests.
//!
//! These tests verify that the status file survives crashes, corruption and
//! concurrent writers, and that a restarted orchestrator picks up where the
//! previous one stopped.

use std::fs;
use std::sync::Arc;
use std::thread;

use baton::config::Config;
use baton::core::{PlanStatus, TaskStatus};
use baton::orchestration::{Coordinator, EventBus, OrchestratorContext, RunState};
use baton::state::{StatusStore, TransitionMeta};
use baton::Error;

use crate::fixtures::{run_state, EventLog, TestEnv, CHAIN_PLAN, SINGLE_PLAN, TWO_PHASE_PLAN};

fn context(env: &TestEnv, text: &str) -> OrchestratorContext {
    let config = Config {
        state_dir: env.state_dir.clone(),
        ..Config::default()
    };
    OrchestratorContext::from_text(text, config).unwrap()
}

#[test]
fn test_reopen_marks_interrupted_tasks_failed() {
    let env = TestEnv::new();
    let ctx = context(&env, CHAIN_PLAN);

    let first = ctx.open_store().unwrap();
    assert!(!first.resumed);
    first
        .store
        .apply_transition(&"1.1".into(), TaskStatus::InProgress, TransitionMeta::default())
        .unwrap();
    // The process dies here; nothing else is written.

    let second = ctx.open_store().unwrap();
    assert!(second.resumed);
    assert_eq!(second.recovered_from, None);
    assert_eq!(second.interrupted, vec!["1.1".into()]);
    let task = second.state.task(&"1.1".into()).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("interrupted"));

    // The recovery itself is durable.
    let third = ctx.open_store().unwrap();
    assert!(third.interrupted.is_empty());
    assert_eq!(third.state.status_of(&"1.1".into()), Some(TaskStatus::Failed));
}

#[test]
fn test_truncated_status_file_restores_newest_backup() {
    let env = TestEnv::new();
    let ctx = context(&env, TWO_PHASE_PLAN);
    let store = ctx.open_store().unwrap().store;
    store
        .apply_transition(&"1.1".into(), TaskStatus::InProgress, TransitionMeta::default())
        .unwrap();
    store
        .apply_transition(&"1.1".into(), TaskStatus::Completed, TransitionMeta::default())
        .unwrap();
    assert!(store.backup_path(1).exists());

    // A torn write leaves half a document behind.
    let full = fs::read_to_string(store.path()).unwrap();
    fs::write(store.path(), &full[..full.len() / 2]).unwrap();

    let reopened = ctx.open_store().unwrap();
    assert_eq!(reopened.recovered_from, Some(1));
    // Backup 1 holds the state before the last write.
    assert_eq!(
        reopened.state.status_of(&"1.1".into()),
        Some(TaskStatus::Failed)
    );
    assert_eq!(reopened.interrupted, vec!["1.1".into()]);

    // The canonical file is readable again.
    let state = StatusStore::new(store.path()).read().unwrap();
    assert_eq!(state.plan.id, "two-phase");
}

#[test]
fn test_all_copies_corrupt_is_an_error() {
    let env = TestEnv::new();
    let ctx = context(&env, SINGLE_PLAN);
    let store = ctx.open_store().unwrap().store;
    store.set_plan_status(PlanStatus::Running).unwrap();

    fs::write(store.path(), "{ not json").unwrap();
    for n in 1..=5 {
        if store.backup_path(n).exists() {
            fs::write(store.backup_path(n), "garbage").unwrap();
        }
    }
    let err = ctx.open_store().unwrap_err();
    assert!(matches!(err, Error::StateCorrupted(_)), "got {:?}", err);
}

#[test]
fn test_different_plan_is_rejected() {
    let env = TestEnv::new();
    context(&env, CHAIN_PLAN).open_store().unwrap();

    let err = context(&env, TWO_PHASE_PLAN).open_store().unwrap_err();
    assert!(matches!(err, Error::PlanMismatch(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_backups_are_bounded() {
    let env = TestEnv::new();
    let ctx = context(&env, SINGLE_PLAN);
    let store = ctx.open_store().unwrap().store;
    for _ in 0..10 {
        store.set_plan_status(PlanStatus::Running).unwrap();
    }
    assert!(store.backup_path(5).exists());
    assert!(!store.backup_path(6).exists());
}

#[test]
fn test_concurrent_writers_lose_no_updates() {
    let env = TestEnv::new();
    let text = "\
# Plan: Wide
## Phase 1
- 1.1 a
- 1.2 b
- 1.3 c
- 1.4 d
- 1.5 e
- 1.6 f
";
    let ctx = context(&env, text);
    let store = Arc::new(ctx.open_store().unwrap().store);

    let handles: Vec<_> = (1..=6)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let id = format!("1.{}", i).as_str().into();
                store
                    .apply_transition(&id, TaskStatus::InProgress, TransitionMeta::default())
                    .unwrap();
                store
                    .apply_transition(&id, TaskStatus::Completed, TransitionMeta::default())
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let state = store.read().unwrap();
    assert_eq!(state.counts().completed, 6);
    assert_eq!(state.plan.status, PlanStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restarted_orchestrator_reruns_interrupted_task() {
    let env = TestEnv::new();
    let worker = env.worker(
        "record",
        &format!("echo \"$1\" >> {}", env.scratch_file("ran.txt").display()),
    );
    let config = env.config(&worker);

    // A previous run died while 1.1 was in flight.
    let ctx = OrchestratorContext::from_text(CHAIN_PLAN, config.clone()).unwrap();
    ctx.open_store()
        .unwrap()
        .store
        .apply_transition(&"1.1".into(), TaskStatus::InProgress, TransitionMeta::default())
        .unwrap();

    let ctx = OrchestratorContext::from_text(CHAIN_PLAN, config).unwrap();
    let bus = EventBus::new();
    let mut events = EventLog::attach(&bus);
    let mut coordinator = Coordinator::new(ctx, bus).unwrap();
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert_eq!(summary.completed, 2);
    assert_eq!(env.lines("ran.txt"), vec!["1.1", "1.2"]);
    assert_eq!(coordinator.state().task(&"1.1".into()).unwrap().retry_count, 1);
    assert!(events.any(run_state(RunState::Started)));
    assert!(!events.any(run_state(RunState::Recovered)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_from_backup_reports_recovery() {
    let env = TestEnv::new();
    let worker = env.worker("ok", "exit 0");
    let config = env.config(&worker);

    let ctx = OrchestratorContext::from_text(SINGLE_PLAN, config.clone()).unwrap();
    let store = ctx.open_store().unwrap().store;
    store.set_plan_status(PlanStatus::Running).unwrap();
    fs::write(store.path(), "").unwrap();

    let ctx = OrchestratorContext::from_text(SINGLE_PLAN, config).unwrap();
    let bus = EventBus::new();
    let mut events = EventLog::attach(&bus);
    let summary = Coordinator::new(ctx, bus).unwrap().run().await.unwrap();

    assert_eq!(summary.plan_status, PlanStatus::Completed);
    assert!(events.any(run_state(RunState::Recovered)));
}
