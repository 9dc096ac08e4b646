//! Multi-cycle scheduling tests.
//!
//! These tests play the coordinator's part by hand: take a batch, mark its
//! tasks finished, recompute aggregates, and ask again.

use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeSet;

use baton::config::Config;
use baton::core::{
    parse, resolve, ConflictDetector, ConflictRelation, DependencyGraph, HeuristicConflictStrategy,
    Phase, Plan, Task, TaskId, TaskStatus,
};
use baton::orchestration::{OrchestratorContext, Scheduler};
use baton::state::PlanState;

use crate::fixtures::{ids, DIAMOND_PLAN};

struct Sim {
    graph: DependencyGraph,
    conflicts: ConflictRelation,
    state: PlanState,
    scheduler: Scheduler,
}

impl Sim {
    fn from_text(text: &str, max_batch: usize) -> Self {
        let ctx = OrchestratorContext::from_text(text, Config::default()).unwrap();
        let state = PlanState::from_plan(&ctx.plan, &ctx.graph, 1.0);
        Self {
            graph: ctx.graph,
            conflicts: ctx.conflicts,
            state,
            scheduler: Scheduler::new(max_batch),
        }
    }

    fn from_plan(plan: &Plan, max_batch: usize) -> Self {
        let detector = ConflictDetector::new(Box::new(HeuristicConflictStrategy::default()));
        let graph = resolve(plan).unwrap();
        let conflicts = detector.detect(&plan.tasks);
        let state = PlanState::from_plan(plan, &graph, 1.0);
        Self {
            graph,
            conflicts,
            state,
            scheduler: Scheduler::new(max_batch),
        }
    }

    fn next(&self) -> Option<Vec<TaskId>> {
        self.scheduler
            .next_batch(&self.graph, &self.conflicts, &self.state, Utc::now())
            .map(|b| b.task_ids)
    }

    fn finish(&mut self, batch: &[TaskId], status: TaskStatus) {
        for id in batch {
            self.state.task_mut(id).unwrap().status = status;
        }
        self.state.recompute(true);
    }

    /// Run to completion, every task succeeding. Returns the batches.
    fn drain(&mut self) -> Vec<Vec<TaskId>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next() {
            self.finish(&batch, TaskStatus::Completed);
            batches.push(batch);
            assert!(batches.len() <= self.state.tasks.len(), "scheduler made no progress");
        }
        batches
    }
}

#[test]
fn test_diamond_runs_in_dependency_waves() {
    let mut sim = Sim::from_text(DIAMOND_PLAN, 4);
    let batches = sim.drain();
    assert_eq!(
        batches,
        vec![
            ids(&["1.1"]),
            ids(&["1.2", "1.3"]),
            ids(&["1.4"]),
            ids(&["2.1"]),
        ]
    );
    assert!(sim.scheduler.is_finished(&sim.state));
}

#[test]
fn test_fan_out_respects_batch_size() {
    let text = "\
# Plan: Fan
## Phase 1
- 1.1 Create `src/root.rs`
- 1.2 Create `src/a.rs` (depends: 1.1)
- 1.3 Create `src/b.rs` (depends: 1.1)
- 1.4 Create `src/c.rs` (depends: 1.1)
- 1.5 Create `src/d.rs` (depends: 1.1)
- 1.6 Create `src/e.rs` (depends: 1.1)
- 1.7 Merge `src/all.rs` (depends: 1.2, 1.3, 1.4, 1.5, 1.6)
";
    let mut sim = Sim::from_text(text, 3);
    let batches = sim.drain();
    assert_eq!(
        batches,
        vec![
            ids(&["1.1"]),
            ids(&["1.2", "1.3", "1.4"]),
            ids(&["1.5", "1.6"]),
            ids(&["1.7"]),
        ]
    );
}

#[test]
fn test_shared_file_serializes_across_cycles() {
    let text = "\
# Plan: Shared
## Phase 1
- 1.1 Update `src/lib.rs` exports
- 1.2 Add docs to `src/lib.rs`
- 1.3 Create `src/other.rs`
- 1.4 Fix lint in `src/lib.rs`
";
    let mut sim = Sim::from_text(text, 4);
    let batches = sim.drain();
    assert_eq!(
        batches,
        vec![ids(&["1.1", "1.3"]), ids(&["1.2"]), ids(&["1.4"])]
    );
}

#[test]
fn test_directory_reference_conflicts_with_files_inside() {
    let text = "\
# Plan: Dirs
## Phase 1
- 1.1 Reorganize `src/auth/`
- 1.2 Create `src/auth/token.rs`
- 1.3 Create `src/billing.rs`
";
    let mut sim = Sim::from_text(text, 4);
    assert_eq!(sim.next().unwrap(), ids(&["1.1", "1.3"]));
    sim.finish(&ids(&["1.1", "1.3"]), TaskStatus::Completed);
    assert_eq!(sim.next().unwrap(), ids(&["1.2"]));
}

#[test]
fn test_threshold_opens_next_phase_early() {
    let text = "\
# Plan: Threshold
## Phase 1: Bulk (threshold: 0.5)
- 1.1 Create `src/a.rs`
- 1.2 Create `src/b.rs`
## Phase 2: Follow up
- 2.1 Create `src/c.rs`
";
    let mut sim = Sim::from_text(text, 1);
    assert_eq!(sim.next().unwrap(), ids(&["1.1"]));
    sim.finish(&ids(&["1.1"]), TaskStatus::Completed);

    // Half of phase 1 is done; phase 2 competes on phase order.
    let ready = sim
        .scheduler
        .ready_tasks(&sim.graph, &sim.state, Utc::now());
    assert_eq!(ready, ids(&["1.2", "2.1"]));
}

#[test]
fn test_failed_task_blocks_gated_phase() {
    let mut sim = Sim::from_text(DIAMOND_PLAN, 4);
    sim.finish(&ids(&["1.1"]), TaskStatus::Completed);
    sim.finish(&ids(&["1.2"]), TaskStatus::Failed);
    assert_eq!(sim.next().unwrap(), ids(&["1.3"]));
    sim.finish(&ids(&["1.3"]), TaskStatus::Completed);

    // 1.4 waits on a failed task; 2.1 waits on an unfinished phase.
    assert_eq!(sim.next(), None);
    assert!(sim.scheduler.is_blocked(&sim.graph, &sim.state));
    assert!(!sim.scheduler.is_finished(&sim.state));
}

#[test]
fn test_skipped_dependency_unblocks_with_skip_through() {
    let mut sim = Sim::from_text(DIAMOND_PLAN, 4);
    sim.finish(&ids(&["1.1", "1.3"]), TaskStatus::Completed);
    sim.finish(&ids(&["1.2"]), TaskStatus::Skipped);
    assert_eq!(sim.next().unwrap(), ids(&["1.4"]));

    sim.scheduler = Scheduler::new(4).with_skip_through(false);
    assert_eq!(sim.next(), None);
    assert!(sim.scheduler.is_blocked(&sim.graph, &sim.state));
}

#[test]
fn test_sequential_group_across_phases() {
    let text = "\
# Plan: Migrations
## Phase 1 (threshold: 0)
- 1.1 Write migration one [SEQUENTIAL: db]
- 1.2 Create `src/model.rs`
## Phase 2
- 2.1 Write migration two [SEQUENTIAL: db]
";
    let mut sim = Sim::from_text(text, 4);
    // Phase 2's gate is open from the start, but the group chains 2.1 after 1.1.
    assert_eq!(sim.next().unwrap(), ids(&["1.1", "1.2"]));
    sim.finish(&ids(&["1.1", "1.2"]), TaskStatus::Completed);
    assert_eq!(sim.next().unwrap(), ids(&["2.1"]));
}

#[test]
fn test_checked_tasks_are_not_rescheduled() {
    let text = "\
# Plan: Partial
## Phase 1
- [x] 1.1 Create `src/a.rs`
- [ ] 1.2 Create `src/b.rs` (depends: 1.1)
";
    let plan = parse(text).unwrap();
    let mut sim = Sim::from_plan(&plan, 4);
    assert_eq!(sim.drain(), vec![ids(&["1.2"])]);
}

const PATHS: [&str; 5] = [
    "src/lib.rs",
    "src/auth",
    "src/auth/token.rs",
    "docs/guide.md",
    "tests/it.rs",
];

/// One phase of `n` tasks; each task picks earlier tasks as dependencies
/// and a subset of `PATHS` as its file references.
fn arb_plan() -> impl Strategy<Value = Plan> {
    (1usize..14).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n),
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), PATHS.len()), n),
        )
            .prop_map(move |(dep_masks, file_masks)| {
                let mut phase = Phase::new("1", "Generated");
                let mut tasks = Vec::with_capacity(n);
                for i in 0..n {
                    let id = format!("1.{}", i + 1);
                    let mut task = Task::new(id.as_str(), "1", &format!("generated task {}", id));
                    task.depends_on = (0..i)
                        .filter(|&j| dep_masks[i][j])
                        .map(|j| TaskId::new(format!("1.{}", j + 1)))
                        .collect();
                    task.file_refs = PATHS
                        .iter()
                        .zip(&file_masks[i])
                        .filter(|(_, on)| **on)
                        .map(|(p, _)| p.to_string())
                        .collect::<BTreeSet<_>>();
                    phase.task_ids.push(task.id.clone());
                    tasks.push(task);
                }
                Plan::new("Generated", vec![phase], tasks)
            })
    })
}

proptest! {
    #[test]
    fn prop_batches_are_conflict_free_and_dependency_ordered(
        plan in arb_plan(),
        max_batch in 1usize..5,
    ) {
        let mut sim = Sim::from_plan(&plan, max_batch);
        let mut done: BTreeSet<TaskId> = BTreeSet::new();
        let mut batches = 0usize;

        while let Some(batch) = sim.next() {
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.len() <= max_batch);
            for (i, a) in batch.iter().enumerate() {
                for b in &batch[i + 1..] {
                    prop_assert!(!sim.conflicts.conflicts(a, b), "{} and {} share a batch", a, b);
                }
                for dep in sim.graph.dependencies(a) {
                    prop_assert!(done.contains(dep), "{} ran before its dependency {}", a, dep);
                }
            }
            done.extend(batch.iter().cloned());
            sim.finish(&batch, TaskStatus::Completed);
            batches += 1;
            prop_assert!(batches <= plan.tasks.len());
        }

        prop_assert_eq!(done.len(), plan.tasks.len());
        prop_assert!(sim.scheduler.is_finished(&sim.state));
    }

    #[test]
    fn prop_scheduling_is_deterministic(plan in arb_plan(), max_batch in 1usize..5) {
        let first = Sim::from_plan(&plan, max_batch).drain();
        let second = Sim::from_plan(&plan, max_batch).drain();
        prop_assert_eq!(first, second);
    }
}
