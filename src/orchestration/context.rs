//! Everything a run needs, loaded once and passed explicitly.

use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::core::conflict::{ConflictDetector, ConflictRelation};
use crate::core::dag::{resolve_with_threshold, DependencyGraph};
use crate::core::parser::parse;
use crate::core::plan::Plan;
use crate::orchestration::health::HealthConfig;
use crate::orchestration::scheduler::Scheduler;
use crate::state::{OpenOutcome, StatusStore};
use crate::{blog, Result};

/// A frozen plan with its derived relations and the run configuration.
#[derive(Debug)]
pub struct OrchestratorContext {
    pub plan: Plan,
    pub graph: DependencyGraph,
    pub conflicts: ConflictRelation,
    pub config: Config,
    /// Distinguishes this run's events from other orchestrators in the process.
    pub instance_id: String,
}

impl OrchestratorContext {
    /// Parse, annotate file references, resolve dependencies and detect
    /// conflicts. Load-time errors are returned before anything runs.
    pub fn from_text(text: &str, config: Config) -> Result<Self> {
        let mut plan = parse(text)?;
        let detector = ConflictDetector::from_config(&config.conflicts);
        detector.annotate(&mut plan);
        let graph = resolve_with_threshold(&plan, config.scheduler.phase_completion_threshold)?;
        let conflicts = detector.detect(&plan.tasks);

        let short = Uuid::new_v4().simple().to_string();
        let instance_id = format!("{}-{}", plan.id, &short[..8]);
        blog!(
            "Loaded plan {:?}: {} phase(s), {} task(s), {} dependency edge(s), {} conflict pair(s)",
            plan.name,
            plan.phases.len(),
            plan.task_count(),
            graph.dependency_count(),
            conflicts.pair_count()
        );
        Ok(Self {
            plan,
            graph,
            conflicts,
            config,
            instance_id,
        })
    }

    pub fn load(plan_path: &Path, config: Config) -> Result<Self> {
        Self::from_text(&fs::read_to_string(plan_path)?, config)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_config(&self.config.scheduler)
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig::from_execution(&self.config.execution)
    }

    /// Open (or create) the status document for this plan.
    pub fn open_store(&self) -> Result<OpenOutcome> {
        StatusStore::open_or_init(
            self.config.state_path(),
            &self.plan,
            &self.graph,
            self.config.scheduler.phase_completion_threshold,
            self.config.scheduler.skip_through,
        )
    }
}
