//! File-conflict detection between tasks.
//!
//! Conflicts are a non-ordering relation: two conflicting tasks may run in
//! either order but never in the same batch.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use crate::config::ConflictConfig;
use crate::core::plan::Plan;
use crate::core::task::{Task, TaskId};

static BACKTICK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\s]+)`").unwrap());

static VERB_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:create|modify|update|edit|add|delete|remove|rename|write|change|refactor|fix|touch|extend)\s+(?:the\s+)?(?:file\s+)?([\w.\-/]+\.[A-Za-z0-9]{1,8})\b",
    )
    .unwrap()
});

static PATH_LIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.\-/]+$").unwrap());

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[A-Za-z0-9]{1,8}$").unwrap());

const TRIM_CHARS: &[char] = &[
    ',', ';', ':', '!', '?', '\'', '"', '(', ')', '[', ']', '{', '}', '<', '>', '*',
];

/// Extracts the file paths a task description refers to.
pub trait ConflictStrategy: Send + Sync {
    fn extract_paths(&self, text: &str) -> BTreeSet<String>;
}

/// Layered text heuristics: backtick-quoted paths, configured directory
/// prefixes, and verb-object phrases such as "update config.json".
#[derive(Debug, Clone)]
pub struct HeuristicConflictStrategy {
    prefixes: Vec<String>,
}

impl HeuristicConflictStrategy {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl Default for HeuristicConflictStrategy {
    fn default() -> Self {
        Self::new(ConflictConfig::default().path_prefixes)
    }
}

impl ConflictStrategy for HeuristicConflictStrategy {
    fn extract_paths(&self, text: &str) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();

        for caps in BACKTICK_RE.captures_iter(text) {
            if let Some(path) = normalize(&caps[1]) {
                if PATH_LIKE_RE.is_match(&path)
                    && (path.contains('/') || EXTENSION_RE.is_match(&path))
                {
                    paths.insert(path);
                }
            }
        }

        for word in text.split(|c: char| c.is_whitespace() || c == '`') {
            let Some(path) = normalize(word) else { continue };
            if self
                .prefixes
                .iter()
                .any(|p| path.starts_with(p.as_str()) || path == p.trim_end_matches('/'))
            {
                paths.insert(path);
            }
        }

        for caps in VERB_OBJECT_RE.captures_iter(text) {
            if let Some(path) = normalize(&caps[1]) {
                paths.insert(path);
            }
        }

        paths
    }
}

/// Trim surrounding punctuation, strip `./`, drop a trailing `/`.
/// URLs and empty results yield `None`.
fn normalize(raw: &str) -> Option<String> {
    if raw.contains("://") {
        return None;
    }
    let mut path = raw.trim_start_matches(TRIM_CHARS);
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    let path = path
        .trim_end_matches(|c: char| c == '.' || TRIM_CHARS.contains(&c))
        .trim_end_matches('/');
    if path.is_empty() || path == "." {
        None
    } else {
        Some(path.to_string())
    }
}

/// Two paths overlap when equal or when one is a string prefix of the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Symmetric, non-transitive conflicts-with relation.
#[derive(Debug, Clone, Default)]
pub struct ConflictRelation {
    edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl ConflictRelation {
    pub fn insert(&mut self, a: &TaskId, b: &TaskId) {
        if a == b {
            return;
        }
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b.clone()).or_default().insert(a.clone());
    }

    pub fn conflicts(&self, a: &TaskId, b: &TaskId) -> bool {
        self.edges.get(a).is_some_and(|set| set.contains(b))
    }

    /// Tasks conflicting with `id`, sorted.
    pub fn conflicts_of(&self, id: &TaskId) -> Vec<&TaskId> {
        self.edges
            .get(id)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    /// Number of unordered conflicting pairs.
    pub fn pair_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Fills task file references and computes the conflict relation.
pub struct ConflictDetector {
    strategy: Box<dyn ConflictStrategy>,
}

impl ConflictDetector {
    pub fn new(strategy: Box<dyn ConflictStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_config(config: &ConflictConfig) -> Self {
        Self::new(Box::new(HeuristicConflictStrategy::new(
            config.path_prefixes.clone(),
        )))
    }

    /// Populate each task's `file_refs` from its description.
    pub fn annotate(&self, plan: &mut Plan) {
        for task in plan.tasks.iter_mut() {
            let paths = self.strategy.extract_paths(&task.description);
            task.file_refs.extend(paths);
        }
    }

    /// Pairwise conflicts over the tasks' `file_refs`.
    pub fn detect(&self, tasks: &[Task]) -> ConflictRelation {
        let mut relation = ConflictRelation::default();
        for (i, a) in tasks.iter().enumerate() {
            for b in &tasks[i + 1..] {
                let overlap = a
                    .file_refs
                    .iter()
                    .any(|pa| b.file_refs.iter().any(|pb| paths_overlap(pa, pb)));
                if overlap {
                    relation.insert(&a.id, &b.id);
                }
            }
        }
        relation
    }
}

impl std::fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictDetector").finish_non_exhaustive()
    }
}
