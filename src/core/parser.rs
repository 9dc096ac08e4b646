//! Plan outline parser.
//!
//! Accepts the markdown-ish outlines produced by the planning commands:
//!
//! ```text
//! # Plan: Auth refactor
//! ## Phase 1: Foundation [PARALLEL]
//! - [ ] 1.1 Create `src/auth/token.rs`
//! - [ ] 1.2 Add tests in `tests/auth.rs` (depends: 1.1)
//! ## Phase 2: Migration [SEQUENTIAL] (threshold: 0.8)
//! - [x] 2.1 Write migration [SEQUENTIAL: db]
//!   Touches `migrations/` only.
//! ```
//!
//! The parser only identifies structure. Dependencies are resolved by
//! [`crate::core::dag::resolve`], file references by the conflict detector.

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::core::plan::{Phase, Plan};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::blog_debug;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+(?:(?i:plan)\s*:\s*)?(.+?)\s*$").unwrap());

static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{2,3}\s+(?i:phase)\s+(\d+)\b\s*(?:[:.\-]\s*)?(.*?)\s*$").unwrap()
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\s+\S").unwrap());

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:#{3,6}\s+|[-*+]\s+)?(?:\[([ xX])\]\s+)?(?:\*\*)?(?:(?i:task)\s+)?(\d+(?:\.\d+)+)(?:\*\*)?[:.)]?(?:\*\*)?\s+(.+)$",
    )
    .unwrap()
});

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*+]\s+\[[ xX]\]\s+").unwrap());

static DEPENDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*depends(?:\s+on)?\s*:\s*([^)]*)\)").unwrap());

static SEQUENTIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[sequential(?:\s*:\s*([\w.\-]+))?\]").unwrap());

static PARALLEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[parallel\]").unwrap());

static THRESHOLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*threshold\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*(%?)\s*\)").unwrap()
});

static DEP_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)*$").unwrap());

const UNTITLED: &str = "Untitled plan";

/// Parse a plan outline.
///
/// # Errors
/// - [`Error::MalformedPlan`] when a task has no numeric id, appears outside
///   a phase, carries an unparsable annotation, or the plan has no phases.
/// - [`Error::DuplicateId`] for a repeated task or phase id.
pub fn parse(text: &str) -> Result<Plan> {
    let mut title: Option<String> = None;
    let mut phases: Vec<Phase> = Vec::new();
    let mut tasks: Vec<Task> = Vec::new();
    let mut seen_tasks: HashSet<TaskId> = HashSet::new();
    let mut seen_phases: HashSet<String> = HashSet::new();
    // Whether the most recent `##` section is a phase.
    let mut in_phase = false;
    let mut current_task: Option<usize> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let indented = raw.starts_with(|c: char| c.is_whitespace());

        if !indented && title.is_none() && phases.is_empty() {
            if let Some(caps) = TITLE_RE.captures(trimmed) {
                title = Some(caps[1].to_string());
                continue;
            }
        }

        if let Some(caps) = PHASE_RE.captures(trimmed) {
            let phase = parse_phase_header(&caps[1], &caps[2], line_no)?;
            if !seen_phases.insert(phase.id.clone()) {
                return Err(Error::DuplicateId {
                    kind: "phase",
                    id: phase.id,
                });
            }
            phases.push(phase);
            in_phase = true;
            current_task = None;
            continue;
        }

        if let Some(caps) = TASK_RE.captures(trimmed) {
            if !in_phase {
                return Err(Error::MalformedPlan {
                    line: line_no,
                    reason: format!("task {} is not inside a phase", &caps[2]),
                });
            }
            let phase = phases.last_mut().ok_or_else(|| Error::MalformedPlan {
                line: line_no,
                reason: "task is not inside a phase".to_string(),
            })?;
            let checked = caps.get(1).is_some_and(|m| m.as_str() != " ");
            let task = parse_task(&caps[2], &caps[3], checked, phase, line_no)?;
            if !seen_tasks.insert(task.id.clone()) {
                return Err(Error::DuplicateId {
                    kind: "task",
                    id: task.id.to_string(),
                });
            }
            phase.task_ids.push(task.id.clone());
            tasks.push(task);
            current_task = Some(tasks.len() - 1);
            continue;
        }

        if indented {
            if let Some(i) = current_task {
                let task = &mut tasks[i];
                task.description.push('\n');
                task.description.push_str(trimmed);
                continue;
            }
        }

        if CHECKBOX_RE.is_match(trimmed) {
            return Err(Error::MalformedPlan {
                line: line_no,
                reason: format!("task has no numeric id: {}", trimmed),
            });
        }

        if SECTION_RE.is_match(trimmed) {
            // A non-phase `##` section closes the current phase.
            in_phase = false;
            current_task = None;
        }
    }

    if phases.is_empty() {
        return Err(Error::MalformedPlan {
            line: text.lines().count(),
            reason: "plan has no phases".to_string(),
        });
    }

    let name = title.unwrap_or_else(|| UNTITLED.to_string());
    blog_debug!(
        "parse: plan={:?} phases={} tasks={}",
        name,
        phases.len(),
        tasks.len()
    );
    Ok(Plan::new(&name, phases, tasks))
}

fn parse_phase_header(id: &str, rest: &str, line: usize) -> Result<Phase> {
    let mut phase = Phase::new(id, "");

    if let Some(caps) = THRESHOLD_RE.captures(rest) {
        let mut value: f64 = caps[1].parse().map_err(|_| Error::MalformedPlan {
            line,
            reason: format!("invalid threshold {:?}", &caps[1]),
        })?;
        if &caps[2] == "%" {
            value /= 100.0;
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::MalformedPlan {
                line,
                reason: format!("threshold out of range: {}", &caps[0]),
            });
        }
        phase.completion_threshold = Some(value);
    }
    if SEQUENTIAL_RE.is_match(rest) {
        phase.parallel_allowed = false;
    }

    let name = strip_annotations(rest);
    phase.name = if name.is_empty() {
        format!("Phase {}", id)
    } else {
        name
    };
    Ok(phase)
}

fn parse_task(id: &str, rest: &str, checked: bool, phase: &Phase, line: usize) -> Result<Task> {
    let mut task = Task::new(id, &phase.id, "");
    task.line = line;
    if checked {
        task.status = TaskStatus::Completed;
    }

    for caps in DEPENDS_RE.captures_iter(rest) {
        for dep in caps[1]
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("and"))
        {
            if !DEP_ID_RE.is_match(dep) {
                return Err(Error::MalformedPlan {
                    line,
                    reason: format!("task {} has a non-numeric dependency {:?}", id, dep),
                });
            }
            task.depends_on.insert(TaskId::new(dep));
        }
    }

    if let Some(caps) = SEQUENTIAL_RE.captures(rest) {
        task.sequential_group = Some(match caps.get(1) {
            Some(group) => group.as_str().to_string(),
            None => format!("phase-{}", phase.id),
        });
    }

    task.description = strip_annotations(rest);
    task.file_refs = BTreeSet::new();
    Ok(task)
}

fn strip_annotations(text: &str) -> String {
    let text = DEPENDS_RE.replace_all(text, "");
    let text = SEQUENTIAL_RE.replace_all(&text, "");
    let text = PARALLEL_RE.replace_all(&text, "");
    let text = THRESHOLD_RE.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
