//! Turning requirements into an ordered list of tasks.

use crate::types::{Task, TaskCategory, TaskId};
use foreman_core::{ForemanError, ForemanResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Produces tasks from a requirements document.
///
/// Returned tasks are ordered so that every dependency precedes its
/// dependents, ready to be enqueued one by one.
pub trait Planner: Send + Sync {
    /// Plan `input` into tasks.
    fn plan(&self, input: &str) -> ForemanResult<Vec<Task>>;
}

/// Planner for bulleted outlines.
///
/// ```text
/// Build a URL shortener.
///
/// - [store] Setup storage layer
///   - keys are unique
/// - Add redirect handler after: store
///   - unknown keys return 404
/// ```
///
/// Top-level bullets become tasks, nested bullets their acceptance
/// criteria, and plain lines extend the description of the task above them.
/// Lines before the first bullet are shared context appended to every task.
/// A `[id]` prefix names a task (default `T<n>`), an `after: a, b` suffix
/// declares dependencies, and the first word of the title picks the
/// category. Text without bullets becomes a single task.
#[derive(Debug, Clone, Default)]
pub struct OutlinePlanner;

struct Draft {
    id: String,
    title: String,
    description: Vec<String>,
    criteria: Vec<String>,
    after: Vec<String>,
}

impl OutlinePlanner {
    /// Create the planner.
    pub fn new() -> Self {
        Self
    }
}

fn bullet_text(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(text) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(text.trim());
        }
    }
    None
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn category_of(title: &str) -> TaskCategory {
    title
        .split_whitespace()
        .next()
        .and_then(TaskCategory::from_keyword)
        .unwrap_or_default()
}

impl Planner for OutlinePlanner {
    fn plan(&self, input: &str) -> ForemanResult<Vec<Task>> {
        let id_re = Regex::new(r"^\[([A-Za-z0-9_.-]+)\]\s*(.*)$")
            .map_err(|e| ForemanError::Orchestrator(format!("planner pattern: {e}")))?;
        let after_re = Regex::new(r"(?i)\s*\(?\s*after:\s*([A-Za-z0-9_.,\s-]+?)\s*\)?\s*$")
            .map_err(|e| ForemanError::Orchestrator(format!("planner pattern: {e}")))?;

        let mut preamble = Vec::new();
        let mut drafts: Vec<Draft> = Vec::new();
        let mut top_indent: Option<usize> = None;

        for raw in input.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let indent = indent_of(raw);
            match bullet_text(line) {
                Some(text) if top_indent.map_or(true, |top| indent <= top) => {
                    top_indent.get_or_insert(indent);
                    let (id, rest) = match id_re.captures(text) {
                        Some(caps) => (
                            caps.get(1).map(|m| m.as_str().to_string()),
                            caps.get(2).map_or("", |m| m.as_str()).to_string(),
                        ),
                        None => (None, text.to_string()),
                    };
                    let (title, after) = match after_re.captures(&rest) {
                        Some(caps) => {
                            let deps = caps
                                .get(1)
                                .map_or("", |m| m.as_str())
                                .split(|c: char| c == ',' || c.is_whitespace())
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect();
                            let start = caps.get(0).map_or(rest.len(), |m| m.start());
                            (rest[..start].trim().to_string(), deps)
                        }
                        None => (rest.trim().to_string(), Vec::new()),
                    };
                    drafts.push(Draft {
                        id: id.unwrap_or_else(|| format!("T{}", drafts.len() + 1)),
                        title,
                        description: Vec::new(),
                        criteria: Vec::new(),
                        after,
                    });
                }
                Some(text) => {
                    if let Some(draft) = drafts.last_mut() {
                        draft.criteria.push(text.to_string());
                    }
                }
                None => match drafts.last_mut() {
                    Some(draft) => draft.description.push(line.to_string()),
                    None => preamble.push(line.trim_start_matches('#').trim().to_string()),
                },
            }
        }

        if drafts.is_empty() {
            let mut lines = preamble.into_iter().filter(|l| !l.is_empty());
            let Some(title) = lines.next() else {
                return Ok(Vec::new());
            };
            let task = Task::new("T1", title.clone())
                .with_description(lines.collect::<Vec<_>>().join("\n"))
                .with_category(category_of(&title));
            return Ok(vec![task]);
        }

        let context = preamble.join("\n");
        let tasks = drafts
            .into_iter()
            .map(|d| {
                let mut description = d.description.join("\n");
                if !context.is_empty() {
                    if !description.is_empty() {
                        description.push_str("\n\n");
                    }
                    description.push_str("Context:\n");
                    description.push_str(&context);
                }
                Task::new(d.id, d.title.clone())
                    .with_description(description)
                    .with_criteria(d.criteria)
                    .with_dependencies(d.after)
                    .with_category(category_of(&d.title))
            })
            .collect();
        order_tasks(tasks)
    }
}

/// One task in a TOML plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Unique identifier.
    pub id: String,
    /// One-line title.
    pub title: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Kind of work.
    #[serde(default)]
    pub category: TaskCategory,
    /// Explicit priority.
    #[serde(default)]
    pub priority: Option<f64>,
    /// Acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Identifiers of prerequisite tasks.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Explicit task list loaded from TOML.
///
/// ```toml
/// [[tasks]]
/// id = "schema"
/// title = "Setup database schema"
/// category = "setup"
///
/// [[tasks]]
/// id = "api"
/// title = "Add REST endpoints"
/// priority = 60.0
/// depends_on = ["schema"]
/// acceptance_criteria = ["returns 404 for unknown ids"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanFile {
    /// Tasks in file order.
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

impl PlanFile {
    /// Parse a plan from TOML text.
    pub fn parse(text: &str) -> ForemanResult<Self> {
        toml::from_str(text).map_err(|e| ForemanError::Config(format!("invalid plan file: {e}")))
    }

    /// Read and parse a plan file.
    pub async fn load(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ForemanError::Config(format!("cannot read plan {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Tasks in dependency order.
    pub fn into_tasks(self) -> ForemanResult<Vec<Task>> {
        let tasks = self
            .tasks
            .into_iter()
            .map(|p| {
                let mut task = Task::new(p.id, p.title)
                    .with_description(p.description)
                    .with_category(p.category)
                    .with_criteria(p.acceptance_criteria)
                    .with_dependencies(p.depends_on);
                task.priority_override = p.priority;
                task
            })
            .collect();
        order_tasks(tasks)
    }
}

/// Order tasks so dependencies come first, keeping input order otherwise.
///
/// Fails on duplicate ids, unknown dependencies and cycles.
pub fn order_tasks(tasks: Vec<Task>) -> ForemanResult<Vec<Task>> {
    let mut seen = HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.clone()) {
            return Err(ForemanError::DuplicateTask(task.id.to_string()));
        }
    }
    for task in &tasks {
        if let Some(missing) = task.dependencies.iter().find(|d| !seen.contains(*d)) {
            return Err(ForemanError::InvalidDependency {
                task: task.id.to_string(),
                dependency: missing.to_string(),
            });
        }
    }

    let mut remaining: Vec<Task> = tasks;
    let mut placed: BTreeSet<TaskId> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let position = remaining
            .iter()
            .position(|t| t.dependencies.iter().all(|d| placed.contains(d)));
        let Some(position) = position else {
            let ids: Vec<_> = remaining.iter().map(|t| t.id.to_string()).collect();
            return Err(ForemanError::Orchestrator(format!(
                "dependency cycle among tasks: {}",
                ids.join(", ")
            )));
        };
        let task = remaining.remove(position);
        placed.insert(task.id.clone());
        ordered.push(task);
    }
    Ok(ordered)
}
