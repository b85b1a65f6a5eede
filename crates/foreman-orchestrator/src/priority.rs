//! Priority scoring and ready-queue ordering.

use crate::task_graph::TaskGraph;
use crate::types::{Task, TaskCategory};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Weights of the priority formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    /// Base score for setup tasks.
    #[serde(default = "default_setup")]
    pub setup: f64,
    /// Base score for bug fixes.
    #[serde(default = "default_bugfix")]
    pub bugfix: f64,
    /// Base score for features.
    #[serde(default = "default_feature")]
    pub feature: f64,
    /// Base score for test tasks.
    #[serde(default = "default_test")]
    pub test: f64,
    /// Base score for refactors.
    #[serde(default = "default_refactor")]
    pub refactor: f64,
    /// Base score for documentation.
    #[serde(default = "default_documentation")]
    pub documentation: f64,
    /// Added per task (transitively) waiting on this one.
    #[serde(default = "default_blocked_bonus")]
    pub blocked_bonus: f64,
    /// Added per scheduling round the task was passed over.
    #[serde(default = "default_age_bonus")]
    pub age_bonus: f64,
    /// Ceiling of the age component.
    #[serde(default = "default_age_cap")]
    pub age_cap: f64,
}

fn default_setup() -> f64 {
    50.0
}
fn default_bugfix() -> f64 {
    40.0
}
fn default_feature() -> f64 {
    30.0
}
fn default_test() -> f64 {
    20.0
}
fn default_refactor() -> f64 {
    15.0
}
fn default_documentation() -> f64 {
    10.0
}
fn default_blocked_bonus() -> f64 {
    5.0
}
fn default_age_bonus() -> f64 {
    1.0
}
fn default_age_cap() -> f64 {
    10.0
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            setup: default_setup(),
            bugfix: default_bugfix(),
            feature: default_feature(),
            test: default_test(),
            refactor: default_refactor(),
            documentation: default_documentation(),
            blocked_bonus: default_blocked_bonus(),
            age_bonus: default_age_bonus(),
            age_cap: default_age_cap(),
        }
    }
}

impl PriorityWeights {
    /// Base score of a category.
    pub fn base(&self, category: TaskCategory) -> f64 {
        match category {
            TaskCategory::Setup => self.setup,
            TaskCategory::Bugfix => self.bugfix,
            TaskCategory::Feature => self.feature,
            TaskCategory::Test => self.test,
            TaskCategory::Refactor => self.refactor,
            TaskCategory::Documentation => self.documentation,
        }
    }
}

/// Priority of `task` given how many tasks wait on it.
///
/// An explicit override is added on top of the category base.
pub fn compute_priority(task: &Task, blocked: usize, weights: &PriorityWeights) -> f64 {
    let base = weights.base(task.category);
    let age = (weights.age_bonus * f64::from(task.waited_rounds)).min(weights.age_cap);
    base + weights.blocked_bonus * blocked as f64 + age + task.priority_override.unwrap_or(0.0)
}

/// Higher priority first, then insertion order.
pub fn compare(a: &Task, b: &Task) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Recompute the priority of every ready task and return them in
/// allocation order.
pub fn rank_ready(graph: &mut TaskGraph, weights: &PriorityWeights) -> Vec<Task> {
    let scored: Vec<_> = graph
        .ready_tasks()
        .into_iter()
        .map(|t| {
            let blocked = graph.transitive_dependents(&t.id).len();
            (t.id.clone(), compute_priority(t, blocked, weights))
        })
        .collect();

    let mut ready = Vec::with_capacity(scored.len());
    for (id, priority) in scored {
        if graph.set_priority(&id, priority).is_ok() {
            if let Ok(task) = graph.get(&id) {
                ready.push(task.clone());
            }
        }
    }
    ready.sort_by(compare);
    ready
}
