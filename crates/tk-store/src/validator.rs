// validator.rs — Read-only dependency graph analysis.
//
// Three independent checks over the full task list:
//   - cycles in the `task.id → task.dependencies` graph
//   - dependencies naming ids that are not in the list
//   - `done` tasks that depend on tasks which are not `done`
//
// Findings are advisory. Nothing here mutates state, so the validator is
// safe to run after every change.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::status::TaskStatus;
use crate::task::Task;

/// A dependency on an id that is not in the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    pub task_id: u64,
    pub dependency_id: u64,
}

/// A `done` task whose dependency is still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDependency {
    pub task_id: u64,
    pub dependency_id: u64,
    pub dependency_status: TaskStatus,
}

/// Result of running every check over a task list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub valid: bool,
    /// Each cycle runs from the repeated task back to itself, e.g. `[1, 2, 3, 1]`.
    pub cycles: Vec<Vec<u64>>,
    pub missing_dependencies: Vec<MissingDependency>,
    pub completed_with_pending_dependencies: Vec<PendingDependency>,
}

/// Run all dependency checks.
pub fn validate(tasks: &[Task]) -> DependencyReport {
    let cycles = find_cycles(tasks);
    let missing_dependencies = find_missing_dependencies(tasks);
    let completed_with_pending_dependencies = find_completed_with_pending(tasks);
    DependencyReport {
        valid: cycles.is_empty()
            && missing_dependencies.is_empty()
            && completed_with_pending_dependencies.is_empty(),
        cycles,
        missing_dependencies,
        completed_with_pending_dependencies,
    }
}

/// Depth-first search with an explicit stack.
///
/// `on_path` holds the active traversal path so that a node shared by two
/// independent branches is not mistaken for a cycle. `visited` keeps fully
/// explored subtrees from being walked twice.
pub fn find_cycles(tasks: &[Task]) -> Vec<Vec<u64>> {
    let graph: HashMap<u64, &[u64]> = tasks
        .iter()
        .map(|t| (t.id, t.dependencies.as_slice()))
        .collect();

    let mut visited: HashSet<u64> = HashSet::new();
    let mut seen_cycles: HashSet<Vec<u64>> = HashSet::new();
    let mut cycles = Vec::new();

    for root in tasks.iter().map(|t| t.id) {
        if visited.contains(&root) {
            continue;
        }

        // (node, index of the next dependency to explore)
        let mut stack: Vec<(u64, usize)> = vec![(root, 0)];
        let mut path: Vec<u64> = vec![root];
        let mut on_path: HashSet<u64> = HashSet::from([root]);
        visited.insert(root);

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let deps = graph.get(&node).copied().unwrap_or(&[]);

            if next >= deps.len() {
                stack.pop();
                path.pop();
                on_path.remove(&node);
                continue;
            }
            frame.1 += 1;

            let dep = deps[next];
            if on_path.contains(&dep) {
                if let Some(start) = path.iter().position(|&id| id == dep) {
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    if seen_cycles.insert(canonical_cycle(&cycle)) {
                        cycles.push(cycle);
                    }
                }
            } else if !visited.contains(&dep) && graph.contains_key(&dep) {
                visited.insert(dep);
                on_path.insert(dep);
                path.push(dep);
                stack.push((dep, 0));
            }
        }
    }

    cycles
}

/// Rotation-independent key for a cycle (without the closing repeat).
fn canonical_cycle(cycle: &[u64]) -> Vec<u64> {
    let body = &cycle[..cycle.len().saturating_sub(1)];
    let Some(min_pos) = body
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    body[min_pos..].iter().chain(&body[..min_pos]).copied().collect()
}

pub fn find_missing_dependencies(tasks: &[Task]) -> Vec<MissingDependency> {
    let ids: HashSet<u64> = tasks.iter().map(|t| t.id).collect();
    let ids = &ids;
    tasks
        .iter()
        .flat_map(move |task| {
            task.dependencies
                .iter()
                .filter(move |dep| !ids.contains(*dep))
                .map(move |&dependency_id| MissingDependency {
                    task_id: task.id,
                    dependency_id,
                })
        })
        .collect()
}

pub fn find_completed_with_pending(tasks: &[Task]) -> Vec<PendingDependency> {
    let statuses: HashMap<u64, &TaskStatus> = tasks.iter().map(|t| (t.id, &t.status)).collect();
    let statuses = &statuses;
    tasks
        .iter()
        .filter(|task| task.is_done())
        .flat_map(move |task| {
            task.dependencies.iter().filter_map(move |dep| {
                let status = *statuses.get(dep)?;
                (*status != TaskStatus::Done).then(|| PendingDependency {
                    task_id: task.id,
                    dependency_id: *dep,
                    dependency_status: status.clone(),
                })
            })
        })
        .collect()
}
