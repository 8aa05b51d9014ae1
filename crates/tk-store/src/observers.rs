// observers.rs — Built-in store observers.
//
// Each policy that reacts to store changes lives here as a StoreObserver:
//   - AutoPersistObserver: debounced save after every visible, persisted change
//   - LoggingObserver: lifecycle log lines
//   - DependencyCheckObserver: advisory dependency findings
//   - CascadeObserver: keeps parent and subtask completion consistent
//
// `register_builtin` wires them (plus the JSONL event log when configured)
// onto a store. `TaskStore::initialize` calls it once; `shutdown` removes
// the subscriptions again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::events::{EventKind, EventLogObserver, StoreEvent, StoreObserver, SubscriptionId};
use crate::status::TaskStatus;
use crate::store::{SetStateOptions, StatePatch, TaskStore};
use crate::task::Task;
use crate::validator;

/// Subscribe the built-in observers to `store`.
pub fn register_builtin(store: &TaskStore) -> Vec<SubscriptionId> {
    let mut ids = vec![
        store.subscribe(&[EventKind::Changed], Arc::new(AutoPersistObserver)),
        store.subscribe(
            &[
                EventKind::Initialized,
                EventKind::Loaded,
                EventKind::Persisted,
                EventKind::Error,
            ],
            Arc::new(LoggingObserver),
        ),
        store.subscribe(&[EventKind::Changed], Arc::new(DependencyCheckObserver)),
        store.subscribe(&[EventKind::Changed], Arc::new(CascadeObserver::new())),
    ];

    if let Some(path) = &store.config().events_log {
        ids.push(store.subscribe(&EventKind::ALL, Arc::new(EventLogObserver::new(path))));
    }

    tracing::debug!(observers = ids.len(), "built-in observers registered");
    ids
}

/// Schedules a debounced save whenever the snapshot changes, unless the
/// change was made with `persist` unset.
pub struct AutoPersistObserver;

impl StoreObserver for AutoPersistObserver {
    fn name(&self) -> &str {
        "auto-persist"
    }

    fn on_event(&self, event: &StoreEvent, store: &TaskStore) -> Result<(), StoreError> {
        if let StoreEvent::Changed { persist: true, .. } = event {
            store.schedule_persist();
        }
        Ok(())
    }
}

/// Emits a log line for each lifecycle event.
pub struct LoggingObserver;

impl StoreObserver for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_event(&self, event: &StoreEvent, _store: &TaskStore) -> Result<(), StoreError> {
        match event {
            StoreEvent::Initialized(state) => tracing::info!(
                project = %state.meta.project_name,
                tasks = state.tasks.len(),
                "task store initialized"
            ),
            StoreEvent::Loaded(state) => tracing::info!(
                tasks = state.tasks.len(),
                total_generated = state.meta.total_tasks_generated,
                "task state loaded"
            ),
            StoreEvent::Persisted(path) => {
                tracing::debug!(path = %path.display(), "task state persisted")
            }
            StoreEvent::Error(failure) => tracing::error!(
                operation = %failure.operation,
                error = %failure.message,
                "task store error"
            ),
            StoreEvent::Changed { .. } => {}
        }
        Ok(())
    }
}

/// Runs the dependency validator after each change and warns about findings.
/// Never modifies state.
pub struct DependencyCheckObserver;

impl StoreObserver for DependencyCheckObserver {
    fn name(&self) -> &str {
        "dependency-check"
    }

    fn on_event(&self, event: &StoreEvent, _store: &TaskStore) -> Result<(), StoreError> {
        let StoreEvent::Changed { state, .. } = event else {
            return Ok(());
        };

        let report = validator::validate(&state.tasks);
        if report.valid {
            return Ok(());
        }
        if !report.cycles.is_empty() {
            tracing::warn!(cycles = ?report.cycles, "circular task dependencies detected");
        }
        if !report.missing_dependencies.is_empty() {
            let pairs: Vec<(u64, u64)> = report
                .missing_dependencies
                .iter()
                .map(|m| (m.task_id, m.dependency_id))
                .collect();
            tracing::warn!(missing = ?pairs, "tasks depend on ids that do not exist");
        }
        if !report.completed_with_pending_dependencies.is_empty() {
            let pairs: Vec<(u64, u64)> = report
                .completed_with_pending_dependencies
                .iter()
                .map(|p| (p.task_id, p.dependency_id))
                .collect();
            tracing::warn!(pending = ?pairs, "done tasks have dependencies that are not done");
        }
        Ok(())
    }
}

/// Corrections the cascade rules call for on one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadePlan {
    /// Done parents with at least one open subtask.
    pub complete_subtasks_of: Vec<u64>,
    /// Open parents whose subtasks are all done.
    pub complete_parents: Vec<u64>,
}

impl CascadePlan {
    pub fn is_empty(&self) -> bool {
        self.complete_subtasks_of.is_empty() && self.complete_parents.is_empty()
    }
}

/// Evaluate both cascade rules against `tasks`.
///
/// A task can only match one rule: completing subtasks applies to done
/// parents, completing the parent applies to parents that are not done.
pub fn plan_cascade(tasks: &[Task]) -> CascadePlan {
    let complete_subtasks_of = tasks
        .iter()
        .filter(|t| t.is_done() && t.subtasks.iter().any(|s| !s.is_done()))
        .map(|t| t.id)
        .collect();
    let complete_parents = tasks
        .iter()
        .filter(|t| !t.is_done() && t.all_subtasks_done())
        .map(|t| t.id)
        .collect();
    CascadePlan {
        complete_subtasks_of,
        complete_parents,
    }
}

/// Keeps subtask and parent completion in step.
///
/// Corrections are written with `silent` set, so they don't publish
/// `Changed` and never re-trigger this observer. At most one write per rule.
#[derive(Debug, Default)]
pub struct CascadeObserver {
    corrections: AtomicUsize,
}

impl CascadeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrective `set_state` calls issued so far.
    pub fn corrections(&self) -> usize {
        self.corrections.load(Ordering::Relaxed)
    }

    fn correct(&self, store: &TaskStore, tasks: Vec<Task>) {
        store.set_state(StatePatch::tasks(tasks), SetStateOptions::silent());
        self.corrections.fetch_add(1, Ordering::Relaxed);
    }
}

impl StoreObserver for CascadeObserver {
    fn name(&self) -> &str {
        "cascade"
    }

    fn on_event(&self, event: &StoreEvent, store: &TaskStore) -> Result<(), StoreError> {
        let StoreEvent::Changed { state, .. } = event else {
            return Ok(());
        };

        let plan = plan_cascade(&state.tasks);
        if plan.is_empty() {
            return Ok(());
        }

        if !plan.complete_subtasks_of.is_empty() {
            let now = Utc::now();
            let mut tasks = store.get_tasks();
            for task in tasks
                .iter_mut()
                .filter(|t| plan.complete_subtasks_of.contains(&t.id))
            {
                for subtask in task.subtasks.iter_mut().filter(|s| !s.is_done()) {
                    subtask.status = TaskStatus::Done;
                    subtask.status_updated_at = Some(now);
                }
            }
            tracing::info!(
                parents = ?plan.complete_subtasks_of,
                "parent done, marking its subtasks done"
            );
            self.correct(store, tasks);
        }

        if !plan.complete_parents.is_empty() {
            let now = Utc::now();
            let mut tasks = store.get_tasks();
            for task in tasks
                .iter_mut()
                .filter(|t| plan.complete_parents.contains(&t.id))
            {
                task.status = TaskStatus::Done;
                task.status_updated_at = Some(now);
            }
            tracing::info!(
                parents = ?plan.complete_parents,
                "all subtasks done, marking parent done"
            );
            self.correct(store, tasks);
        }

        Ok(())
    }
}
