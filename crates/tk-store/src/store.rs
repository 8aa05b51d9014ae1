// store.rs — TaskStore: the canonical in-memory snapshot and its mutators.
//
// The store owns exactly one piece of shared mutable state: the snapshot.
// Every change to `tasks` or `meta` goes through `set_state` (or its
// closure form used by the task mutators), which stamps `last_updated`,
// publishes `Changed` unless silent, and schedules a debounced save unless
// persistence is switched off for the call.
//
// Mutators report failure with sentinels (`None`, `false`) rather than
// errors so one bad call in a batch doesn't unwind the others. Callers
// that want an error turn the sentinel into one themselves.
//
// `TaskStore` is a cheap handle around an `Arc`; clone it to share the
// store. There is no global instance.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::events::{EventBus, EventKind, StoreEvent, StoreFailure, StoreObserver, SubscriptionId};
use crate::export;
use crate::observers;
use crate::persistence::{LoadOutcome, PersistenceEngine};
use crate::status::{self, TaskStatus};
use crate::task::{Meta, NewTask, StoreState, Task, TaskUpdate};

/// Options for a single `set_state` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetStateOptions {
    /// Skip publishing `Changed`. Used for corrections made by observers.
    pub silent: bool,
    /// Schedule a debounced save of the active task file.
    pub persist: bool,
}

impl Default for SetStateOptions {
    fn default() -> Self {
        Self {
            silent: false,
            persist: true,
        }
    }
}

impl SetStateOptions {
    /// Update without publishing `Changed`, still persisting.
    pub fn silent() -> Self {
        Self {
            silent: true,
            persist: true,
        }
    }

    /// Publish `Changed` but do not schedule a save.
    pub fn without_persist() -> Self {
        Self {
            silent: false,
            persist: false,
        }
    }
}

/// A partial snapshot for `set_state`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub tasks: Option<Vec<Task>>,
    pub meta: Option<Meta>,
    pub current_task: Option<Option<u64>>,
}

impl StatePatch {
    pub fn tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Some(tasks),
            ..Self::default()
        }
    }

    pub fn meta(meta: Meta) -> Self {
        Self {
            meta: Some(meta),
            ..Self::default()
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn current_task(current: Option<u64>) -> Self {
        Self {
            current_task: Some(current),
            ..Self::default()
        }
    }

    fn apply_to(self, state: &mut StoreState) {
        if let Some(tasks) = self.tasks {
            state.tasks = tasks;
        }
        if let Some(meta) = self.meta {
            state.meta = meta;
        }
        if let Some(current_task) = self.current_task {
            state.current_task = current_task;
        }
    }
}

/// Options for `TaskStore::initialize`.
#[derive(Debug, Clone)]
pub struct InitializeOptions {
    /// Task file to load instead of the configured one.
    pub path: Option<PathBuf>,
    /// Register the built-in observers (auto-persist, logging, dependency
    /// check, cascade, and the event log when configured).
    pub builtin_observers: bool,
}

impl Default for InitializeOptions {
    fn default() -> Self {
        Self {
            path: None,
            builtin_observers: true,
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    state: RwLock<StoreState>,
    active_path: RwLock<PathBuf>,
    bus: EventBus,
    engine: Arc<PersistenceEngine>,
    builtin_subscriptions: Mutex<Vec<SubscriptionId>>,
    initialized: AtomicBool,
}

/// The task state store.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    /// Create a store with an empty snapshot. Nothing is read from disk
    /// until `initialize` or `load_state` is called.
    pub fn new(config: StoreConfig) -> Self {
        let engine = PersistenceEngine::new(config.project_name.clone(), config.debounce());
        let state = StoreState {
            meta: Meta::new(config.project_name.clone()),
            ..StoreState::default()
        };
        Self {
            inner: Arc::new(StoreInner {
                active_path: RwLock::new(config.tasks_file.clone()),
                config,
                state: RwLock::new(state),
                bus: EventBus::new(),
                engine: Arc::new(engine),
                builtin_subscriptions: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Create a store for `project_root`, honouring its config file.
    pub fn for_project(project_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(StoreConfig::load(project_root)?))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<PersistenceEngine> {
        &self.inner.engine
    }

    /// The task file automatic saves go to: the last one loaded, or the
    /// configured default.
    pub fn active_path(&self) -> PathBuf {
        self.inner
            .active_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get_state(&self) -> StoreState {
        self.read_state().clone()
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.read_state().tasks.clone()
    }

    pub fn get_task_by_id(&self, id: u64) -> Option<Task> {
        self.read_state().task(id).cloned()
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.read_state()
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn get_meta(&self) -> Meta {
        self.read_state().meta.clone()
    }

    /// Pending tasks whose dependencies are all `done`.
    ///
    /// A dependency on a task that doesn't exist keeps a task from being ready.
    pub fn get_ready_tasks(&self) -> Vec<Task> {
        let state = self.read_state();
        state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies
                    .iter()
                    .all(|dep| state.task(*dep).is_some_and(Task::is_done))
            })
            .cloned()
            .collect()
    }

    /// The ready task to pick up next: highest priority, then fewest
    /// dependencies, then lowest id.
    pub fn next_task(&self) -> Option<Task> {
        self.get_ready_tasks()
            .into_iter()
            .max_by_key(|t| (t.priority, Reverse(t.dependencies.len()), Reverse(t.id)))
    }

    /// Number of tasks in each status, in lifecycle order.
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        export::status_counts(&self.read_state().tasks)
    }

    pub fn is_valid_status_transition(&self, from: &str, to: &str) -> bool {
        status::can_transition_str(from, to)
    }

    // ── Mutation ─────────────────────────────────────────────────

    /// Merge `patch` into the snapshot. The only way `tasks` and `meta` change.
    pub fn set_state(&self, patch: StatePatch, options: SetStateOptions) {
        let applied: Result<(), StoreError> = self.commit(options, |state| {
            patch.apply_to(state);
            Ok(())
        });
        debug_assert!(applied.is_ok());
    }

    /// Closure form of `set_state`. The closure either mutates the
    /// snapshot and returns `Ok`, or leaves it alone and returns `Err`; on
    /// `Err` nothing is stamped, published, or scheduled.
    fn commit<R>(
        &self,
        options: SetStateOptions,
        mutate: impl FnOnce(&mut StoreState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let (result, snapshot) = {
            let mut state = self.write_state();
            let result = mutate(&mut *state)?;
            state.last_updated = Some(Utc::now());
            let snapshot = (!options.silent).then(|| state.clone());
            (result, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.publish(StoreEvent::Changed {
                state: snapshot,
                persist: options.persist,
            });
        }
        if options.persist {
            self.schedule_persist();
        }
        Ok(result)
    }

    /// Add a task. The id is `max(existing ids, tasks ever generated) + 1`,
    /// so ids are never reused after a removal.
    pub fn add_task(&self, new_task: NewTask, options: SetStateOptions) -> Result<Task, StoreError> {
        let title = new_task.title.trim();
        if title.is_empty() {
            return Err(StoreError::Validation("task title is required".to_string()));
        }
        let title = title.to_string();

        let task = self.commit(options, move |state| {
            let max_id = state.tasks.iter().map(|t| t.id).max().unwrap_or(0);
            let id = max_id.max(state.meta.total_tasks_generated) + 1;

            let task = Task {
                title,
                description: new_task.description,
                status: new_task.status.unwrap_or_default(),
                priority: new_task.priority.unwrap_or_default(),
                dependencies: new_task.dependencies,
                subtasks: new_task.subtasks,
                details: new_task.details,
                test_strategy: new_task.test_strategy,
                extra: new_task.extra,
                ..Task::new(id, "")
            };
            state.tasks.push(task.clone());
            state.meta.total_tasks_generated += 1;
            state.meta.tasks_included = state.tasks.len() as u64;
            state.meta.updated_at = Some(Utc::now().to_rfc3339());
            Ok(task)
        })?;

        tracing::info!(task_id = task.id, title = %task.title, "task added");
        Ok(task)
    }

    /// Merge `update` into task `id`.
    ///
    /// A status change goes through the lifecycle table first; if it is not
    /// allowed the whole update is rejected and nothing changes. Returns
    /// the updated task, or `None` when the task is missing or the update
    /// was rejected.
    pub fn update_task(&self, id: u64, update: TaskUpdate, options: SetStateOptions) -> Option<Task> {
        let result = self.commit(options, move |state| {
            let index = state
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or(StoreError::NotFound(id))?;
            let current = &state.tasks[index];

            let mut update = update;
            if let Some(title) = update.title.as_mut() {
                let trimmed = title.trim();
                if trimmed.is_empty() {
                    return Err(StoreError::Validation("task title is required".to_string()));
                }
                *title = trimmed.to_string();
            }
            let mut updated = match update.status.take() {
                Some(next) if next != current.status => status::transition(current, next)?,
                _ => current.clone(),
            };
            update.apply_to(&mut updated);

            state.tasks[index] = updated.clone();
            state.meta.updated_at = Some(Utc::now().to_rfc3339());
            Ok(updated)
        });

        match result {
            Ok(task) => Some(task),
            Err(StoreError::NotFound(id)) => {
                tracing::debug!(task_id = id, "update for unknown task ignored");
                None
            }
            Err(err) => {
                tracing::warn!(task_id = id, error = %err, "task update rejected");
                self.publish(StoreEvent::Error(StoreFailure::new("update_task", &err)));
                None
            }
        }
    }

    /// Change a task's status through the lifecycle table.
    pub fn set_task_status(&self, id: u64, status: TaskStatus, options: SetStateOptions) -> Option<Task> {
        self.update_task(id, TaskUpdate::status(status), options)
    }

    /// Remove task `id`. Returns whether it existed.
    pub fn remove_task(&self, id: u64, options: SetStateOptions) -> bool {
        let removed = self.commit(options, |state| {
            let before = state.tasks.len();
            state.tasks.retain(|t| t.id != id);
            if state.tasks.len() == before {
                return Err(StoreError::NotFound(id));
            }
            state.meta.tasks_included = state.tasks.len() as u64;
            state.meta.updated_at = Some(Utc::now().to_rfc3339());
            if state.current_task == Some(id) {
                state.current_task = None;
            }
            Ok(())
        });

        match removed {
            Ok(()) => {
                tracing::info!(task_id = id, "task removed");
                true
            }
            Err(_) => false,
        }
    }

    /// Point the transient `current_task` at a task (or clear it).
    pub fn set_current_task(&self, id: Option<u64>) {
        self.set_state(
            StatePatch::current_task(id),
            SetStateOptions {
                silent: true,
                persist: false,
            },
        );
    }

    // ── Events ───────────────────────────────────────────────────

    /// Subscribe an observer to the given event kinds.
    pub fn subscribe(&self, kinds: &[EventKind], observer: Arc<dyn StoreObserver>) -> SubscriptionId {
        self.inner.bus.subscribe(kinds, observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Deliver `event` to its subscribers. Never called with the state lock held.
    pub(crate) fn publish(&self, event: StoreEvent) {
        for observer in self.inner.bus.observers_for(event.kind()) {
            if let Err(e) = observer.on_event(&event, self) {
                tracing::warn!(
                    observer = observer.name(),
                    event = event.event_type(),
                    error = %e,
                    "observer failed"
                );
            }
        }
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Schedule a debounced save of the active task file. The snapshot is
    /// read when the timer fires, not now.
    pub fn schedule_persist(&self) {
        let path = self.active_path();
        let store = self.clone();
        let target = path.clone();
        self.inner.engine.schedule_save(&path, async move {
            if store.active_path() != target {
                tracing::debug!(path = %target.display(), "active task file changed, dropping stale save");
                return;
            }
            let state = store.read_state().persisted();
            let saved = store.inner.engine.save(&target, &state).await;
            match saved {
                Ok(()) => store.publish(StoreEvent::Persisted(target)),
                Err(err) => {
                    tracing::error!(path = %target.display(), error = %err, "automatic save failed");
                    store.publish(StoreEvent::Error(StoreFailure::new("auto_persist", &err)));
                }
            }
        });
    }

    /// Write the snapshot now. Errors are returned to the caller.
    pub async fn persist_state(&self, path: Option<&Path>) -> Result<PathBuf, StoreError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.active_path());
        self.inner.engine.cancel_pending(&path);

        let state = self.read_state().persisted();
        let saved = self.inner.engine.save(&path, &state).await;
        match saved {
            Ok(()) => {
                self.publish(StoreEvent::Persisted(path.clone()));
                Ok(path)
            }
            Err(err) => {
                self.publish(StoreEvent::Error(StoreFailure::new("persist", &err)));
                Err(err)
            }
        }
    }

    /// Load a task file into the snapshot and make it the active path.
    ///
    /// Never fails: unreadable files degrade to a default snapshot, with
    /// the problem recorded in `StoreState::error`.
    pub async fn load_state(&self, path: Option<&Path>) -> StoreState {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.active_path());
        self.write_state().loading = true;

        let LoadOutcome { state, source, error } = self.inner.engine.load(&path).await;
        tracing::debug!(path = %path.display(), ?source, "task file loaded");

        // A save still pending for the previous file must be written with
        // the snapshot it was scheduled for, before that snapshot is replaced.
        let previous = self.active_path();
        if previous != path && self.inner.engine.cancel_pending(&previous) {
            if let Err(err) = self.persist_state(Some(&previous)).await {
                tracing::error!(path = %previous.display(), error = %err, "pending save failed");
            }
        }

        *self
            .inner
            .active_path
            .write()
            .unwrap_or_else(PoisonError::into_inner) = path;

        self.set_state(
            StatePatch::tasks(state.tasks).with_meta(state.meta),
            SetStateOptions {
                silent: true,
                persist: false,
            },
        );

        let snapshot = {
            let mut current = self.write_state();
            current.loading = false;
            current.error = error.clone();
            current.clone()
        };

        if let Some(message) = error {
            self.publish(StoreEvent::Error(StoreFailure {
                operation: "load".to_string(),
                message,
            }));
        }
        self.publish(StoreEvent::Loaded(snapshot.clone()));
        snapshot
    }

    /// Register observers (once), load the task file, publish `Initialized`.
    pub async fn initialize(&self, options: InitializeOptions) -> StoreState {
        if options.builtin_observers {
            let mut builtins = self
                .inner
                .builtin_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if builtins.is_empty() {
                *builtins = observers::register_builtin(self);
            }
        }

        let snapshot = self.load_state(options.path.as_deref()).await;
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.publish(StoreEvent::Initialized(snapshot.clone()));
        snapshot
    }

    /// Perform every pending debounced save now. Returns the paths written.
    pub async fn flush(&self) -> Vec<PathBuf> {
        let mut written = Vec::new();
        for path in self.inner.engine.cancel_all() {
            match self.persist_state(Some(&path)).await {
                Ok(path) => written.push(path),
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "pending save failed")
                }
            }
        }
        written
    }

    /// Flush pending saves and remove the built-in observers. The store
    /// stays usable afterwards.
    pub async fn shutdown(&self) {
        self.flush().await;

        let builtins = std::mem::take(
            &mut *self
                .inner
                .builtin_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in builtins {
            self.inner.bus.unsubscribe(id);
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    /// Write a markdown progress report for the current snapshot.
    pub async fn export_progress(&self, path: &Path) -> Result<(), StoreError> {
        let markdown = export::render_progress_markdown(&self.get_state());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::write(path, markdown)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
