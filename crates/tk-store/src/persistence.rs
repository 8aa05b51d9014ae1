// persistence.rs — Locked, atomic, debounced load/save of task files.
//
// Every I/O operation on a path first takes that path's async mutex, so a
// load and a save (or two saves) against the same file never interleave.
// Different paths never contend.
//
// Saves are atomic: the JSON is written to `<file>.tmp`, the previous file
// is copied to `<file>.backup`, and the temp file is renamed over the
// target. Readers see either the old file or the new one, never a torn write.
//
// Debouncing is single-flight per path: scheduling a save aborts the
// pending timer for that path and starts a new one. Once a timer fires it
// removes itself from the pending table before writing, so a later
// schedule never aborts a write that is already under way.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::task::{Meta, PersistedState, Task};

/// Default debounce window for automatic saves.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Project name given to files upgraded from the bare-list format.
pub const LEGACY_PROJECT_NAME: &str = "Legacy Project";

const TMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".backup";

/// How a load arrived at its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// An existing `{meta, tasks}` file.
    Existing,
    /// An existing bare task list, wrapped with synthesized metadata.
    Legacy,
    /// No file existed; a default one was written.
    Created,
    /// The file was unreadable; it was copied to `backup` and replaced
    /// with a default one.
    Recovered { backup: PathBuf },
    /// The file could not be read at all; a default snapshot is returned
    /// and nothing was written.
    Unavailable,
}

/// The result of `PersistenceEngine::load`. Loads never fail outright.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub state: PersistedState,
    pub source: LoadSource,
    /// Set when an I/O error was swallowed on the way.
    pub error: Option<String>,
}

struct PendingSave {
    generation: u64,
    handle: JoinHandle<()>,
}

/// File-path-scoped load/save pipeline.
pub struct PersistenceEngine {
    default_project_name: String,
    debounce: Duration,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<HashMap<PathBuf, PendingSave>>,
    generation: AtomicU64,
}

impl PersistenceEngine {
    pub fn new(default_project_name: impl Into<String>, debounce: Duration) -> Self {
        Self {
            default_project_name: default_project_name.into(),
            debounce,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Sibling used for the in-progress write.
    pub fn temp_path(path: &Path) -> PathBuf {
        sibling(path, TMP_SUFFIX)
    }

    /// Sibling holding the previous version of the file.
    pub fn backup_path(path: &Path) -> PathBuf {
        sibling(path, BACKUP_SUFFIX)
    }

    /// Sibling holding an unreadable file, stamped with the current time.
    pub fn corrupt_backup_path(path: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        sibling(path, &format!(".corrupt-{stamp}{BACKUP_SUFFIX}"))
    }

    /// A fresh, empty snapshot for this engine's project.
    pub fn default_state(&self) -> PersistedState {
        PersistedState::empty(self.default_project_name.clone())
    }

    /// Write `state` to `path` atomically, keeping a backup of the old file.
    pub async fn save(&self, path: &Path, state: &PersistedState) -> Result<(), StoreError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(state)?;

        let tmp_path = Self::temp_path(path);
        let mut tmp_file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        tmp_file
            .write_all(json.as_bytes())
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        tmp_file
            .sync_all()
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(tmp_file);

        if fs::try_exists(path).await.unwrap_or(false) {
            let backup = Self::backup_path(path);
            if let Err(e) = fs::copy(path, &backup).await {
                tracing::warn!(
                    path = %backup.display(),
                    error = %e,
                    "could not write backup; continuing with save"
                );
            }
        }

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| StoreError::io(path, e))?;

        tracing::debug!(path = %path.display(), tasks = state.tasks.len(), "task file written");
        Ok(())
    }

    /// Load the snapshot at `path`.
    ///
    /// A missing file is created with defaults. An unparseable file is
    /// copied aside and replaced with defaults, and the parse error is
    /// reported through `LoadOutcome::error` like any other I/O error.
    /// Unknown status strings are not a parse error.
    pub async fn load(&self, path: &Path) -> LoadOutcome {
        let lock = self.lock_for(path);
        let guard = lock.lock().await;

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                drop(guard);
                tracing::info!(path = %path.display(), "no task file found, creating a default one");
                return self.write_default(path, LoadSource::Created).await;
            }
            Err(e) => {
                drop(guard);
                let err = StoreError::io(path, e);
                tracing::warn!(error = %err, "could not read task file, using defaults");
                return LoadOutcome {
                    state: self.default_state(),
                    source: LoadSource::Unavailable,
                    error: Some(err.to_string()),
                };
            }
        };

        let parsed = parse_snapshot(path, &bytes);
        drop(guard);

        match parsed {
            Ok((mut state, source)) => {
                reconcile_counters(&mut state);
                LoadOutcome {
                    state,
                    source,
                    error: None,
                }
            }
            Err(err) => {
                let backup = Self::corrupt_backup_path(path);
                tracing::warn!(
                    error = %err,
                    backup = %backup.display(),
                    "task file is corrupt, preserving a copy and starting fresh"
                );
                let mut problems = vec![err.to_string()];
                if let Err(e) = fs::write(&backup, &bytes).await {
                    problems.push(StoreError::io(&backup, e).to_string());
                }
                let mut outcome = self
                    .write_default(path, LoadSource::Recovered { backup })
                    .await;
                problems.extend(outcome.error.take());
                outcome.error = Some(problems.join("; "));
                outcome
            }
        }
    }

    async fn write_default(&self, path: &Path, source: LoadSource) -> LoadOutcome {
        let state = self.default_state();
        let error = self.save(path, &state).await.err().map(|e| {
            tracing::warn!(error = %e, "could not write default task file");
            e.to_string()
        });
        LoadOutcome {
            state,
            source,
            error,
        }
    }

    /// Run `job` after the debounce window unless another save for `path`
    /// is scheduled first. Returns false when no tokio runtime is available.
    pub fn schedule_save<F>(self: &Arc<Self>, path: &Path, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                path = %path.display(),
                "no async runtime available, automatic save skipped"
            );
            return false;
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = path.to_path_buf();
        let window = self.debounce;
        let engine = Arc::clone(self);

        // The pending table stays locked until the new entry is inserted, so
        // the timer cannot claim its slot before it exists.
        let mut pending = self.pending_table();
        if let Some(previous) = pending.remove(&key) {
            previous.handle.abort();
        }
        let timer_key = key.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if engine.claim_pending(&timer_key, generation) {
                job.await;
            }
        });
        pending.insert(key, PendingSave { generation, handle });
        tracing::debug!(path = %path.display(), generation, "save scheduled");
        true
    }

    /// Cancel the pending save for `path`. Returns whether one was pending.
    pub fn cancel_pending(&self, path: &Path) -> bool {
        match self.pending_table().remove(path) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending save, returning the affected paths.
    pub fn cancel_all(&self) -> Vec<PathBuf> {
        self.pending_table()
            .drain()
            .map(|(path, previous)| {
                previous.handle.abort();
                path
            })
            .collect()
    }

    pub fn has_pending(&self, path: &Path) -> bool {
        self.pending_table().contains_key(path)
    }

    fn claim_pending(&self, path: &Path, generation: u64) -> bool {
        let mut pending = self.pending_table();
        match pending.get(path) {
            Some(entry) if entry.generation == generation => {
                pending.remove(path);
                true
            }
            _ => false,
        }
    }

    fn pending_table(&self) -> MutexGuard<'_, HashMap<PathBuf, PendingSave>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

/// Parse file contents as either `{meta, tasks}` or a legacy bare list.
fn parse_snapshot(path: &Path, bytes: &[u8]) -> Result<(PersistedState, LoadSource), StoreError> {
    let parse_err = |source| StoreError::Parse {
        path: path.display().to_string(),
        source,
    };
    let value: Value = serde_json::from_slice(bytes).map_err(parse_err)?;
    if value.is_array() {
        let tasks: Vec<Task> = serde_json::from_value(value).map_err(parse_err)?;
        let count = tasks.len() as u64;
        let meta = Meta {
            total_tasks_generated: count,
            tasks_included: count,
            ..Meta::new(LEGACY_PROJECT_NAME)
        };
        return Ok((PersistedState { meta, tasks }, LoadSource::Legacy));
    }
    let state: PersistedState = serde_json::from_value(value).map_err(parse_err)?;
    Ok((state, LoadSource::Existing))
}

/// Recompute the counters from the task list. The declared
/// `total_tasks_generated` is kept when it is the larger value.
fn reconcile_counters(state: &mut PersistedState) {
    let included = state.tasks.len() as u64;
    if state.meta.tasks_included != included {
        tracing::debug!(
            declared = state.meta.tasks_included,
            actual = included,
            "tasksIncluded disagrees with the task list, recomputing"
        );
    }
    state.meta.tasks_included = included;
    state.meta.total_tasks_generated = state.meta.total_tasks_generated.max(state.max_task_id());
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tasks.json".to_string());
    path.with_file_name(format!("{name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskStatus;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn engine() -> Arc<PersistenceEngine> {
        Arc::new(PersistenceEngine::new("demo", Duration::from_millis(40)))
    }

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::empty("demo");
        let mut task = Task::new(1, "Write parser");
        task.dependencies = vec![2];
        task.extra
            .insert("complexity".to_string(), Value::from("high"));
        state.tasks.push(task);
        state.tasks.push(Task::new(2, "Write lexer"));
        state.meta.total_tasks_generated = 2;
        state.meta.tasks_included = 2;
        state
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks").join("tasks.json");
        let engine = engine();

        let state = sample_state();
        engine.save(&path, &state).await.unwrap();
        let outcome = engine.load(&path).await;

        assert_eq!(outcome.source, LoadSource::Existing);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.state, state);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_and_backs_up_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let engine = engine();

        engine.save(&path, &PersistedState::empty("first")).await.unwrap();
        assert!(!PersistenceEngine::backup_path(&path).exists());

        engine.save(&path, &sample_state()).await.unwrap();
        assert!(!PersistenceEngine::temp_path(&path).exists());

        let backup = std::fs::read_to_string(PersistenceEngine::backup_path(&path)).unwrap();
        assert!(backup.contains("\"first\""));
        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("Write parser"));
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.json");
        let outcome = engine().load(&path).await;

        assert_eq!(outcome.source, LoadSource::Created);
        assert!(outcome.state.tasks.is_empty());
        assert_eq!(outcome.state.meta.project_name, "demo");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bare_list_is_upgraded_from_legacy_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id": 1, "title": "One"}, {"id": 2, "title": "Two", "status": "done"}]"#,
        )
        .unwrap();

        let outcome = engine().load(&path).await;
        assert_eq!(outcome.source, LoadSource::Legacy);
        assert_eq!(outcome.state.tasks.len(), 2);
        assert_eq!(outcome.state.meta.total_tasks_generated, 2);
        assert_eq!(outcome.state.meta.tasks_included, 2);
        assert_eq!(outcome.state.meta.project_name, LEGACY_PROJECT_NAME);
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "{ not json").unwrap();

        let outcome = engine().load(&path).await;
        let LoadSource::Recovered { backup } = &outcome.source else {
            panic!("expected a recovered load, got {:?}", outcome.source);
        };
        assert!(outcome.state.tasks.is_empty());
        assert!(outcome.error.as_deref().unwrap().starts_with("corrupt task file"));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "{ not json");
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tasks.json.corrupt-"));

        // The target now holds a valid default snapshot.
        let reloaded = engine().load(&path).await;
        assert_eq!(reloaded.source, LoadSource::Existing);
    }

    #[tokio::test]
    async fn unknown_status_loads_instead_of_counting_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id": 1, "title": "a", "status": "done"}, {"id": 2, "title": "b", "status": "blocked"}]"#,
        )
        .unwrap();

        let engine = engine();
        let outcome = engine.load(&path).await;
        assert_eq!(outcome.source, LoadSource::Legacy);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.state.tasks.len(), 2);
        assert_eq!(
            outcome.state.tasks[1].status,
            TaskStatus::Unknown("blocked".to_string())
        );

        engine.save(&path, &outcome.state).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"status\": \"blocked\""));
    }

    #[tokio::test]
    async fn counters_are_recomputed_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{"meta": {"projectName": "p", "totalTasksGenerated": 1, "tasksIncluded": 9},
                "tasks": [{"id": 1, "title": "a"}, {"id": 5, "title": "b"}]}"#,
        )
        .unwrap();

        let outcome = engine().load(&path).await;
        assert_eq!(outcome.state.meta.tasks_included, 2);
        assert_eq!(outcome.state.meta.total_tasks_generated, 5);
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_save() {
        let engine = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0));
        let path = PathBuf::from("/virtual/tasks.json");

        for i in 1..=3 {
            let runs = Arc::clone(&runs);
            let last = Arc::clone(&last);
            assert!(engine.schedule_save(&path, async move {
                runs.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = i;
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.has_pending(&path));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), 3);
        assert!(!engine.has_pending(&path));
    }

    #[tokio::test]
    async fn different_paths_debounce_independently() {
        let engine = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        for name in ["a.json", "b.json"] {
            let runs = Arc::clone(&runs);
            engine.schedule_save(Path::new(name), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_save_never_runs() {
        let engine = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        let path = Path::new("tasks.json");
        let counter = Arc::clone(&runs);
        engine.schedule_save(path, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(engine.cancel_pending(path));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schedule_without_runtime_is_refused() {
        let engine = engine();
        assert!(!engine.schedule_save(Path::new("tasks.json"), async {}));
    }

    #[tokio::test]
    async fn concurrent_saves_on_one_path_serialize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let engine = engine();

        let mut handles = Vec::new();
        for n in 0..8u64 {
            let engine = Arc::clone(&engine);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let mut state = PersistedState::empty("demo");
                state.tasks.push(Task::new(n + 1, format!("task {n}")));
                engine.save(&path, &state).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let outcome = engine.load(&path).await;
        assert_eq!(outcome.source, LoadSource::Existing);
        assert_eq!(outcome.state.tasks.len(), 1);
    }
}
