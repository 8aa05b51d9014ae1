// store_lifecycle.rs — End-to-end tests of a project's task store.
//
// The main test walks a project through its whole life:
//
//   1. Project config enables the event log and a short debounce window
//   2. initialize() creates the missing task file
//   3. Tasks are added, one with subtasks and dependencies
//   4. Tasks move through the status lifecycle; an illegal jump is refused
//   5. Finishing the last subtask cascades the parent to done
//   6. The debounced save lands on disk
//   7. shutdown() flushes and a fresh store reloads the same state
//
// VERIFY:
//   - Ids, counters, and statuses survive the round trip
//   - The event log recorded the lifecycle
//   - The progress export reflects the final state

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;

use tk_store::config::{CONFIG_DIR, CONFIG_FILE};
use tk_store::persistence::LEGACY_PROJECT_NAME;
use tk_store::{
    EventKind, InitializeOptions, LoadSource, NewTask, PersistenceEngine, SetStateOptions,
    StoreError, StoreEvent, StoreObserver, Subtask, TaskStatus, TaskStore, TaskUpdate,
};

#[derive(Default)]
struct ErrorRecorder {
    messages: Mutex<Vec<(String, String)>>,
}

impl StoreObserver for ErrorRecorder {
    fn name(&self) -> &str {
        "error-recorder"
    }

    fn on_event(&self, event: &StoreEvent, _store: &TaskStore) -> Result<(), StoreError> {
        if let StoreEvent::Error(failure) = event {
            self.messages
                .lock()
                .unwrap()
                .push((failure.operation.clone(), failure.message.clone()));
        }
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tk_store=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn project_lifecycle_from_empty_to_reload() {
    init_tracing();

    // =========================================================
    // SETUP: project with a config file
    // =========================================================
    let project = tempdir().unwrap();
    fs::create_dir_all(project.path().join(CONFIG_DIR)).unwrap();
    fs::write(
        project.path().join(CONFIG_DIR).join(CONFIG_FILE),
        "project_name = \"Orbiter\"\ndebounce_ms = 25\nevents_log = \".taskkeeper/events.jsonl\"\n",
    )
    .unwrap();

    let store = TaskStore::for_project(project.path()).unwrap();
    let tasks_file = store.config().tasks_file.clone();
    assert!(!tasks_file.exists());

    // =========================================================
    // STEP 1: initialize creates the task file
    // =========================================================
    let initial = store.initialize(InitializeOptions::default()).await;
    assert!(store.is_initialized());
    assert!(initial.tasks.is_empty());
    assert!(initial.error.is_none());
    assert_eq!(initial.meta.project_name, "Orbiter");
    assert!(tasks_file.exists());

    // =========================================================
    // STEP 2: add tasks
    // =========================================================
    let opts = SetStateOptions::default();
    let schema = store.add_task(NewTask::new("Design schema"), opts).unwrap();
    let loader = store
        .add_task(
            NewTask::new("Build loader")
                .with_dependencies([schema.id])
                .with_subtasks(vec![Subtask::new(1, "Header"), Subtask::new(2, "Body")]),
            opts,
        )
        .unwrap();
    let docs = store
        .add_task(NewTask::new("Write docs").with_dependencies([loader.id]), opts)
        .unwrap();
    assert_eq!((schema.id, loader.id, docs.id), (1, 2, 3));

    let ready: Vec<u64> = store.get_ready_tasks().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![schema.id]);
    assert_eq!(store.next_task().unwrap().id, schema.id);

    // =========================================================
    // STEP 3: walk the lifecycle
    // =========================================================
    assert!(store
        .set_task_status(schema.id, TaskStatus::Done, opts)
        .is_none());
    for status in [TaskStatus::InProgress, TaskStatus::Review, TaskStatus::Done] {
        store.set_task_status(schema.id, status, opts).unwrap();
    }
    assert!(store.get_task_by_id(schema.id).unwrap().is_done());
    assert_eq!(store.next_task().unwrap().id, loader.id);

    // =========================================================
    // STEP 4: finishing every subtask cascades to the parent
    // =========================================================
    store
        .set_task_status(loader.id, TaskStatus::InProgress, opts)
        .unwrap();
    let finished: Vec<Subtask> = store
        .get_task_by_id(loader.id)
        .unwrap()
        .subtasks
        .into_iter()
        .map(|s| Subtask {
            status: TaskStatus::Done,
            ..s
        })
        .collect();
    store
        .update_task(
            loader.id,
            TaskUpdate {
                subtasks: Some(finished),
                ..TaskUpdate::default()
            },
            opts,
        )
        .unwrap();
    assert_eq!(
        store.get_task_by_id(loader.id).unwrap().status,
        TaskStatus::Done
    );
    assert_eq!(store.next_task().unwrap().id, docs.id);

    // =========================================================
    // STEP 5: the debounced save reaches disk
    // =========================================================
    tokio::time::sleep(Duration::from_millis(300)).await;
    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&tasks_file).unwrap()).unwrap();
    assert_eq!(on_disk["tasks"].as_array().unwrap().len(), 3);
    assert_eq!(on_disk["tasks"][1]["status"], "done");
    assert_eq!(on_disk["meta"]["totalTasksGenerated"], 3);
    assert!(PersistenceEngine::backup_path(&tasks_file).exists());

    // =========================================================
    // STEP 6: remove, shut down, reload
    // =========================================================
    assert!(store.remove_task(docs.id, opts));
    store.shutdown().await;
    assert!(!store.is_initialized());

    let reopened = TaskStore::for_project(project.path()).unwrap();
    let reloaded = reopened.initialize(InitializeOptions::default()).await;
    assert_eq!(reloaded.tasks, store.get_tasks());
    assert_eq!(reloaded.meta.tasks_included, 2);
    assert_eq!(reloaded.meta.total_tasks_generated, 3);

    // A removed id is never handed out again.
    let next = reopened
        .add_task(NewTask::new("Release"), SetStateOptions::without_persist())
        .unwrap();
    assert_eq!(next.id, 4);
    reopened.shutdown().await;

    // =========================================================
    // VERIFY: event log and progress export
    // =========================================================
    let log = fs::read_to_string(project.path().join(CONFIG_DIR).join("events.jsonl")).unwrap();
    assert!(log.lines().any(|l| l.contains("\"initialized\"")));
    assert!(log.lines().any(|l| l.contains("\"persisted\"")));
    assert!(log.lines().any(|l| l.contains("\"error\"")));

    let report_path = project.path().join("reports").join("progress.md");
    store.export_progress(&report_path).await.unwrap();
    let report = fs::read_to_string(&report_path).unwrap();
    assert!(report.contains("2/2 tasks done (100%)"));
    assert!(report.contains("  - [x] 2.2 Body"));
}

#[tokio::test]
async fn corrupt_task_file_is_preserved_and_replaced() {
    init_tracing();
    let project = tempdir().unwrap();
    let store = TaskStore::for_project(project.path()).unwrap();
    let tasks_file = store.config().tasks_file.clone();
    let tasks_dir = tasks_file.parent().unwrap().to_path_buf();
    fs::create_dir_all(&tasks_dir).unwrap();
    fs::write(&tasks_file, "{\"meta\": {").unwrap();

    let errors = Arc::new(ErrorRecorder::default());
    store.subscribe(&[EventKind::Error], errors.clone());

    let state = store.initialize(InitializeOptions::default()).await;
    assert!(state.tasks.is_empty());
    assert!(state.error.as_deref().unwrap().contains("corrupt task file"));

    let seen = errors.messages.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "load");
    assert!(seen[0].1.contains("corrupt task file"));

    let backups: Vec<_> = fs::read_dir(&tasks_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().contains(".corrupt-"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "{\"meta\": {");
    store.shutdown().await;

    // The replacement file is valid: a second load reports no error.
    let outcome = store.engine().load(&tasks_file).await;
    assert_eq!(outcome.source, LoadSource::Existing);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn legacy_list_is_upgraded_on_next_save() {
    init_tracing();
    let project = tempdir().unwrap();
    let store = TaskStore::for_project(project.path()).unwrap();
    let tasks_file = store.config().tasks_file.clone();
    fs::create_dir_all(tasks_file.parent().unwrap()).unwrap();
    fs::write(
        &tasks_file,
        r#"[{"id": 1, "title": "Old"}, {"id": 2, "title": "Older", "status": "deferred"}]"#,
    )
    .unwrap();

    let state = store
        .initialize(InitializeOptions {
            builtin_observers: false,
            ..InitializeOptions::default()
        })
        .await;
    assert_eq!(state.meta.project_name, LEGACY_PROJECT_NAME);
    assert_eq!(state.tasks.len(), 2);
    assert_eq!(state.tasks[1].status, TaskStatus::Deferred);

    store.persist_state(None).await.unwrap();
    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&tasks_file).unwrap()).unwrap();
    assert!(on_disk.is_object());
    assert_eq!(on_disk["meta"]["tasksIncluded"], 2);
    assert_eq!(on_disk["tasks"][0]["title"], "Old");
}

#[tokio::test]
async fn explicit_path_override_becomes_active() {
    let project = tempdir().unwrap();
    let store = TaskStore::for_project(project.path()).unwrap();
    let alt = project.path().join("elsewhere").join("plan.json");

    store
        .initialize(InitializeOptions {
            path: Some(alt.clone()),
            builtin_observers: false,
        })
        .await;
    assert_eq!(store.active_path(), alt);
    assert!(alt.exists());
    assert!(!store.config().tasks_file.exists());
}
