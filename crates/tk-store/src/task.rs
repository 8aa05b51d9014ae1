// task.rs — Task records, project metadata, and the store snapshot.
//
// A Task carries an ordered list of Subtasks and a set of dependency ids
// pointing at other top-level tasks. Dependencies may name tasks that do
// not exist yet; that is a validator finding, never a write-time error.
//
// Field names serialize as camelCase so existing task files load unchanged.
// Unknown keys are kept in `extra` and written back verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::TaskStatus;

/// How urgent a task is. Used to pick the next task to work on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A top-level task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique positive id, assigned by the store on add.
    pub id: u64,

    /// Human-readable title (required, non-empty).
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub priority: Priority,

    /// Ids of tasks this one depends on.
    #[serde(default)]
    pub dependencies: Vec<u64>,

    #[serde(default)]
    pub subtasks: Vec<Subtask>,

    /// Implementation notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// How the task is to be verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_strategy: Option<String>,

    /// When `status` last changed. Only the state machine and cascade
    /// corrections write this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,

    /// Free-form extension fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// A pending task with no dependencies or subtasks.
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            details: None,
            test_strategy: None,
            status_updated_at: None,
            extra: Map::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// True when the task has at least one subtask and all are done.
    pub fn all_subtasks_done(&self) -> bool {
        !self.subtasks.is_empty() && self.subtasks.iter().all(Subtask::is_done)
    }
}

/// A subtask, scoped to its parent's `subtasks` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Id unique within the parent.
    pub id: u64,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: TaskStatus,

    /// Ids of sibling subtasks this one depends on.
    #[serde(default)]
    pub dependencies: Vec<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Subtask {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            status_updated_at: None,
            extra: Map::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

/// Project-level metadata stored alongside the task list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Meta {
    pub project_name: String,
    pub version: String,
    pub description: String,

    /// Number of tasks ever added. Never decremented.
    pub total_tasks_generated: u64,

    /// Number of tasks currently in the list.
    pub tasks_included: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            project_name: "Taskkeeper Project".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            total_tasks_generated: 0,
            tasks_included: 0,
            created_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }
}

impl Meta {
    /// Fresh metadata for a new project, stamped with the current time.
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            project_name: project_name.into(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            ..Self::default()
        }
    }
}

/// The durable unit: exactly what is written to the task file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedState {
    pub meta: Meta,
    pub tasks: Vec<Task>,
}

impl PersistedState {
    /// An empty task list under fresh metadata.
    pub fn empty(project_name: impl Into<String>) -> Self {
        Self {
            meta: Meta::new(project_name),
            tasks: Vec::new(),
        }
    }

    /// Highest task id in the list, or 0 when empty.
    pub fn max_task_id(&self) -> u64 {
        self.tasks.iter().map(|t| t.id).max().unwrap_or(0)
    }
}

/// The full in-memory snapshot owned by the store.
///
/// `current_task`, `loading`, `error`, and `last_updated` are transient
/// and never reach disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub meta: Meta,
    pub tasks: Vec<Task>,
    pub current_task: Option<u64>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StoreState {
    /// The persistable part of the snapshot.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            meta: self.meta.clone(),
            tasks: self.tasks.clone(),
        }
    }

    pub fn task(&self, id: u64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Input for `TaskStore::add_task`. The id is always assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    /// Defaults to `pending`.
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub dependencies: Vec<u64>,
    pub subtasks: Vec<Subtask>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    pub extra: Map<String, Value>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = u64>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<Subtask>) -> Self {
        self.subtasks = subtasks;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A partial update for `TaskStore::update_task`.
///
/// `None` leaves a field untouched. There is no id field: ids are
/// immutable once assigned.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub dependencies: Option<Vec<u64>>,
    pub subtasks: Option<Vec<Subtask>>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    /// Extension fields to set (merged key by key into `Task::extra`).
    pub extra: Map<String, Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Merge this update over `task`. Status handling is the caller's job:
    /// the status field is applied as-is.
    pub(crate) fn apply_to(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(dependencies) = self.dependencies {
            task.dependencies = dependencies;
        }
        if let Some(subtasks) = self.subtasks {
            task.subtasks = subtasks;
        }
        if let Some(details) = self.details {
            task.details = Some(details);
        }
        if let Some(test_strategy) = self.test_strategy {
            task.test_strategy = Some(test_strategy);
        }
        task.extra.extend(self.extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serializes_camel_case_fields() {
        let mut task = Task::new(1, "Set up repo");
        task.status_updated_at = Some(Utc::now());
        task.test_strategy = Some("cargo test".to_string());
        let json = serde_json::to_string_pretty(&task).unwrap();
        assert!(json.contains("\"statusUpdatedAt\""));
        assert!(json.contains("\"testStrategy\""));
        assert!(!json.contains("\"details\""));
    }

    #[test]
    fn extension_fields_survive_round_trip() {
        let json = r#"{
            "id": 3,
            "title": "Docs",
            "status": "review",
            "complexityScore": 8,
            "owner": {"name": "sam"}
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.status, TaskStatus::Review);
        assert_eq!(task.extra["complexityScore"], 8);
        assert!(task.dependencies.is_empty());

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["owner"]["name"], "sam");
        assert_eq!(back["complexityScore"], 8);
    }

    #[test]
    fn missing_meta_fields_fall_back_to_defaults() {
        let state: PersistedState =
            serde_json::from_str(r#"{"meta": {"projectName": "demo"}, "tasks": []}"#).unwrap();
        assert_eq!(state.meta.project_name, "demo");
        assert_eq!(state.meta.version, "1.0.0");
        assert_eq!(state.meta.total_tasks_generated, 0);
    }

    #[test]
    fn update_merges_only_present_fields() {
        let mut task = Task::new(4, "Old title");
        task.description = "keep me".to_string();
        let mut update = TaskUpdate {
            title: Some("New title".to_string()),
            ..TaskUpdate::default()
        };
        update.extra.insert("estimate".to_string(), Value::from(3));
        update.apply_to(&mut task);

        assert_eq!(task.title, "New title");
        assert_eq!(task.description, "keep me");
        assert_eq!(task.id, 4);
        assert_eq!(task.extra["estimate"], 3);
    }

    #[test]
    fn all_subtasks_done_requires_at_least_one() {
        let mut task = Task::new(1, "Parent");
        assert!(!task.all_subtasks_done());
        let mut sub = Subtask::new(1, "Child");
        sub.status = TaskStatus::Done;
        task.subtasks.push(sub);
        assert!(task.all_subtasks_done());
    }

    #[test]
    fn priority_orders_high_above_low() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
