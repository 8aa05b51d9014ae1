// config.rs — Store configuration.
//
// StoreConfig decides where the task file lives, how long the debounce
// window is, and whether events are logged to disk. `for_project()` gives
// the conventional layout; `load()` overlays `.taskkeeper/store.toml` when
// the project has one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Directory (under the project root) holding store configuration.
pub const CONFIG_DIR: &str = ".taskkeeper";

/// Config file name inside `CONFIG_DIR`.
pub const CONFIG_FILE: &str = "store.toml";

/// Configuration for a `TaskStore`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Root directory of the project.
    pub project_root: PathBuf,

    /// The task file (default `<root>/tasks/tasks.json`).
    pub tasks_file: PathBuf,

    /// Project name written into freshly created task files.
    pub project_name: String,

    /// Debounce window for automatic saves, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Optional JSONL log of every store event.
    #[serde(default)]
    pub events_log: Option<PathBuf>,
}

/// The on-disk form: every field optional, relative paths allowed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoreConfigFile {
    tasks_file: Option<PathBuf>,
    project_name: Option<String>,
    debounce_ms: Option<u64>,
    events_log: Option<PathBuf>,
}

impl StoreConfig {
    /// Create a config with the standard layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let project_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Taskkeeper Project".to_string());
        Self {
            tasks_file: root.join("tasks").join("tasks.json"),
            project_root: root,
            project_name,
            debounce_ms: default_debounce_ms(),
            events_log: None,
        }
    }

    /// Standard layout overlaid with `<root>/.taskkeeper/store.toml`, if present.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut config = Self::for_project(&project_root);
        let path = config.config_path();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let file: StoreConfigFile = toml::from_str(&content).map_err(|e| StoreError::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if let Some(tasks_file) = file.tasks_file {
            config.tasks_file = config.resolve(tasks_file);
        }
        if let Some(project_name) = file.project_name {
            config.project_name = project_name;
        }
        if let Some(debounce_ms) = file.debounce_ms {
            config.debounce_ms = debounce_ms;
        }
        if let Some(events_log) = file.events_log {
            config.events_log = Some(config.resolve(events_log));
        }

        tracing::debug!(path = %path.display(), "loaded store config");
        Ok(config)
    }

    /// Path of the optional config file.
    pub fn config_path(&self) -> PathBuf {
        self.project_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Enable the JSONL event log at the conventional location.
    pub fn with_event_log(mut self) -> Self {
        self.events_log = Some(self.project_root.join(CONFIG_DIR).join("events.jsonl"));
        self
    }

    pub fn with_tasks_file(mut self, tasks_file: impl AsRef<Path>) -> Self {
        self.tasks_file = self.resolve(tasks_file.as_ref().to_path_buf());
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}
