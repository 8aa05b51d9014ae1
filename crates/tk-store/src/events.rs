// events.rs — Store events and the observer registry.
//
// The store publishes a `StoreEvent` after every visible change and after
// every load, save, and failure. Observers subscribe to the event kinds
// they care about; the persistence, logging, validation, and cascade
// policies are all observers, so none of them is wired into the data model.
//
// Observers are called synchronously, in subscription order, with the
// store handle so they can issue corrective writes. Observer errors are
// logged and never stop the remaining observers.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::StoreState;

/// Event names observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Initialized,
    Changed,
    Loaded,
    Persisted,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Initialized,
        EventKind::Changed,
        EventKind::Loaded,
        EventKind::Persisted,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Initialized => "initialized",
            EventKind::Changed => "changed",
            EventKind::Loaded => "loaded",
            EventKind::Persisted => "persisted",
            EventKind::Error => "error",
        }
    }
}

/// A failure reported through the `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    /// What the store was doing, e.g. `"load"` or `"update_task"`.
    pub operation: String,
    pub message: String,
}

impl StoreFailure {
    pub fn new(operation: impl Into<String>, error: &StoreError) -> Self {
        Self {
            operation: operation.into(),
            message: error.to_string(),
        }
    }
}

/// Events published by the store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// `initialize()` finished.
    Initialized(StoreState),
    /// The snapshot changed through a non-silent `set_state`. `persist`
    /// carries the caller's option so observers can honor it.
    Changed { state: StoreState, persist: bool },
    /// A snapshot was loaded from disk.
    Loaded(StoreState),
    /// The snapshot was written to this path.
    Persisted(PathBuf),
    /// Something went wrong; the store carried on.
    Error(StoreFailure),
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StoreEvent::Initialized(_) => EventKind::Initialized,
            StoreEvent::Changed { .. } => EventKind::Changed,
            StoreEvent::Loaded(_) => EventKind::Loaded,
            StoreEvent::Persisted(_) => EventKind::Persisted,
            StoreEvent::Error(_) => EventKind::Error,
        }
    }

    /// Get the event type name as a string.
    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Trait for reacting to store events.
///
/// Implementations may read the store freely. Writes must go through
/// `TaskStore::set_state` with `silent` set, so a correction never
/// re-triggers the observer that made it.
pub trait StoreObserver: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Handle an event. Errors are logged but don't stop the system.
    fn on_event(&self, event: &StoreEvent, store: &TaskStore) -> Result<(), StoreError>;
}

/// Handle returned by `EventBus::subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    observer: Arc<dyn StoreObserver>,
}

/// Registry of observers keyed by event kind.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `observer` to the given event kinds.
    pub fn subscribe(&self, kinds: &[EventKind], observer: Arc<dyn StoreObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kinds: kinds.to_vec(),
                observer,
            });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Observers subscribed to `kind`, in subscription order.
    ///
    /// Returns owned handles so the registry lock is released before any
    /// observer runs.
    pub fn observers_for(&self, kind: EventKind) -> Vec<Arc<dyn StoreObserver>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kinds.contains(&kind))
            .map(|s| Arc::clone(&s.observer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of the JSONL event log.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<&'a StoreFailure>,
}

impl<'a> EventRecord<'a> {
    fn from_event(event: &'a StoreEvent) -> Self {
        let (tasks, path, failure) = match event {
            StoreEvent::Initialized(state)
            | StoreEvent::Changed { state, .. }
            | StoreEvent::Loaded(state) => (Some(state.tasks.len()), None, None),
            StoreEvent::Persisted(path) => (None, Some(path.display().to_string()), None),
            StoreEvent::Error(failure) => (None, None, Some(failure)),
        };
        Self {
            event_type: event.event_type(),
            timestamp: Utc::now(),
            tasks,
            path,
            failure,
        }
    }
}

/// Appends every event as JSONL to a file.
pub struct EventLogObserver {
    path: PathBuf,
}

impl EventLogObserver {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StoreObserver for EventLogObserver {
    fn name(&self) -> &str {
        "event-log"
    }

    fn on_event(&self, event: &StoreEvent, _store: &TaskStore) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        let json = serde_json::to_string(&EventRecord::from_event(event))?;
        writeln!(file, "{}", json).map_err(|e| StoreError::io(&self.path, e))?;

        Ok(())
    }
}
