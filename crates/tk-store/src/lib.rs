//! # tk-store
//!
//! File-persisted task state for Taskkeeper.
//!
//! A [`TaskStore`] holds the project's task list and metadata in memory,
//! enforces the task status lifecycle, and keeps a JSON task file in sync
//! through debounced, locked, atomic saves. Side effects (saving, logging,
//! dependency checks, completion cascades) are observers on an event bus
//! rather than code inside the mutators.
//!
//! ## Key components
//!
//! - [`TaskStore`] — the snapshot, its readers and mutators, load/persist
//! - [`TaskStatus`] — the status state machine (pending → in_progress →
//!   review → done, with deferral and reopening)
//! - [`validator`] — cycle, missing-dependency, and completion checks
//! - [`PersistenceEngine`] — per-path locking, atomic rename, debounce
//! - [`EventBus`] / [`StoreObserver`] — change notification
//! - [`observers`] — the built-in observers registered by `initialize`
//! - [`StoreConfig`] — task file location and debounce window

pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod observers;
pub mod persistence;
pub mod status;
pub mod store;
pub mod task;
pub mod validator;

pub use config::StoreConfig;
pub use error::StoreError;
pub use events::{EventBus, EventKind, EventLogObserver, StoreEvent, StoreFailure, StoreObserver, SubscriptionId};
pub use persistence::{LoadOutcome, LoadSource, PersistenceEngine};
pub use status::TaskStatus;
pub use store::{InitializeOptions, SetStateOptions, StatePatch, TaskStore};
pub use task::{Meta, NewTask, PersistedState, Priority, StoreState, Subtask, Task, TaskUpdate};
pub use validator::DependencyReport;
