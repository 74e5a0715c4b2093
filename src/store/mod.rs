//! Task log persistence.
//!
//! The log is the durable shadow of the task table: one record per task,
//! appended at creation and updated on every state transition. At startup the
//! dispatcher replays it to fail tasks the previous process left in flight.
//! Query semantics beyond append/update/load are deliberately out of scope.

pub mod file;
pub mod memory;

use thiserror::Error;

use crate::core::task::{TaskId, TaskRecord};

pub use file::FileTaskLog;
pub use memory::MemoryTaskLog;

/// Errors produced by task log backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Record (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append/update key-value log of task records.
///
/// Implementations are internally synchronized: the submission facade appends
/// while the distribution loop updates.
pub trait TaskLog: Send + Sync {
    /// Persist a newly created record.
    fn append(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Persist the current state of an existing record. Appending semantics
    /// are acceptable as long as [`TaskLog::load_all`] yields the latest
    /// version of each record.
    fn update(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Drop the record for `id`, if present. Used by retention eviction.
    fn remove(&self, id: TaskId) -> Result<(), StoreError>;

    /// Load the latest version of every record, ordered by task id.
    fn load_all(&self) -> Result<Vec<TaskRecord>, StoreError>;
}
