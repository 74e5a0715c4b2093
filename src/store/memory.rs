//! In-memory task log for development and testing.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::core::task::{TaskId, TaskRecord};
use crate::store::{StoreError, TaskLog};

/// Task log held entirely in memory. Nothing survives a restart, which also
/// means crash recovery never finds anything to fail.
#[derive(Debug, Default)]
pub struct MemoryTaskLog {
    records: Mutex<BTreeMap<TaskId, TaskRecord>>,
}

impl MemoryTaskLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TaskLog for MemoryTaskLog {
    fn append(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&self, id: TaskId) -> Result<(), StoreError> {
        self.records.lock().remove(&id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TaskError;

    #[test]
    fn load_all_returns_latest_versions_in_id_order() {
        let log = MemoryTaskLog::new();
        let mut a = TaskRecord::new(2, "b", vec![]);
        let b = TaskRecord::new(1, "a", vec![]);
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        a.mark_failed(TaskError::execution("boom"));
        log.update(&a).unwrap();

        let all = log.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 1);
        assert_eq!(all[1].id, 2);
        assert!(all[1].error.is_some());
    }

    #[test]
    fn remove_drops_the_record() {
        let log = MemoryTaskLog::new();
        log.append(&TaskRecord::new(1, "a", vec![])).unwrap();
        log.remove(1).unwrap();
        log.remove(99).unwrap();
        assert!(log.is_empty());
    }
}
