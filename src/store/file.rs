//! File-backed task log using JSON lines.
//!
//! Every append and update writes one line; replay keeps the last line seen
//! per task id, so updates never rewrite the file on the hot path. The file
//! is compacted to one line per task when the log is opened and when a record
//! is removed.

use std::collections::BTreeMap;
use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::task::{TaskId, TaskRecord};
use crate::store::{StoreError, TaskLog};

/// Durable task log persisted as a JSON-lines file.
#[derive(Debug)]
pub struct FileTaskLog {
    path: PathBuf,
    // Guards the file across append/update/remove from facade and loop.
    file_lock: Mutex<()>,
}

impl FileTaskLog {
    /// Open (or create) the log at `dir/tasks.jsonl`, compacting it to one
    /// line per task.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        let log = Self {
            path: dir.join("tasks.jsonl"),
            file_lock: Mutex::new(()),
        };
        {
            let _guard = log.file_lock.lock();
            let records = log.replay()?;
            log.rewrite(&records)?;
        }
        Ok(log)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and reduce it to the latest record per id. The caller
    /// holds `file_lock`.
    ///
    /// A line that fails to parse is skipped with a warning rather than
    /// failing the whole load: if the previous process died mid-write the
    /// final line is torn, and recovery must still come up.
    fn replay(&self) -> Result<BTreeMap<TaskId, TaskRecord>, StoreError> {
        let mut records = BTreeMap::new();
        if !self.path.exists() {
            return Ok(records);
        }
        let file = OpenOptions::new().read(true).open(&self.path)?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskRecord>(&line) {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(error) => {
                    warn!(line = lineno + 1, %error, "skipping unreadable task log line");
                }
            }
        }
        Ok(records)
    }

    /// Append one line. The caller holds `file_lock`.
    fn append_line(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Truncate and rewrite the whole file. The caller holds `file_lock`.
    fn rewrite(&self, records: &BTreeMap<TaskId, TaskRecord>) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for record in records.values() {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

impl TaskLog for FileTaskLog {
    fn append(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let _guard = self.file_lock.lock();
        self.append_line(record)
    }

    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let _guard = self.file_lock.lock();
        self.append_line(record)
    }

    fn remove(&self, id: TaskId) -> Result<(), StoreError> {
        let _guard = self.file_lock.lock();
        let mut records = self.replay()?;
        if records.remove(&id).is_some() {
            self.rewrite(&records)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let _guard = self.file_lock.lock();
        Ok(self.replay()?.into_values().collect())
    }
}
