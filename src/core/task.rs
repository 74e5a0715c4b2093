//! Task model: identifiers, lifecycle states, progress, and persisted records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::TaskError;
use crate::util::clock::now_ms;

/// Unique task identifier.
///
/// Allocated sequentially at submission. After a restart, allocation resumes
/// past the highest id found in the task log, so ids stay unique across runs.
pub type TaskId = u64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted but not yet verified.
    Created,
    /// Verified; queued for resource admission.
    Waiting,
    /// Admitted; running on an executor.
    Executing,
    /// Completed successfully.
    Finished,
    /// Ended with an error.
    Failed,
    /// Stopped on request before completing.
    Aborted,
}

impl TaskState {
    /// Whether the state is terminal. Terminal states absorb every further
    /// transition attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        match self {
            Self::Created => matches!(next, Self::Waiting | Self::Failed | Self::Aborted),
            Self::Waiting => matches!(next, Self::Executing | Self::Failed | Self::Aborted),
            Self::Executing => matches!(next, Self::Finished | Self::Failed | Self::Aborted),
            Self::Finished | Self::Failed | Self::Aborted => false,
        }
    }
}

/// Point-in-time progress of an executing task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion percentage in `[0.0, 100.0]`.
    pub percent: f64,
    /// Operator-facing message, e.g. `"formatting ada0"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Handler-defined structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Progress {
    /// A report at `percent`, clamped to `[0.0, 100.0]`.
    #[must_use]
    pub fn at(percent: f64) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            message: None,
            extra: None,
        }
    }

    /// Attach an operator-facing message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Merge a newer report into this one.
    ///
    /// Readers observe `percent` as non-decreasing: a report that arrives out
    /// of order with a lower percent keeps the recorded value. Message and
    /// detail always follow the newest report that carries them.
    pub fn merge(&mut self, newer: &Self) {
        if newer.percent > self.percent {
            self.percent = newer.percent.clamp(0.0, 100.0);
        }
        if newer.message.is_some() {
            self.message.clone_from(&newer.message);
        }
        if newer.extra.is_some() {
            self.extra.clone_from(&newer.extra);
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::at(0.0)
    }
}

/// The complete, persistable record of a task.
///
/// One record exists per submitted task. The dispatcher owns the canonical
/// copy; the task log holds its durable shadow; API callers receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier.
    pub id: TaskId,
    /// Registered handler name this task runs under.
    pub name: String,
    /// Validated submission arguments, positional. Immutable after
    /// submission; executors receive a clone inside the run descriptor.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Resource names the task holds while executing. Empty until the verify
    /// step computes them.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Parent task id for subtasks; `None` for top-level tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    /// Latest merged progress.
    #[serde(default)]
    pub progress: Progress,
    /// Handler result, present once finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure or abort record, present in `Failed` and `Aborted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Set once an abort has been requested, in any state.
    #[serde(default)]
    pub abort_requested: bool,
    /// Index of the executor slot running the task. Present only while
    /// `Executing`; subtask records, which run inside the parent's worker,
    /// never carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<usize>,
    /// Submission time, ms since epoch.
    pub created_at_ms: u128,
    /// Time execution began, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u128>,
    /// Time a terminal state was reached, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u128>,
}

impl TaskRecord {
    /// A fresh record in `Created`.
    #[must_use]
    pub fn new(id: TaskId, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            state: TaskState::Created,
            resources: Vec::new(),
            parent: None,
            progress: Progress::default(),
            result: None,
            error: None,
            abort_requested: false,
            executor: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    /// A fresh subtask record under `parent`.
    #[must_use]
    pub fn new_subtask(
        id: TaskId,
        name: impl Into<String>,
        args: Vec<Value>,
        parent: TaskId,
    ) -> Self {
        let mut record = Self::new(id, name, args);
        record.parent = Some(parent);
        record
    }

    /// Move `Created -> Waiting` with the verified resource set.
    ///
    /// Returns `false` without modifying the record when the transition is
    /// not legal from the current state.
    pub fn mark_waiting(&mut self, resources: Vec<String>) -> bool {
        if !self.state.can_transition(TaskState::Waiting) {
            return false;
        }
        self.state = TaskState::Waiting;
        self.resources = resources;
        true
    }

    /// Move `Waiting -> Executing` and stamp the start time.
    pub fn mark_executing(&mut self) -> bool {
        if !self.state.can_transition(TaskState::Executing) {
            return false;
        }
        self.state = TaskState::Executing;
        self.started_at_ms = Some(now_ms());
        true
    }

    /// Move to `Finished` with the handler result. Progress snaps to 100%.
    pub fn mark_finished(&mut self, result: Option<Value>) -> bool {
        if !self.state.can_transition(TaskState::Finished) {
            return false;
        }
        self.state = TaskState::Finished;
        self.result = result;
        self.progress.percent = 100.0;
        self.executor = None;
        self.finished_at_ms = Some(now_ms());
        true
    }

    /// Move to `Failed` with the failure record.
    pub fn mark_failed(&mut self, error: TaskError) -> bool {
        if !self.state.can_transition(TaskState::Failed) {
            return false;
        }
        self.state = TaskState::Failed;
        self.error = Some(error);
        self.executor = None;
        self.finished_at_ms = Some(now_ms());
        true
    }

    /// Move to `Aborted` with the abort record.
    pub fn mark_aborted(&mut self, error: TaskError) -> bool {
        if !self.state.can_transition(TaskState::Aborted) {
            return false;
        }
        self.state = TaskState::Aborted;
        self.error = Some(error);
        self.executor = None;
        self.finished_at_ms = Some(now_ms());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn terminal_states_absorb_transitions() {
        for terminal in [TaskState::Finished, TaskState::Failed, TaskState::Aborted] {
            assert!(terminal.is_terminal());
            for next in [
                TaskState::Created,
                TaskState::Waiting,
                TaskState::Executing,
                TaskState::Finished,
                TaskState::Failed,
                TaskState::Aborted,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut task = TaskRecord::new(1, "create_volume", vec![json!({"size_gb": 100})]);
        assert_eq!(task.state, TaskState::Created);

        assert!(task.mark_waiting(vec!["pool:tank".into()]));
        assert_eq!(task.resources, vec!["pool:tank".to_string()]);

        assert!(task.mark_executing());
        task.executor = Some(2);
        assert!(task.started_at_ms.is_some());

        assert!(task.mark_finished(Some(json!({"volume": "tank/vol0"}))));
        assert_eq!(task.state, TaskState::Finished);
        assert!((task.progress.percent - 100.0).abs() < f64::EPSILON);
        assert!(task.finished_at_ms.is_some());
        assert_eq!(task.executor, None);

        // Terminal absorbs the late abort.
        assert!(!task.mark_aborted(TaskError::aborted("too late")));
        assert_eq!(task.state, TaskState::Finished);
        assert!(task.error.is_none());
    }

    #[test]
    fn created_can_fail_directly() {
        let mut task = TaskRecord::new(2, "bad", vec![]);
        assert!(task.mark_failed(TaskError::verify("nope")));
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Verify);
    }

    #[test]
    fn executing_requires_waiting_first() {
        let mut task = TaskRecord::new(3, "skip", vec![]);
        assert!(!task.mark_executing());
        assert_eq!(task.state, TaskState::Created);
    }

    #[test]
    fn progress_percent_never_decreases() {
        let mut progress = Progress::at(40.0).with_message("resilvering");
        progress.merge(&Progress::at(25.0));
        assert!((progress.percent - 40.0).abs() < f64::EPSILON);
        // Newer message still wins even with a stale percent.
        progress.merge(&Progress::at(10.0).with_message("verifying"));
        assert_eq!(progress.message.as_deref(), Some("verifying"));
        progress.merge(&Progress::at(90.0));
        assert!((progress.percent - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_clamps_out_of_range_reports() {
        assert!((Progress::at(150.0).percent - 100.0).abs() < f64::EPSILON);
        assert!(Progress::at(-3.0).percent.abs() < f64::EPSILON);
        let mut progress = Progress::at(10.0);
        progress.merge(&Progress {
            percent: 400.0,
            message: None,
            extra: None,
        });
        assert!((progress.percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut task = TaskRecord::new_subtask(7, "format_disk", vec![json!("ada0")], 3);
        task.mark_waiting(vec!["disk:ada0".into()]);
        task.mark_executing();
        task.mark_failed(TaskError::execution("device reset"));

        let json = serde_json::to_string(&task).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.parent, Some(3));
    }
}
