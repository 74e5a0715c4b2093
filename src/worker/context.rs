//! The context handed to a running task handler.
//!
//! Through it a handler reports progress (pulled by the dispatcher's
//! `get_status` polls), observes abort requests, and decomposes its work into
//! subtasks. Subtasks run in the worker process: they are verified like any
//! task but deliberately bypass the submission queue and admission control,
//! otherwise a child would deadlock against resources its parent already
//! holds. The parent joins them and a child failure surfaces as a regular
//! error in the parent's own execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::TaskError;
use crate::core::handler::{validate_args, HandlerRegistry};
use crate::core::task::{Progress, TaskId, TaskRecord, TaskState};

/// A child task started by a running handler.
#[derive(Debug)]
pub struct SubtaskHandle {
    id: TaskId,
    name: String,
    record: Arc<Mutex<TaskRecord>>,
    join: JoinHandle<()>,
}

impl SubtaskHandle {
    /// Worker-local id of the child.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Current snapshot of the child's record.
    #[must_use]
    pub fn snapshot(&self) -> TaskRecord {
        self.record.lock().clone()
    }

    /// Wait for the child to reach a terminal state.
    ///
    /// `Finished` yields the child's result; `Failed` and `Aborted` come
    /// back as an execution error wrapping the child's own error.
    pub async fn join(self) -> Result<Option<Value>, TaskError> {
        if let Err(join_error) = self.join.await {
            let error = if join_error.is_panic() {
                TaskError::execution(format!("subtask '{}' panicked", self.name))
            } else {
                TaskError::aborted(format!("subtask '{}' was cancelled", self.name))
            };
            let mut record = self.record.lock();
            if !record.state.is_terminal() {
                record.mark_failed(error.clone());
            }
            return Err(error);
        }

        let record = self.record.lock();
        match record.state {
            TaskState::Finished => Ok(record.result.clone()),
            _ => {
                let child_error = record
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::execution("subtask ended without an error record"));
                Err(TaskError::from_subtask(&self.name, &child_error))
            }
        }
    }
}

/// Execution context of one running task inside a worker.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    progress: Arc<Mutex<Option<Progress>>>,
    subtasks: Arc<Mutex<Vec<SubtaskHandle>>>,
    child_ids: Arc<AtomicU64>,
}

impl TaskContext {
    /// Context for task `task_id`, resolving subtask handlers in `registry`.
    ///
    /// `child_ids` allocates worker-local subtask ids; the runtime shares one
    /// allocator across every task it serves.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        registry: Arc<HandlerRegistry>,
        cancel: CancellationToken,
        child_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            task_id,
            registry,
            cancel,
            progress: Arc::new(Mutex::new(None)),
            subtasks: Arc::new(Mutex::new(Vec::new())),
            child_ids,
        }
    }

    /// Id of the task this context belongs to.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Record a progress report. The dispatcher pulls it on its next
    /// `get_status` poll; percent is merged monotonically.
    pub fn report(&self, progress: Progress) {
        let mut slot = self.progress.lock();
        match slot.as_mut() {
            Some(current) => current.merge(&progress),
            None => *slot = Some(progress),
        }
    }

    /// Shorthand for a bare percentage report.
    pub fn report_percent(&self, percent: f64) {
        self.report(Progress::at(percent));
    }

    /// Latest merged progress, if the handler reported any.
    #[must_use]
    pub fn latest_progress(&self) -> Option<Progress> {
        self.progress.lock().clone()
    }

    /// Resolves when an abort has been requested. Abortable handlers await
    /// this alongside their work and stop cooperatively.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether an abort has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start a child task.
    ///
    /// The child is validated and verified like a submitted task, then runs
    /// immediately and concurrently with the parent. Its resource names are
    /// recorded but never admitted against the graph. It shares the parent's
    /// abort signal.
    pub async fn run_subtask(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<TaskId, TaskError> {
        let handler = self.registry.get(name).ok_or_else(|| {
            TaskError::execution(format!("unknown subtask name: {name}"))
        })?;
        validate_args(&handler.schema(), &args)?;

        let child_id = self.child_ids.fetch_add(1, Ordering::Relaxed);
        let mut record = TaskRecord::new_subtask(child_id, name, args.clone(), self.task_id);

        let resources = match handler.verify(&args).await {
            Ok(resources) => resources,
            Err(error) => {
                record.mark_failed(error.clone());
                return Err(TaskError::from_subtask(name, &error));
            }
        };
        record.mark_waiting(resources);
        record.mark_executing();
        debug!(parent = self.task_id, subtask = child_id, task = %name, "subtask started");

        let record = Arc::new(Mutex::new(record));
        let child_ctx = self.child(child_id);
        let run_record = Arc::clone(&record);
        let run_name = name.to_string();
        let join = tokio::spawn(async move {
            let outcome = handler.run(child_ctx, args).await;
            let mut record = run_record.lock();
            match outcome {
                Ok(result) => {
                    record.mark_finished(result);
                }
                Err(error) => {
                    warn!(subtask = record.id, task = %run_name, %error, "subtask failed");
                    if error.kind == crate::core::error::ErrorKind::Aborted {
                        record.mark_aborted(error);
                    } else {
                        record.mark_failed(error);
                    }
                }
            }
        });

        self.subtasks.lock().push(SubtaskHandle {
            id: child_id,
            name: name.to_string(),
            record,
            join,
        });
        Ok(child_id)
    }

    /// Wait for every outstanding subtask.
    ///
    /// All children are joined even when one fails; the first failure is then
    /// propagated. Results come back in spawn order.
    pub async fn join_subtasks(&self) -> Result<Vec<Option<Value>>, TaskError> {
        let handles: Vec<SubtaskHandle> = std::mem::take(&mut *self.subtasks.lock());
        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.join().await {
                Ok(result) => results.push(result),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            None => Ok(results),
            Some(error) => Err(error),
        }
    }

    /// Context for a child task: same registry, same abort signal, same id
    /// allocator, fresh progress and subtask tracking.
    fn child(&self, child_id: TaskId) -> Self {
        Self {
            task_id: child_id,
            registry: Arc::clone(&self.registry),
            cancel: self.cancel.clone(),
            progress: Arc::new(Mutex::new(None)),
            subtasks: Arc::new(Mutex::new(Vec::new())),
            child_ids: Arc::clone(&self.child_ids),
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
