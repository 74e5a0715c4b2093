//! Error types for the dispatch engine.
//!
//! Two layers of error live here. [`TaskError`] is the serializable record of
//! why a task ended badly: it travels over the worker control channel, is
//! persisted in the task log, and is returned to API callers. [`DispatchError`]
//! covers failures of engine operations themselves (submitting to a stopped
//! engine, asking about an unknown task id, and so on).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a task failure.
///
/// The kind determines which phase of the task lifecycle produced the error
/// and therefore how callers should interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Argument validation against the handler's schema failed. Raised during
    /// submission, before the task is accepted.
    Validation,
    /// The handler's verify step rejected the task.
    Verify,
    /// The handler's run step failed, panicked, or a subtask failed.
    Execution,
    /// The task was aborted on request before completing.
    Aborted,
    /// Engine-level failure outside the handler: a worker died, the control
    /// channel broke, a resource name is unknown, or the dispatcher restarted
    /// with the task in flight.
    Infrastructure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Verify => "verify",
            Self::Execution => "execution",
            Self::Aborted => "aborted",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// A field-level validation problem, reported per offending argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the argument that failed validation.
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl FieldError {
    /// Build a field error for `field` with `message`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The persisted, wire-transportable record of a task failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct TaskError {
    /// Which lifecycle phase produced the failure.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional captured backtrace or remote stack trace, for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    /// Structured context: field errors for validation failures, the wrapped
    /// child error for subtask propagation, or anything a handler attaches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl TaskError {
    /// Build an error of `kind` with `message` and no extra context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stacktrace: None,
            extra: None,
        }
    }

    /// Validation failure carrying per-field problems.
    pub fn validation(message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        let extra = serde_json::to_value(&fields).ok();
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            stacktrace: None,
            extra,
        }
    }

    /// Verify-phase rejection.
    pub fn verify(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Verify, message)
    }

    /// Run-phase failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Abort outcome.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    /// Engine-level failure outside the handler.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message)
    }

    /// Attach a stack trace.
    #[must_use]
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Wrap a child task's error as an execution failure of the parent.
    #[must_use]
    pub fn from_subtask(child_name: &str, child: &Self) -> Self {
        let extra = serde_json::to_value(child).ok();
        Self {
            kind: ErrorKind::Execution,
            message: format!("subtask '{}' failed: {}", child_name, child.message),
            stacktrace: child.stacktrace.clone(),
            extra,
        }
    }
}

/// Errors produced by engine operations, as opposed to task failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered under the submitted task name.
    #[error("unknown task name: {0}")]
    UnknownTaskName(String),
    /// The submitted arguments failed schema validation.
    #[error("invalid arguments for '{name}': {error}")]
    InvalidArguments {
        /// Task name the arguments were submitted for.
        name: String,
        /// The validation failure, including field detail.
        error: TaskError,
    },
    /// No task exists with the given id.
    #[error("unknown task id: {0}")]
    UnknownTask(u64),
    /// The task is already in a terminal state and cannot be aborted.
    #[error("task {0} already terminal")]
    AlreadyTerminal(u64),
    /// The engine has been shut down or its loop has exited.
    #[error("dispatcher is not running")]
    NotRunning,
    /// A resource node operation failed.
    #[error(transparent)]
    Resource(#[from] crate::core::resource::ResourceError),
    /// The task log backend failed.
    #[error("task log error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
