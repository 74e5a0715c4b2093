//! Wire protocol of the worker control channel.
//!
//! Frames are newline-delimited JSON over any reliable byte stream. Both
//! sides may issue requests: the dispatcher sends `run`, `get_status` and
//! `abort`; the worker sends `checkin` and `put_status`. Responses are
//! matched to requests by a per-connection id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::TaskError;
use crate::core::task::{Progress, TaskId};

/// Errors produced by control channel operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The connection's event loop has ended (peer gone or stream broken).
    #[error("control channel closed")]
    Closed,
    /// No response arrived within the deadline.
    #[error("control call timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Frame (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer answered with an error response.
    #[error("peer error: {0}")]
    Remote(String),
    /// The peer answered with a response of the wrong shape.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Everything a worker needs to execute one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    /// Dispatcher-issued task id.
    pub task_id: TaskId,
    /// Handler name, resolved in the worker's registry.
    pub name: String,
    /// Positional arguments, cloned from the submitted record.
    pub args: Vec<Value>,
}

/// Terminal outcome reported by a worker via `put_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Handler returned normally.
    Finished {
        /// Handler result, if any.
        result: Option<Value>,
    },
    /// Handler failed.
    Failed {
        /// The structured failure.
        error: TaskError,
    },
    /// Handler observed the abort request and stopped.
    Aborted {
        /// The structured abort record.
        error: TaskError,
    },
}

/// A `put_status` payload: terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Task the report is about.
    pub task_id: TaskId,
    /// The terminal outcome.
    pub outcome: TaskOutcome,
}

/// Request payloads, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RequestBody {
    /// Worker -> dispatcher: authenticate with the slot secret.
    Checkin {
        /// Slot secret handed to the worker at spawn time.
        key: String,
        /// Worker process id, recorded for diagnostics and kills.
        pid: u32,
    },
    /// Dispatcher -> worker: execute a task. Acknowledged immediately; the
    /// terminal outcome arrives later as a `put_status` request.
    Run {
        /// The task to execute.
        descriptor: RunDescriptor,
    },
    /// Dispatcher -> worker: report current progress of the running task.
    GetStatus,
    /// Dispatcher -> worker: request cooperative abort of the running task.
    Abort,
    /// Worker -> dispatcher: terminal outcome of the running task.
    PutStatus {
        /// The outcome report.
        report: StatusReport,
    },
}

/// Response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain acknowledgement.
    Ok,
    /// Reply to `get_status`; `None` when no progress has been reported yet.
    Status {
        /// Latest progress the handler reported.
        progress: Option<Progress>,
    },
    /// Reply to `abort`.
    AbortAck {
        /// Whether the running handler supports cooperative abort.
        supported: bool,
    },
    /// The request could not be served.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// A request carrying a correlation id the response must echo.
    Request {
        /// Per-connection correlation id.
        id: u64,
        /// The call payload.
        body: RequestBody,
    },
    /// A response to a previously received request.
    Response {
        /// Correlation id of the request being answered.
        id: u64,
        /// The reply payload.
        body: ResponseBody,
    },
}

/// Write one frame as a JSON line.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame, or `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtoError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(line.trim_end())?));
    }
}
