//! Worker-side execution: the control protocol, the channel machinery on top
//! of it, launch backends, and the runtime that actually runs task handlers.

pub mod channel;
pub mod context;
pub mod launcher;
pub mod proto;
pub mod runtime;

pub use channel::{Connection, DispatcherChannel, IncomingRequest, ReplyHandle, WorkerChannel};
pub use context::{SubtaskHandle, TaskContext};
#[cfg(unix)]
pub use launcher::ProcessLauncher;
pub use launcher::{InProcessLauncher, WorkerConnection, WorkerLauncher};
pub use proto::{
    Frame, ProtoError, RequestBody, ResponseBody, RunDescriptor, StatusReport, TaskOutcome,
};
pub use runtime::WorkerRuntime;
