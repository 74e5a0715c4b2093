//! Core task model: records, errors, resources, handlers, events.

pub mod error;
pub mod event;
pub mod handler;
pub mod resource;
pub mod task;

pub use error::{AppResult, DispatchError, ErrorKind, FieldError, TaskError};
pub use event::{EventBus, TaskEvent};
pub use handler::{validate_args, HandlerRegistry, ParamKind, ParamSchema, TaskHandler};
pub use resource::{ResourceError, ResourceGraph};
pub use task::{Progress, TaskId, TaskRecord, TaskState};
