//! Task handler trait, argument schemas, and the handler registry.
//!
//! A handler is the pluggable business logic behind a task name. The
//! dispatcher uses the handler's schema and `verify` phase; the worker
//! runtime invokes `run`. Both sides hold the same registry, built
//! explicitly at startup rather than resolved by reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::core::error::{FieldError, TaskError};
use crate::worker::context::TaskContext;

/// Expected JSON type of one positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any JSON value, including null.
    Any,
    /// JSON boolean.
    Bool,
    /// JSON integer.
    Int,
    /// Any JSON number.
    Float,
    /// JSON string.
    String,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Float => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Schema of one positional argument, named for field-level error reporting.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    /// Argument name used in validation errors.
    pub name: String,
    /// Expected JSON type.
    pub kind: ParamKind,
    /// Whether the argument must be present and non-null.
    pub required: bool,
}

impl ParamSchema {
    /// A required argument of `kind`.
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// An optional trailing argument of `kind`.
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Validate positional `args` against `schema`.
///
/// Returns a `Validation` error carrying one [`FieldError`] per offending
/// argument. Optional trailing arguments may be omitted or null.
pub fn validate_args(schema: &[ParamSchema], args: &[Value]) -> Result<(), TaskError> {
    let mut fields = Vec::new();
    if args.len() > schema.len() {
        fields.push(FieldError::new(
            "args",
            format!(
                "too many arguments: expected at most {}, got {}",
                schema.len(),
                args.len()
            ),
        ));
    }
    for (position, param) in schema.iter().enumerate() {
        match args.get(position) {
            None | Some(Value::Null) => {
                if param.required {
                    fields.push(FieldError::new(&param.name, "missing required argument"));
                }
            }
            Some(value) => {
                if !param.kind.matches(value) {
                    fields.push(FieldError::new(
                        &param.name,
                        format!("expected {}, got {}", param.kind.name(), json_type_name(value)),
                    ));
                }
            }
        }
    }
    if fields.is_empty() {
        Ok(())
    } else {
        Err(TaskError::validation(
            format!("{} invalid argument(s)", fields.len()),
            fields,
        ))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The pluggable logic behind a task name.
///
/// `verify` runs on the dispatcher inside the distribution step and must be
/// quick; `run` executes in a worker process and may take as long as it
/// needs, reporting progress through the [`TaskContext`].
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use boatswain::core::{ParamKind, ParamSchema, TaskError, TaskHandler};
/// use boatswain::worker::TaskContext;
///
/// struct FormatDisk;
///
/// #[async_trait]
/// impl TaskHandler for FormatDisk {
///     fn schema(&self) -> Vec<ParamSchema> {
///         vec![ParamSchema::required("device", ParamKind::String)]
///     }
///
///     async fn verify(&self, args: &[serde_json::Value]) -> Result<Vec<String>, TaskError> {
///         let device = args[0].as_str().unwrap_or_default();
///         Ok(vec![format!("disk:{device}")])
///     }
///
///     async fn run(
///         &self,
///         ctx: TaskContext,
///         args: Vec<serde_json::Value>,
///     ) -> Result<Option<serde_json::Value>, TaskError> {
///         ctx.report_percent(50.0);
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Declared positional argument schema, checked at submission before a
    /// task record exists.
    fn schema(&self) -> Vec<ParamSchema>;

    /// Precondition check. Returns the resource names the task will hold for
    /// the whole of its execution. An error here fails the task without
    /// touching the resource graph.
    async fn verify(&self, args: &[Value]) -> Result<Vec<String>, TaskError>;

    /// Execute the task. Runs inside a worker process.
    async fn run(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Option<Value>, TaskError>;

    /// Whether `run` honors cooperative cancellation through
    /// [`TaskContext::cancelled`]. Handlers that return `false` make the
    /// worker report an abort request as unsupported, and the dispatcher
    /// falls back to killing the process.
    fn abortable(&self) -> bool {
        false
    }
}

/// Name-indexed table of task handlers, built explicitly at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(task = %name, "handler registration replaced an existing entry");
        }
        self
    }

    /// Look up the handler registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}
