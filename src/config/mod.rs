//! Configuration models for the dispatcher, workers, and backends.

pub mod dispatcher;

pub use dispatcher::{DispatcherConfig, TaskLogConfig, WorkerSpawnConfig};
