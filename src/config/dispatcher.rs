//! Dispatcher configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Task log backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogConfig {
    /// In-memory log for development/testing; nothing survives a restart.
    Memory,
    /// JSON-lines file log used for crash recovery.
    File {
        /// Directory the log file lives in.
        dir: PathBuf,
    },
}

/// How to spawn worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpawnConfig {
    /// Executable to launch for each worker slot.
    pub command: String,
    /// Arguments passed to the worker executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory for the dispatcher's control socket. Defaults to a
    /// per-process temp directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
}

/// Root dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Executor slots created at startup. `0` means one per CPU.
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    /// How long a freshly launched worker has to check in before the launch
    /// is abandoned and retried.
    #[serde(default = "default_checkin_timeout_ms")]
    pub checkin_timeout_ms: u64,
    /// Timeout applied to every control call to a worker (run dispatch,
    /// status poll, abort request).
    #[serde(default = "default_control_call_timeout_ms")]
    pub control_call_timeout_ms: u64,
    /// Interval between progress polls for an in-flight task.
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Grace period after a cooperative abort request before the worker
    /// process is killed.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
    /// Delay before relaunching a worker whose process exited.
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    /// Terminal tasks kept queryable in memory before the oldest are
    /// evicted.
    #[serde(default = "default_max_terminal_tasks")]
    pub max_terminal_tasks: usize,
    /// Event bus capacity per subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Task log backend.
    #[serde(default = "default_task_log")]
    pub task_log: TaskLogConfig,
    /// Worker process spawn settings. Absent means workers run in-process,
    /// which only makes sense for development and tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerSpawnConfig>,
}

const fn default_initial_workers() -> usize {
    2
}
const fn default_checkin_timeout_ms() -> u64 {
    10_000
}
const fn default_control_call_timeout_ms() -> u64 {
    10_000
}
const fn default_status_poll_interval_ms() -> u64 {
    1_000
}
const fn default_abort_grace_ms() -> u64 {
    5_000
}
const fn default_respawn_delay_ms() -> u64 {
    1_000
}
const fn default_max_terminal_tasks() -> usize {
    1_000
}
const fn default_event_capacity() -> usize {
    256
}
const fn default_task_log() -> TaskLogConfig {
    TaskLogConfig::Memory
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            initial_workers: default_initial_workers(),
            checkin_timeout_ms: default_checkin_timeout_ms(),
            control_call_timeout_ms: default_control_call_timeout_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            abort_grace_ms: default_abort_grace_ms(),
            respawn_delay_ms: default_respawn_delay_ms(),
            max_terminal_tasks: default_max_terminal_tasks(),
            event_capacity: default_event_capacity(),
            task_log: default_task_log(),
            worker: None,
        }
    }
}

impl DispatcherConfig {
    /// Slots to create at startup, resolving `0` to the CPU count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.initial_workers == 0 {
            num_cpus::get()
        } else {
            self.initial_workers
        }
    }

    /// Checkin timeout as a [`Duration`].
    #[must_use]
    pub const fn checkin_timeout(&self) -> Duration {
        Duration::from_millis(self.checkin_timeout_ms)
    }

    /// Control call timeout as a [`Duration`].
    #[must_use]
    pub const fn control_call_timeout(&self) -> Duration {
        Duration::from_millis(self.control_call_timeout_ms)
    }

    /// Status poll interval as a [`Duration`].
    #[must_use]
    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Abort grace period as a [`Duration`].
    #[must_use]
    pub const fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Respawn delay as a [`Duration`].
    #[must_use]
    pub const fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.checkin_timeout_ms == 0 {
            return Err("checkin_timeout_ms must be greater than 0".into());
        }
        if self.control_call_timeout_ms == 0 {
            return Err("control_call_timeout_ms must be greater than 0".into());
        }
        if self.status_poll_interval_ms == 0 {
            return Err("status_poll_interval_ms must be greater than 0".into());
        }
        if self.max_terminal_tasks == 0 {
            return Err("max_terminal_tasks must be greater than 0".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".into());
        }
        if let TaskLogConfig::File { dir } = &self.task_log {
            if dir.as_os_str().is_empty() {
                return Err("task_log file dir must not be empty".into());
            }
        }
        if let Some(worker) = &self.worker {
            if worker.command.is_empty() {
                return Err("worker command must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse a dispatcher configuration from a JSON string and validate it.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
