//! Task lifecycle events and the broadcast bus observers subscribe to.
//!
//! Every state transition emits a state-change event followed by a progress
//! event; additional progress events flow while a task is executing. The bus
//! is fire-and-forget: emission never blocks the distribution loop, and slow
//! subscribers miss old events rather than applying backpressure.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::task::{Progress, TaskId, TaskState};
use crate::util::clock::now_ms;

/// A lifecycle notification for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The task moved to a new lifecycle state.
    StateChanged {
        /// Task the event is about.
        id: TaskId,
        /// The state just entered.
        state: TaskState,
        /// Emission time, ms since epoch.
        at_ms: u128,
    },
    /// The task reported progress.
    Progress {
        /// Task the event is about.
        id: TaskId,
        /// The merged progress after this report.
        progress: Progress,
        /// Emission time, ms since epoch.
        at_ms: u128,
    },
}

impl TaskEvent {
    /// Task id the event refers to.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::StateChanged { id, .. } | Self::Progress { id, .. } => *id,
        }
    }
}

/// Broadcast fan-out of [`TaskEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// A bus retaining up to `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Open a new subscription. Events emitted before this call are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Emit a state-change event.
    pub fn emit_state(&self, id: TaskId, state: TaskState) {
        let _ = self.tx.send(TaskEvent::StateChanged {
            id,
            state,
            at_ms: now_ms(),
        });
    }

    /// Emit a progress event.
    pub fn emit_progress(&self, id: TaskId, progress: &Progress) {
        let _ = self.tx.send(TaskEvent::Progress {
            id,
            progress: progress.clone(),
            at_ms: now_ms(),
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
