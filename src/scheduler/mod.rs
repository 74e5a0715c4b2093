//! Scheduling: the balancer facade with its single-threaded distribution
//! loop, and the executor slots that drive worker processes.

pub mod balancer;
pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::task::{TaskId, TaskRecord};

pub use balancer::{Balancer, TaskFilter};
pub use executor::ExecutorStats;

/// Shared task table. The distribution loop and the per-slot progress polls
/// are the only writers; everything else takes read snapshots.
pub(crate) type TaskTable = Arc<RwLock<HashMap<TaskId, TaskRecord>>>;
