//! The balancer: submission, verification, admission and task resolution.
//!
//! All state decisions happen on one tokio task, the distribution loop, which
//! owns the resource graph and the active list outright. The [`Balancer`]
//! facade validates submissions, hands them to the loop over a command
//! channel, and reads results from the shared task table. Executor slots
//! report terminal outcomes back to the loop over the exit channel, so
//! admission decisions are always made against settled bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::core::error::{DispatchError, TaskError};
use crate::core::event::{EventBus, TaskEvent};
use crate::core::handler::{validate_args, HandlerRegistry};
use crate::core::resource::{ResourceError, ResourceGraph};
use crate::core::task::{TaskId, TaskRecord, TaskState};
use crate::scheduler::executor::{spawn_slot, ExecutorSlot, ExecutorStats, SlotExit};
use crate::scheduler::TaskTable;
use crate::store::TaskLog;
use crate::worker::launcher::WorkerLauncher;
use crate::worker::proto::{RunDescriptor, TaskOutcome};

/// Criteria for [`Balancer::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks currently in this state.
    pub state: Option<TaskState>,
    /// Only tasks submitted under this handler name.
    pub name: Option<String>,
}

impl TaskFilter {
    fn matches(&self, record: &TaskRecord) -> bool {
        self.state.is_none_or(|state| record.state == state)
            && self.name.as_ref().is_none_or(|name| record.name == *name)
    }
}

enum Command {
    Submit(TaskId),
    Abort {
        id: TaskId,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    RegisterResource {
        name: String,
        parents: Vec<String>,
        reply: oneshot::Sender<Result<(), ResourceError>>,
    },
    UnregisterResource {
        name: String,
        reply: oneshot::Sender<Result<(), ResourceError>>,
    },
    Stats {
        reply: oneshot::Sender<Vec<ExecutorStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Task dispatch engine: accepts submissions, admits them against the
/// resource graph and drives them to a terminal state on worker slots.
pub struct Balancer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    tasks: TaskTable,
    events: EventBus,
    registry: Arc<HandlerRegistry>,
    log: Arc<dyn TaskLog>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl Balancer {
    /// Recover persisted tasks, spawn the initial executor slots and start
    /// the distribution loop.
    ///
    /// Any task persisted in a non-terminal state is from a previous run of
    /// this process and is rewritten to `Failed` before new work is accepted.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Arc<DispatcherConfig>,
        registry: Arc<HandlerRegistry>,
        launcher: Arc<dyn WorkerLauncher>,
        log: Arc<dyn TaskLog>,
    ) -> Result<Self, DispatchError> {
        let tasks: TaskTable = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let events = EventBus::new(config.event_capacity);

        // Crash recovery happens before the loop exists, so nothing can race
        // the rewrite.
        let mut max_id = 0;
        let mut terminal_order = VecDeque::new();
        {
            let mut table = tasks.write();
            for mut record in log.load_all()? {
                max_id = max_id.max(record.id);
                if !record.state.is_terminal() {
                    let stale = record.state;
                    record.mark_failed(TaskError::infrastructure("process died"));
                    log.update(&record)?;
                    warn!(
                        task = record.id,
                        was = ?stale,
                        "task from a previous run failed during recovery"
                    );
                }
                terminal_order.push_back(record.id);
                table.insert(record.id, record);
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let mut dispatch = DistributionLoop {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            tasks: Arc::clone(&tasks),
            events: events.clone(),
            log: Arc::clone(&log),
            launcher,
            exit_tx,
            graph: ResourceGraph::new(),
            active: Vec::new(),
            assignments: HashMap::new(),
            slots: Vec::new(),
            terminal_order,
        };
        dispatch.evict_terminal();
        for _ in 0..config.worker_count() {
            dispatch.create_slot();
        }
        info!(
            workers = dispatch.slots.len(),
            recovered = dispatch.terminal_order.len(),
            "balancer started"
        );
        tokio::spawn(dispatch.run(cmd_rx, exit_rx));

        Ok(Self {
            cmd_tx,
            tasks,
            events,
            registry,
            log,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    /// Submit a task for execution and return its id.
    ///
    /// The arguments are checked against the handler's declared schema here;
    /// verification and admission happen later on the distribution loop, and
    /// their failures surface through [`Balancer::status`].
    pub fn submit(
        &self,
        name: &str,
        args: Vec<Value>,
        caller: &str,
    ) -> Result<TaskId, DispatchError> {
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTaskName(name.to_string()))?;
        validate_args(&handler.schema(), &args).map_err(|error| {
            DispatchError::InvalidArguments {
                name: name.to_string(),
                error,
            }
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TaskRecord::new(id, name, args);
        self.log.append(&record)?;
        info!(task = id, task_name = %name, caller, "task submitted");
        self.tasks.write().insert(id, record.clone());
        self.events.emit_state(id, record.state);
        self.events.emit_progress(id, &record.progress);
        self.cmd_tx
            .send(Command::Submit(id))
            .map_err(|_| DispatchError::NotRunning)?;
        Ok(id)
    }

    /// Current record for a task.
    pub fn status(&self, id: TaskId) -> Result<TaskRecord, DispatchError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(DispatchError::UnknownTask(id))
    }

    /// All known tasks matching `filter`, ordered by id.
    #[must_use]
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Abort a task and wait until it settles.
    ///
    /// A task that has not started executing is aborted on the spot; a
    /// running one gets a cooperative abort first and a worker kill if that
    /// is refused or ignored. Either way the returned record is terminal.
    pub async fn abort(&self, id: TaskId) -> Result<TaskRecord, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Abort { id, reply })
            .map_err(|_| DispatchError::NotRunning)?;
        rx.await.map_err(|_| DispatchError::NotRunning)??;
        self.wait(id).await
    }

    /// Block until the task reaches a terminal state and return its record.
    pub async fn wait(&self, id: TaskId) -> Result<TaskRecord, DispatchError> {
        let mut bus = self.events.subscribe();
        loop {
            {
                let tasks = self.tasks.read();
                match tasks.get(&id) {
                    None => return Err(DispatchError::UnknownTask(id)),
                    Some(record) if record.state.is_terminal() => return Ok(record.clone()),
                    Some(_) => {}
                }
            }
            match bus.recv().await {
                Ok(TaskEvent::StateChanged { id: event_id, state, .. })
                    if event_id == id && state.is_terminal() => {}
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DispatchError::NotRunning)
                }
            }
        }
    }

    /// Register a resource node under `name`, depending from `parents`.
    pub async fn register_resource(
        &self,
        name: &str,
        parents: Vec<String>,
    ) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterResource {
                name: name.to_string(),
                parents,
                reply,
            })
            .map_err(|_| DispatchError::NotRunning)?;
        rx.await.map_err(|_| DispatchError::NotRunning)??;
        Ok(())
    }

    /// Remove the resource node under `name`, e.g. after hardware unplug.
    pub async fn unregister_resource(&self, name: &str) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UnregisterResource {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| DispatchError::NotRunning)?;
        rx.await.map_err(|_| DispatchError::NotRunning)??;
        Ok(())
    }

    /// Live event stream of state changes and progress updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every executor slot.
    pub async fn executor_stats(&self) -> Result<Vec<ExecutorStats>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats { reply })
            .map_err(|_| DispatchError::NotRunning)?;
        rx.await.map_err(|_| DispatchError::NotRunning)
    }

    /// Stop the distribution loop and kill all workers.
    ///
    /// In-flight tasks are not drained; they stay persisted as non-terminal
    /// and the next start rewrites them through crash recovery.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply })
            .map_err(|_| DispatchError::NotRunning)?;
        rx.await.map_err(|_| DispatchError::NotRunning)
    }
}

/// Owns the resource graph, the active list and the slots. Everything here
/// runs on one tokio task.
struct DistributionLoop {
    config: Arc<DispatcherConfig>,
    registry: Arc<HandlerRegistry>,
    tasks: TaskTable,
    events: EventBus,
    log: Arc<dyn TaskLog>,
    launcher: Arc<dyn WorkerLauncher>,
    exit_tx: mpsc::UnboundedSender<SlotExit>,
    graph: ResourceGraph,
    /// Verified tasks in submission order, `Waiting` and `Executing` alike.
    active: Vec<TaskId>,
    /// Executing task to slot index.
    assignments: HashMap<TaskId, usize>,
    slots: Vec<ExecutorSlot>,
    /// Terminal tasks in completion order, oldest first, for retention.
    terminal_order: VecDeque<TaskId>,
}

impl DistributionLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut exit_rx: mpsc::UnboundedReceiver<SlotExit>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Submit(id)) => self.distribute(id).await,
                    Some(Command::Abort { id, reply }) => {
                        let _ = reply.send(self.begin_abort(id));
                    }
                    Some(Command::RegisterResource { name, parents, reply }) => {
                        let _ = reply.send(self.graph.add_resource(name, parents));
                    }
                    Some(Command::UnregisterResource { name, reply }) => {
                        let result = self.graph.remove_resource(&name);
                        let _ = reply.send(result);
                        // A removed node may have been the blocker.
                        self.admit();
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.slots.iter().map(ExecutorSlot::stats).collect());
                    }
                    Some(Command::Shutdown { reply }) => {
                        info!("balancer shutting down");
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                exit = exit_rx.recv() => {
                    if let Some(exit) = exit {
                        self.task_exited(exit);
                    }
                }
            }
        }
        for slot in &self.slots {
            slot.stop();
        }
    }

    /// One distribution step: verify the task and run the admission loop.
    async fn distribute(&mut self, id: TaskId) {
        let (name, args, state) = {
            let tasks = self.tasks.read();
            let Some(record) = tasks.get(&id) else {
                return;
            };
            (record.name.clone(), record.args.clone(), record.state)
        };
        // Aborted between submit and here.
        if state != TaskState::Created {
            debug!(task = id, ?state, "skipping distribution for a settled task");
            return;
        }
        let Some(handler) = self.registry.get(&name) else {
            let _ = self.apply_transition(id, |r| {
                r.mark_failed(TaskError::infrastructure(format!(
                    "no handler registered for '{name}'"
                )))
            });
            self.finalize(id);
            return;
        };

        match handler.verify(&args).await {
            Ok(resources) => {
                debug!(task = id, ?resources, "task verified");
                let _ = self.apply_transition(id, |r| r.mark_waiting(resources));
                self.active.push(id);
                self.admit();
            }
            Err(error) => {
                info!(task = id, %error, "task rejected by verify");
                let _ = self.apply_transition(id, |r| r.mark_failed(error));
                self.finalize(id);
            }
        }
    }

    /// Scan waiting tasks in submission order and start every one whose
    /// resources can be acquired. Blocked tasks are skipped, not waited on.
    fn admit(&mut self) {
        let waiting: Vec<(TaskId, Vec<String>)> = {
            let tasks = self.tasks.read();
            self.active
                .iter()
                .filter_map(|id| {
                    tasks
                        .get(id)
                        .filter(|record| record.state == TaskState::Waiting)
                        .map(|record| (*id, record.resources.clone()))
                })
                .collect()
        };
        for (id, resources) in waiting {
            match self.graph.can_acquire(&resources) {
                Ok(true) => {
                    if let Err(error) = self.graph.acquire(&resources) {
                        self.fail_admission(id, &error);
                        continue;
                    }
                    self.start_task(id, &resources);
                }
                Ok(false) => {}
                Err(error) => self.fail_admission(id, &error),
            }
        }
    }

    /// A task whose resource requirements cannot ever be satisfied.
    fn fail_admission(&mut self, id: TaskId, error: &ResourceError) {
        warn!(task = id, %error, "admission refused");
        let _ = self.apply_transition(id, |r| {
            r.mark_failed(TaskError::infrastructure(error.to_string()))
        });
        self.finalize(id);
    }

    /// Assign an admitted task to an idle slot, creating one if necessary.
    fn start_task(&mut self, id: TaskId, resources: &[String]) {
        let slot_index = self.idle_slot().unwrap_or_else(|| self.create_slot());
        let descriptor = {
            let tasks = self.tasks.read();
            let Some(record) = tasks.get(&id) else {
                self.graph.release(resources);
                return;
            };
            RunDescriptor {
                task_id: id,
                name: record.name.clone(),
                args: record.args.clone(),
            }
        };
        if self.slots[slot_index].assign(descriptor) {
            self.assignments.insert(id, slot_index);
            let _ = self.apply_transition(id, |record| {
                if record.mark_executing() {
                    record.executor = Some(slot_index);
                    return true;
                }
                false
            });
            debug!(task = id, slot = slot_index, "task assigned");
        } else {
            warn!(task = id, slot = slot_index, "executor slot unavailable");
            self.graph.release(resources);
            let _ = self.apply_transition(id, |r| {
                r.mark_failed(TaskError::infrastructure("executor slot unavailable"))
            });
            self.finalize(id);
        }
    }

    fn idle_slot(&self) -> Option<usize> {
        (0..self.slots.len()).find(|index| !self.assignments.values().any(|slot| slot == index))
    }

    /// Spawn a new slot; slots are never retired once created.
    fn create_slot(&mut self) -> usize {
        let index = self.slots.len();
        let slot = spawn_slot(
            index,
            Arc::clone(&self.launcher),
            Arc::clone(&self.config),
            Arc::clone(&self.tasks),
            self.events.clone(),
            self.exit_tx.clone(),
        );
        info!(slot = index, "executor slot created");
        self.slots.push(slot);
        index
    }

    fn begin_abort(&mut self, id: TaskId) -> Result<(), DispatchError> {
        let state = self
            .tasks
            .read()
            .get(&id)
            .map(|record| record.state)
            .ok_or(DispatchError::UnknownTask(id))?;
        match state {
            TaskState::Created | TaskState::Waiting => {
                info!(task = id, "aborting task before execution");
                let _ = self.apply_transition(id, |r| {
                    r.abort_requested = true;
                    r.mark_aborted(TaskError::aborted("aborted by user request"))
                });
                self.finalize(id);
                Ok(())
            }
            TaskState::Executing => {
                let snapshot = {
                    let mut tasks = self.tasks.write();
                    tasks.get_mut(&id).map(|record| {
                        record.abort_requested = true;
                        record.clone()
                    })
                };
                if let Some(record) = snapshot {
                    if let Err(error) = self.log.update(&record) {
                        warn!(task = id, %error, "task log update failed");
                    }
                }
                if let Some(slot) = self.assignments.get(&id) {
                    info!(task = id, slot, "abort forwarded to executor");
                    self.slots[*slot].abort(id);
                } else {
                    warn!(task = id, "executing task has no slot assignment");
                }
                Ok(())
            }
            TaskState::Finished | TaskState::Failed | TaskState::Aborted => {
                Err(DispatchError::AlreadyTerminal(id))
            }
        }
    }

    /// Resolve a task from its slot's exit report.
    fn task_exited(&mut self, exit: SlotExit) {
        let SlotExit {
            slot,
            task_id: id,
            outcome,
        } = exit;
        self.assignments.remove(&id);

        let snapshot = {
            let tasks = self.tasks.read();
            tasks
                .get(&id)
                .map(|record| (record.state, record.abort_requested, record.resources.clone()))
        };
        let Some((state, abort_requested, resources)) = snapshot else {
            debug!(task = id, slot, "exit report for an unknown task");
            return;
        };
        if state.is_terminal() {
            debug!(task = id, slot, "exit report for an already terminal task");
            return;
        }

        let applied = if abort_requested {
            let error = match outcome {
                TaskOutcome::Aborted { error } => error,
                TaskOutcome::Finished { .. } | TaskOutcome::Failed { .. } => {
                    TaskError::aborted("aborted by user request")
                }
            };
            self.apply_transition(id, |r| r.mark_aborted(error))
        } else {
            match outcome {
                TaskOutcome::Finished { result } => {
                    self.apply_transition(id, |r| r.mark_finished(result))
                }
                TaskOutcome::Failed { error } => {
                    self.apply_transition(id, |r| r.mark_failed(error))
                }
                TaskOutcome::Aborted { error } => {
                    self.apply_transition(id, |r| r.mark_aborted(error))
                }
            }
        };
        match applied {
            Some(record) => info!(task = id, slot, state = ?record.state, "task exited"),
            None => warn!(task = id, slot, "exit report could not be applied"),
        }

        self.graph.release(&resources);
        self.finalize(id);
        self.admit();
    }

    /// Apply a guarded state mutation, persist it and publish events.
    fn apply_transition(
        &self,
        id: TaskId,
        mutate: impl FnOnce(&mut TaskRecord) -> bool,
    ) -> Option<TaskRecord> {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let record = tasks.get_mut(&id)?;
            if !mutate(record) {
                warn!(task = id, state = ?record.state, "illegal state transition refused");
                return None;
            }
            record.clone()
        };
        if let Err(error) = self.log.update(&snapshot) {
            warn!(task = id, %error, "task log update failed");
        }
        self.events.emit_state(id, snapshot.state);
        self.events.emit_progress(id, &snapshot.progress);
        Some(snapshot)
    }

    /// Bookkeeping common to every terminal transition.
    fn finalize(&mut self, id: TaskId) {
        self.active.retain(|active| *active != id);
        self.assignments.remove(&id);
        self.terminal_order.push_back(id);
        self.evict_terminal();
    }

    /// Drop the oldest terminal records beyond the retention limit.
    fn evict_terminal(&mut self) {
        while self.terminal_order.len() > self.config.max_terminal_tasks {
            let Some(id) = self.terminal_order.pop_front() else {
                break;
            };
            self.tasks.write().remove(&id);
            if let Err(error) = self.log.remove(id) {
                warn!(task = id, %error, "failed to evict task from the log");
            }
            debug!(task = id, "terminal task evicted");
        }
    }
}
