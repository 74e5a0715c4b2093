//! Executor slots.
//!
//! A slot is a supervisor task that keeps one worker alive: launch, await
//! checkin, serve run assignments, respawn on death. While a task is in
//! flight the slot polls `get_status` at a fixed interval, forwards abort
//! requests, and resolves the task from the worker's `put_status` report or
//! from the connection closing, whichever comes first. Terminal outcomes go
//! back to the scheduler loop over the exit channel; the slot itself never
//! touches task state beyond progress.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::core::error::TaskError;
use crate::core::event::EventBus;
use crate::core::task::{Progress, TaskId};
use crate::scheduler::TaskTable;
use crate::worker::channel::IncomingRequest;
use crate::worker::launcher::{WorkerConnection, WorkerLauncher};
use crate::worker::proto::{ProtoError, RequestBody, ResponseBody, RunDescriptor, TaskOutcome};

/// Point-in-time view of one executor slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Slot index.
    pub slot: usize,
    /// Whether a checked-in worker is currently attached.
    pub alive: bool,
    /// Pid of the most recent worker, if one ever checked in.
    pub pid: Option<u32>,
    /// The task currently dispatched to this slot.
    pub running: Option<TaskId>,
    /// Tasks this slot has driven to a reported outcome.
    pub executed: u64,
    /// Times the slot replaced a dead worker.
    pub respawns: u64,
}

/// Terminal outcome of a dispatched task, reported to the scheduler loop.
#[derive(Debug)]
pub(crate) struct SlotExit {
    pub slot: usize,
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

enum SlotCommand {
    Run(RunDescriptor),
    Abort(TaskId),
}

/// How one dispatched task ended, from the slot's point of view.
enum RunEnd {
    /// The worker reported a terminal outcome and is still alive.
    Reported,
    /// The worker died; the exit has been reported and a respawn is due.
    WorkerDied,
    /// The slot is shutting down.
    Stopped,
}

/// Handle to a running slot supervisor, held by the scheduler loop.
pub(crate) struct ExecutorSlot {
    index: usize,
    cmd_tx: mpsc::UnboundedSender<SlotCommand>,
    shared: Arc<SlotShared>,
    stop: CancellationToken,
}

impl ExecutorSlot {
    /// Slot index.
    #[allow(dead_code)]
    pub(crate) const fn index(&self) -> usize {
        self.index
    }

    /// Hand a task to this slot. Returns false if the supervisor is gone.
    pub(crate) fn assign(&self, descriptor: RunDescriptor) -> bool {
        self.cmd_tx.send(SlotCommand::Run(descriptor)).is_ok()
    }

    /// Forward an abort request for the task this slot is running.
    pub(crate) fn abort(&self, task_id: TaskId) {
        let _ = self.cmd_tx.send(SlotCommand::Abort(task_id));
    }

    /// Stop the supervisor and kill its worker.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn stats(&self) -> ExecutorStats {
        self.shared.snapshot(self.index)
    }
}

/// Create slot `index` and start its supervisor task.
pub(crate) fn spawn_slot(
    index: usize,
    launcher: Arc<dyn WorkerLauncher>,
    config: Arc<DispatcherConfig>,
    tasks: TaskTable,
    events: EventBus,
    exit_tx: mpsc::UnboundedSender<SlotExit>,
) -> ExecutorSlot {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SlotShared::default());
    let stop = CancellationToken::new();
    let supervisor = SlotSupervisor {
        index,
        launcher,
        config,
        tasks,
        events,
        exit_tx,
        shared: Arc::clone(&shared),
        stop: stop.clone(),
    };
    tokio::spawn(supervisor.run(cmd_rx));
    ExecutorSlot {
        index,
        cmd_tx,
        shared,
        stop,
    }
}

#[derive(Default)]
struct SlotShared {
    alive: AtomicBool,
    pid: AtomicU32,
    running: Mutex<Option<TaskId>>,
    executed: AtomicU64,
    respawns: AtomicU64,
}

impl SlotShared {
    fn set_worker(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.pid.store(pid, Ordering::Relaxed);
            self.alive.store(true, Ordering::Relaxed);
        } else {
            self.alive.store(false, Ordering::Relaxed);
        }
    }

    fn snapshot(&self, index: usize) -> ExecutorStats {
        let pid = self.pid.load(Ordering::Relaxed);
        ExecutorStats {
            slot: index,
            alive: self.alive.load(Ordering::Relaxed),
            pid: (pid != 0).then_some(pid),
            running: *self.running.lock(),
            executed: self.executed.load(Ordering::Relaxed),
            respawns: self.respawns.load(Ordering::Relaxed),
        }
    }
}

struct SlotSupervisor {
    index: usize,
    launcher: Arc<dyn WorkerLauncher>,
    config: Arc<DispatcherConfig>,
    tasks: TaskTable,
    events: EventBus,
    exit_tx: mpsc::UnboundedSender<SlotExit>,
    shared: Arc<SlotShared>,
    stop: CancellationToken,
}

impl SlotSupervisor {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<SlotCommand>) {
        loop {
            let Some(mut worker) = self.launch_with_retry().await else {
                break;
            };
            self.shared.set_worker(Some(worker.pid));
            let keep_going = self.serve(&mut worker, &mut cmd_rx).await;
            self.shared.set_worker(None);
            if !keep_going {
                break;
            }
            self.shared.respawns.fetch_add(1, Ordering::Relaxed);
            debug!(slot = self.index, "respawning worker");
            if !self.pause(self.config.respawn_delay()).await {
                break;
            }
        }
        self.launcher.kill(self.index).await;
        self.shared.set_worker(None);
        debug!(slot = self.index, "executor slot stopped");
    }

    /// Sleep for `delay`; false if the slot was stopped meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.stop.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn launch_with_retry(&self) -> Option<WorkerConnection> {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => return None,
                launched = self.launcher.launch(self.index) => match launched {
                    Ok(worker) => return Some(worker),
                    Err(error) => {
                        warn!(slot = self.index, %error, "worker launch failed, retrying");
                        if !self.pause(self.config.respawn_delay()).await {
                            return None;
                        }
                    }
                },
            }
        }
    }

    /// Serve one worker until it dies (true, respawn) or the slot stops
    /// (false).
    async fn serve(
        &self,
        worker: &mut WorkerConnection,
        cmd_rx: &mut mpsc::UnboundedReceiver<SlotCommand>,
    ) -> bool {
        info!(slot = self.index, pid = worker.pid, "executor slot idle");
        loop {
            tokio::select! {
                () = self.stop.cancelled() => return false,
                () = worker.channel.closed() => {
                    warn!(slot = self.index, "worker exited while idle");
                    return true;
                }
                request = worker.incoming.recv() => {
                    match request {
                        Some(request) => self.acknowledge_stray(request),
                        None => return true,
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(SlotCommand::Run(descriptor)) => {
                        let task_id = descriptor.task_id;
                        *self.shared.running.lock() = Some(task_id);
                        let end = self.drive(worker, cmd_rx, descriptor).await;
                        *self.shared.running.lock() = None;
                        match end {
                            RunEnd::Reported => {
                                self.shared.executed.fetch_add(1, Ordering::Relaxed);
                            }
                            RunEnd::WorkerDied => return true,
                            RunEnd::Stopped => return false,
                        }
                    }
                    Some(SlotCommand::Abort(task_id)) => {
                        debug!(slot = self.index, task = task_id, "abort with nothing running");
                    }
                    None => return false,
                },
            }
        }
    }

    /// Drive one dispatched task to an exit report.
    async fn drive(
        &self,
        worker: &mut WorkerConnection,
        cmd_rx: &mut mpsc::UnboundedReceiver<SlotCommand>,
        descriptor: RunDescriptor,
    ) -> RunEnd {
        let task_id = descriptor.task_id;
        match worker.channel.run(descriptor).await {
            Ok(()) => {}
            Err(ProtoError::Remote(message)) => {
                warn!(slot = self.index, task = task_id, %message, "worker rejected the task");
                self.send_exit(
                    task_id,
                    TaskOutcome::Failed {
                        error: TaskError::infrastructure(format!("worker rejected task: {message}")),
                    },
                );
                return RunEnd::Reported;
            }
            Err(error) => {
                warn!(slot = self.index, task = task_id, %error, "run call failed, recycling worker");
                self.launcher.kill(self.index).await;
                self.send_exit(task_id, worker_died_outcome());
                return RunEnd::WorkerDied;
            }
        }
        info!(slot = self.index, task = task_id, pid = worker.pid, "task dispatched");

        let mut poll = tokio::time::interval(self.config.status_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let abort_grace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(abort_grace);
        let mut abort_armed = false;

        loop {
            tokio::select! {
                () = self.stop.cancelled() => return RunEnd::Stopped,
                () = worker.channel.closed() => {
                    warn!(slot = self.index, task = task_id, "worker process exited unexpectedly");
                    self.send_exit(task_id, worker_died_outcome());
                    return RunEnd::WorkerDied;
                }
                request = worker.incoming.recv() => {
                    let Some(request) = request else {
                        warn!(slot = self.index, task = task_id, "worker process exited unexpectedly");
                        self.send_exit(task_id, worker_died_outcome());
                        return RunEnd::WorkerDied;
                    };
                    if let RequestBody::PutStatus { report } = request.body {
                        request.reply.respond(ResponseBody::Ok);
                        if report.task_id == task_id {
                            self.send_exit(task_id, report.outcome);
                            return RunEnd::Reported;
                        }
                        warn!(
                            slot = self.index,
                            task = report.task_id,
                            "status report for a task this slot is not running"
                        );
                    } else {
                        debug!(slot = self.index, "unexpected call from worker");
                        request.reply.respond(ResponseBody::Error {
                            message: "unexpected call for a dispatcher".into(),
                        });
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(SlotCommand::Abort(id)) if id == task_id => {
                        match worker.channel.abort().await {
                            Ok(true) => {
                                info!(slot = self.index, task = task_id, "cooperative abort requested");
                                abort_grace
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + self.config.abort_grace());
                                abort_armed = true;
                            }
                            Ok(false) => {
                                info!(slot = self.index, task = task_id, "handler is not abortable, killing worker");
                                self.launcher.kill(self.index).await;
                            }
                            Err(error) => {
                                warn!(slot = self.index, task = task_id, %error, "abort call failed, killing worker");
                                self.launcher.kill(self.index).await;
                            }
                        }
                    }
                    Some(SlotCommand::Abort(other)) => {
                        debug!(slot = self.index, task = other, "stale abort ignored");
                    }
                    Some(SlotCommand::Run(other)) => {
                        warn!(slot = self.index, task = other.task_id, "run assigned to a busy slot");
                        self.send_exit(
                            other.task_id,
                            TaskOutcome::Failed {
                                error: TaskError::infrastructure("executor slot already busy"),
                            },
                        );
                    }
                    None => return RunEnd::Stopped,
                },
                () = &mut abort_grace, if abort_armed => {
                    warn!(slot = self.index, task = task_id, "abort grace expired, killing worker");
                    abort_armed = false;
                    self.launcher.kill(self.index).await;
                }
                _ = poll.tick() => {
                    match worker.channel.get_status().await {
                        Ok(Some(progress)) => self.record_progress(task_id, progress),
                        Ok(None) => {}
                        Err(ProtoError::Timeout(_)) => {
                            warn!(slot = self.index, task = task_id, "status poll timed out, killing worker");
                            self.launcher.kill(self.index).await;
                        }
                        Err(error) => debug!(slot = self.index, task = task_id, %error, "status poll failed"),
                    }
                }
            }
        }
    }

    /// Merge polled progress into the shared record and publish it.
    fn record_progress(&self, task_id: TaskId, progress: Progress) {
        let snapshot = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(&task_id) {
                Some(record) if !record.state.is_terminal() => {
                    record.progress.merge(&progress);
                    Some(record.progress.clone())
                }
                _ => None,
            }
        };
        if let Some(progress) = snapshot {
            self.events.emit_progress(task_id, &progress);
        }
    }

    fn acknowledge_stray(&self, request: IncomingRequest) {
        if let RequestBody::PutStatus { report } = request.body {
            warn!(
                slot = self.index,
                task = report.task_id,
                "late status report for an already resolved task"
            );
            request.reply.respond(ResponseBody::Ok);
        } else {
            request.reply.respond(ResponseBody::Error {
                message: "unexpected call for a dispatcher".into(),
            });
        }
    }

    fn send_exit(&self, task_id: TaskId, outcome: TaskOutcome) {
        let exit = SlotExit {
            slot: self.index,
            task_id,
            outcome,
        };
        if self.exit_tx.send(exit).is_err() {
            debug!(slot = self.index, task = task_id, "scheduler loop gone, dropping exit report");
        }
    }
}

fn worker_died_outcome() -> TaskOutcome {
    TaskOutcome::Failed {
        error: TaskError::infrastructure("worker process exited unexpectedly"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::handler::{HandlerRegistry, ParamSchema, TaskHandler};
    use crate::core::task::TaskRecord;
    use crate::worker::context::TaskContext;
    use crate::worker::launcher::InProcessLauncher;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    struct Quick;

    #[async_trait]
    impl TaskHandler for Quick {
        fn schema(&self) -> Vec<ParamSchema> {
            vec![]
        }
        async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
            Ok(vec![])
        }
        async fn run(
            &self,
            _ctx: TaskContext,
            _args: Vec<Value>,
        ) -> Result<Option<Value>, TaskError> {
            Ok(Some(json!("done")))
        }
    }

    /// Reports 10%, then waits for a cooperative abort.
    struct Holds;

    #[async_trait]
    impl TaskHandler for Holds {
        fn schema(&self) -> Vec<ParamSchema> {
            vec![]
        }
        async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
            Ok(vec![])
        }
        async fn run(
            &self,
            ctx: TaskContext,
            _args: Vec<Value>,
        ) -> Result<Option<Value>, TaskError> {
            ctx.report_percent(10.0);
            ctx.cancelled().await;
            Err(TaskError::aborted("stopped on request"))
        }
        fn abortable(&self) -> bool {
            true
        }
    }

    /// Claims to be abortable but never honors the request.
    struct Stubborn;

    #[async_trait]
    impl TaskHandler for Stubborn {
        fn schema(&self) -> Vec<ParamSchema> {
            vec![]
        }
        async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
            Ok(vec![])
        }
        async fn run(
            &self,
            _ctx: TaskContext,
            _args: Vec<Value>,
        ) -> Result<Option<Value>, TaskError> {
            std::future::pending::<()>().await;
            Ok(None)
        }
        fn abortable(&self) -> bool {
            true
        }
    }

    struct Rigid;

    #[async_trait]
    impl TaskHandler for Rigid {
        fn schema(&self) -> Vec<ParamSchema> {
            vec![]
        }
        async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
            Ok(vec![])
        }
        async fn run(
            &self,
            _ctx: TaskContext,
            _args: Vec<Value>,
        ) -> Result<Option<Value>, TaskError> {
            std::future::pending::<()>().await;
            Ok(None)
        }
    }

    struct Harness {
        launcher: Arc<InProcessLauncher>,
        slot: ExecutorSlot,
        exit_rx: mpsc::UnboundedReceiver<SlotExit>,
        tasks: TaskTable,
        events: EventBus,
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let mut registry = HandlerRegistry::new();
        registry.register("quick", Arc::new(Quick) as Arc<dyn TaskHandler>);
        registry.register("holds", Arc::new(Holds) as Arc<dyn TaskHandler>);
        registry.register("stubborn", Arc::new(Stubborn) as Arc<dyn TaskHandler>);
        registry.register("rigid", Arc::new(Rigid) as Arc<dyn TaskHandler>);
        let launcher = Arc::new(InProcessLauncher::new(Arc::new(registry)));
        let tasks: TaskTable = Arc::new(RwLock::new(HashMap::new()));
        let events = EventBus::new(64);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let slot = spawn_slot(
            0,
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            Arc::new(config),
            Arc::clone(&tasks),
            events.clone(),
            exit_tx,
        );
        Harness {
            launcher,
            slot,
            exit_rx,
            tasks,
            events,
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            status_poll_interval_ms: 10,
            abort_grace_ms: 100,
            respawn_delay_ms: 10,
            ..DispatcherConfig::default()
        }
    }

    fn descriptor(task_id: TaskId, name: &str) -> RunDescriptor {
        RunDescriptor {
            task_id,
            name: name.into(),
            args: vec![],
        }
    }

    async fn wait_until_running(h: &Harness, task_id: TaskId) {
        while h.slot.stats().running != Some(task_id) || !h.slot.stats().alive {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn reports_outcomes_through_the_exit_channel() {
        let mut h = harness(fast_config());
        assert!(h.slot.assign(descriptor(1, "quick")));
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 1);
        assert_eq!(
            exit.outcome,
            TaskOutcome::Finished {
                result: Some(json!("done"))
            }
        );
        assert_eq!(h.slot.stats().executed, 1);
        h.slot.stop();
    }

    #[tokio::test]
    async fn worker_death_fails_the_task_and_respawns() {
        let mut h = harness(fast_config());
        h.slot.assign(descriptor(7, "rigid"));
        wait_until_running(&h, 7).await;

        h.launcher.kill_worker(0);
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 7);
        match exit.outcome {
            TaskOutcome::Failed { error } => {
                assert_eq!(error.kind, ErrorKind::Infrastructure);
                assert!(error.message.contains("exited unexpectedly"));
            }
            other => panic!("expected an infrastructure failure, got {other:?}"),
        }

        // The slot relaunches and keeps serving.
        h.slot.assign(descriptor(8, "quick"));
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 8);
        assert!(matches!(exit.outcome, TaskOutcome::Finished { .. }));
        assert!(h.slot.stats().respawns >= 1);
        h.slot.stop();
    }

    #[tokio::test]
    async fn cooperative_abort_resolves_aborted() {
        let mut h = harness(fast_config());
        h.slot.assign(descriptor(3, "holds"));
        wait_until_running(&h, 3).await;

        h.slot.abort(3);
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 3);
        assert!(matches!(exit.outcome, TaskOutcome::Aborted { .. }));
        h.slot.stop();
    }

    #[tokio::test]
    async fn abort_grace_expiry_kills_the_worker() {
        let mut h = harness(fast_config());
        h.slot.assign(descriptor(4, "stubborn"));
        wait_until_running(&h, 4).await;

        h.slot.abort(4);
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 4);
        assert!(matches!(exit.outcome, TaskOutcome::Failed { .. }));
        h.slot.stop();
    }

    #[tokio::test]
    async fn unabortable_handler_is_killed_immediately() {
        let mut h = harness(fast_config());
        h.slot.assign(descriptor(5, "rigid"));
        wait_until_running(&h, 5).await;

        h.slot.abort(5);
        let exit = h.exit_rx.recv().await.unwrap();
        assert_eq!(exit.task_id, 5);
        assert!(matches!(exit.outcome, TaskOutcome::Failed { .. }));
        h.slot.stop();
    }

    #[tokio::test]
    async fn progress_polls_update_the_shared_record() {
        let mut h = harness(fast_config());
        let mut record = TaskRecord::new(6, "holds", vec![]);
        record.mark_waiting(vec![]);
        record.mark_executing();
        h.tasks.write().insert(6, record);
        let mut bus = h.events.subscribe();

        h.slot.assign(descriptor(6, "holds"));
        loop {
            let percent = h.tasks.read().get(&6).map(|r| r.progress.percent);
            if percent == Some(10.0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // A progress event was published along the way.
        loop {
            match bus.recv().await.unwrap() {
                crate::core::event::TaskEvent::Progress { id, progress, .. } if id == 6 => {
                    assert!((progress.percent - 10.0).abs() < f64::EPSILON);
                    break;
                }
                _ => {}
            }
        }

        h.slot.abort(6);
        let _ = h.exit_rx.recv().await;
        h.slot.stop();
    }
}
