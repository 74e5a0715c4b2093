//! Integration tests for the dispatch engine
//!
//! These tests drive a full balancer with in-process workers and validate:
//! - End-to-end submission, admission, and completion
//! - Hierarchical resource exclusion between ancestors and descendants
//! - Aborting waiting and executing tasks
//! - Subtask decomposition inside a running task
//! - Infrastructure failures and terminal task retention
//! - Event bus ordering

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boatswain::builders::BalancerBuilder;
use boatswain::config::DispatcherConfig;
use boatswain::core::{
    DispatchError, ErrorKind, HandlerRegistry, ParamKind, ParamSchema, TaskError, TaskEvent,
    TaskHandler, TaskId, TaskState,
};
use boatswain::scheduler::{Balancer, TaskFilter};
use boatswain::worker::TaskContext;
use serde_json::{json, Value};
use tokio::sync::watch;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn test_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        initial_workers: workers,
        status_poll_interval_ms: 10,
        abort_grace_ms: 500,
        respawn_delay_ms: 10,
        ..DispatcherConfig::default()
    }
}

async fn wait_for_state(balancer: &Balancer, id: TaskId, state: TaskState) {
    for _ in 0..500 {
        if balancer.status(id).expect("status lookup").state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {state:?}");
}

async fn wait_for_running(rig: &Rig, n: usize) {
    for _ in 0..500 {
        if rig.running.load(Ordering::SeqCst) == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never observed {n} concurrent hold(s)");
}

// ============================================================================
// TEST HANDLERS - Real implementations driving real workers
// ============================================================================

/// Claims the resources named by its arguments and holds them until the test
/// flips the release switch.
struct Hold {
    release: watch::Receiver<bool>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for Hold {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![
            ParamSchema::optional("resource_a", ParamKind::String),
            ParamSchema::optional("resource_b", ParamKind::String),
        ]
    }

    async fn verify(&self, args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(args
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }

    async fn run(&self, _ctx: TaskContext, _args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut release = self.release.clone();
        let released = release.wait_for(|go| *go).await.is_ok();
        self.running.fetch_sub(1, Ordering::SeqCst);
        if released {
            Ok(Some(json!("released")))
        } else {
            Err(TaskError::execution("release channel dropped"))
        }
    }
}

/// Holds until aborted, then winds down cooperatively.
struct AbortableHold {
    release: watch::Receiver<bool>,
}

#[async_trait]
impl TaskHandler for AbortableHold {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![]
    }

    async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![])
    }

    async fn run(&self, ctx: TaskContext, _args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let mut release = self.release.clone();
        tokio::select! {
            () = ctx.cancelled() => Err(TaskError::aborted("wound down cleanly")),
            _ = release.wait_for(|go| *go) => Ok(Some(json!("released"))),
        }
    }

    fn abortable(&self) -> bool {
        true
    }
}

/// Runs forever and refuses cooperative abort.
struct Rigid;

#[async_trait]
impl TaskHandler for Rigid {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![]
    }

    async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![])
    }

    async fn run(&self, _ctx: TaskContext, _args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let () = std::future::pending().await;
        Ok(None)
    }
}

/// Completes immediately, claiming the resources named by its arguments.
struct Quick;

#[async_trait]
impl TaskHandler for Quick {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![
            ParamSchema::optional("resource_a", ParamKind::String),
            ParamSchema::optional("resource_b", ParamKind::String),
        ]
    }

    async fn verify(&self, args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(args
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }

    async fn run(&self, _ctx: TaskContext, _args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        Ok(Some(json!("ok")))
    }
}

/// Rejects any submission whose directive is "reject" at the verify step.
struct Picky;

#[async_trait]
impl TaskHandler for Picky {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![ParamSchema::required("directive", ParamKind::String)]
    }

    async fn verify(&self, args: &[Value]) -> Result<Vec<String>, TaskError> {
        let directive = args[0].as_str().unwrap_or_default();
        if directive == "reject" {
            Err(TaskError::verify("precondition rejected"))
        } else {
            Ok(vec![directive.to_string()])
        }
    }

    async fn run(&self, _ctx: TaskContext, _args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        Ok(Some(json!("verified")))
    }
}

/// Claims a resource, then decomposes into one child task and returns the
/// joined child results.
struct Decompose;

#[async_trait]
impl TaskHandler for Decompose {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![
            ParamSchema::required("resource", ParamKind::String),
            ParamSchema::required("child", ParamKind::String),
            ParamSchema::required("child_arg", ParamKind::String),
        ]
    }

    async fn verify(&self, args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![args[0].as_str().unwrap_or_default().to_string()])
    }

    async fn run(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let child = args[1].as_str().unwrap_or_default().to_string();
        ctx.run_subtask(&child, vec![args[2].clone()]).await?;
        let results = ctx.join_subtasks().await?;
        Ok(Some(json!(results)))
    }
}

// ============================================================================
// TEST RIG
// ============================================================================

struct Rig {
    balancer: Balancer,
    release: watch::Sender<bool>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Rig {
    fn release_all(&self) {
        self.release.send(true).expect("release switch");
    }
}

async fn rig_with(config: DispatcherConfig) -> Rig {
    let (release, release_rx) = watch::channel(false);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "hold",
            Arc::new(Hold {
                release: release_rx.clone(),
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            }),
        )
        .register("abortable_hold", Arc::new(AbortableHold { release: release_rx }))
        .register("rigid", Arc::new(Rigid))
        .register("quick", Arc::new(Quick))
        .register("picky", Arc::new(Picky))
        .register("decompose", Arc::new(Decompose));

    let balancer = BalancerBuilder::new(config, Arc::new(registry))
        .build()
        .expect("failed to start balancer");
    register_topology(&balancer).await;

    Rig {
        balancer,
        release,
        running,
        peak,
    }
}

async fn rig(workers: usize) -> Rig {
    rig_with(test_config(workers)).await
}

/// system -> {pool-a, pool-b}; pool-a -> {disk-a1, disk-a2}; pool-b -> disk-b1
async fn register_topology(balancer: &Balancer) {
    for (name, parents) in [
        ("system", vec![]),
        ("pool-a", vec!["system".to_string()]),
        ("pool-b", vec!["system".to_string()]),
        ("disk-a1", vec!["pool-a".to_string()]),
        ("disk-a2", vec!["pool-a".to_string()]),
        ("disk-b1", vec!["pool-b".to_string()]),
    ] {
        balancer
            .register_resource(name, parents)
            .await
            .expect("register resource");
    }
}

// ============================================================================
// TESTS
// ============================================================================

/// Tasks on disjoint subtrees of the resource graph run at the same time.
#[tokio::test]
async fn disjoint_resources_run_concurrently() {
    let rig = rig(2).await;

    let a = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit a");
    let b = rig
        .balancer
        .submit("hold", vec![json!("disk-b1")], "test")
        .expect("submit b");

    wait_for_running(&rig, 2).await;
    assert_eq!(rig.peak.load(Ordering::SeqCst), 2);

    rig.release_all();
    let settled =
        futures::future::join_all([rig.balancer.wait(a), rig.balancer.wait(b)]).await;
    let done_a = settled[0].as_ref().expect("wait a");
    let done_b = settled[1].as_ref().expect("wait b");
    assert_eq!(done_a.state, TaskState::Finished);
    assert_eq!(done_b.state, TaskState::Finished);
    assert_eq!(done_a.result, Some(json!("released")));

    let stats = rig.balancer.executor_stats().await.expect("stats");
    assert_eq!(stats.len(), 2);
    assert_eq!(stats.iter().map(|s| s.executed).sum::<u64>(), 2);
}

/// A busy ancestor blocks tasks on its descendants, but not on siblings.
#[tokio::test]
async fn busy_ancestor_blocks_descendants() {
    let rig = rig(2).await;

    let holder = rig
        .balancer
        .submit("hold", vec![json!("pool-a")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let blocked = rig
        .balancer
        .submit("quick", vec![json!("disk-a1")], "test")
        .expect("submit blocked");
    let sibling = rig
        .balancer
        .submit("quick", vec![json!("disk-b1")], "test")
        .expect("submit sibling");

    // The sibling pool is unaffected and completes while pool-a is held.
    let done = rig.balancer.wait(sibling).await.expect("wait sibling");
    assert_eq!(done.state, TaskState::Finished);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = rig.balancer.status(blocked).expect("status blocked");
    assert_eq!(status.state, TaskState::Waiting);

    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
    let done = rig.balancer.wait(blocked).await.expect("wait blocked");
    assert_eq!(done.state, TaskState::Finished);
}

/// A busy descendant blocks tasks on its ancestors.
#[tokio::test]
async fn busy_descendant_blocks_ancestors() {
    let rig = rig(2).await;

    let holder = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let blocked = rig
        .balancer
        .submit("quick", vec![json!("pool-a")], "test")
        .expect("submit blocked");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        rig.balancer.status(blocked).expect("status").state,
        TaskState::Waiting
    );

    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
    let done = rig.balancer.wait(blocked).await.expect("wait blocked");
    assert_eq!(done.state, TaskState::Finished);
}

/// Contenders for one resource start in submission order.
#[tokio::test]
async fn contenders_start_in_submission_order() {
    let rig = rig(2).await;
    let mut events = rig.balancer.subscribe();

    let holder = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let first = rig
        .balancer
        .submit("quick", vec![json!("disk-a1")], "test")
        .expect("submit first");
    let second = rig
        .balancer
        .submit("quick", vec![json!("disk-a1")], "test")
        .expect("submit second");

    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
    rig.balancer.wait(first).await.expect("wait first");
    rig.balancer.wait(second).await.expect("wait second");

    let mut execution_order = Vec::new();
    while execution_order.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(TaskEvent::StateChanged {
                id,
                state: TaskState::Executing,
                ..
            })) => execution_order.push(id),
            Ok(Ok(_)) => {}
            other => panic!("event stream ended early: {other:?}"),
        }
    }
    assert_eq!(execution_order, vec![holder, first, second]);
}

/// The slot pool grows on demand past the initial worker count.
#[tokio::test]
async fn a_second_slot_is_created_on_demand() {
    let rig = rig(1).await;

    let a = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit a");
    let b = rig
        .balancer
        .submit("hold", vec![json!("disk-b1")], "test")
        .expect("submit b");

    wait_for_running(&rig, 2).await;
    let stats = rig.balancer.executor_stats().await.expect("stats");
    assert_eq!(stats.len(), 2);

    rig.release_all();
    rig.balancer.wait(a).await.expect("wait a");
    rig.balancer.wait(b).await.expect("wait b");
}

/// Aborting a waiting task settles it without it ever executing.
#[tokio::test]
async fn waiting_task_aborts_immediately() {
    let rig = rig(1).await;

    let holder = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let waiting = rig
        .balancer
        .submit("quick", vec![json!("disk-a1")], "test")
        .expect("submit waiting");
    wait_for_state(&rig.balancer, waiting, TaskState::Waiting).await;

    let record = rig.balancer.abort(waiting).await.expect("abort waiting");
    assert_eq!(record.state, TaskState::Aborted);
    assert!(record.started_at_ms.is_none(), "task must never have started");
    let error = record.error.expect("abort error");
    assert_eq!(error.kind, ErrorKind::Aborted);
    assert!(error.message.contains("aborted by user request"));

    // Terminal tasks cannot be aborted again; unknown ids are rejected.
    let err = rig.balancer.abort(waiting).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyTerminal(_)));
    let err = rig.balancer.abort(9_999).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownTask(_)));

    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
}

/// An abortable handler winds down cooperatively and keeps its own error.
#[tokio::test]
async fn executing_task_aborts_cooperatively() {
    let rig = rig(1).await;

    let id = rig
        .balancer
        .submit("abortable_hold", vec![], "test")
        .expect("submit");
    wait_for_state(&rig.balancer, id, TaskState::Executing).await;

    let record = rig.balancer.abort(id).await.expect("abort");
    assert_eq!(record.state, TaskState::Aborted);
    let error = record.error.expect("abort error");
    assert_eq!(error.kind, ErrorKind::Aborted);
    assert!(error.message.contains("wound down cleanly"));
}

/// A handler that refuses cooperative abort costs its worker, and the slot
/// comes back for the next task.
#[tokio::test]
async fn unabortable_task_is_killed_and_the_slot_recovers() {
    let rig = rig(1).await;

    let id = rig.balancer.submit("rigid", vec![], "test").expect("submit");
    wait_for_state(&rig.balancer, id, TaskState::Executing).await;

    let record = rig.balancer.abort(id).await.expect("abort");
    assert_eq!(record.state, TaskState::Aborted);
    assert!(record
        .error
        .expect("abort error")
        .message
        .contains("aborted by user request"));

    let next = rig.balancer.submit("quick", vec![], "test").expect("submit next");
    let done = rig.balancer.wait(next).await.expect("wait next");
    assert_eq!(done.state, TaskState::Finished);
}

/// A verify rejection fails the task before it touches the resource graph.
#[tokio::test]
async fn verify_rejection_leaves_the_graph_untouched() {
    let rig = rig(2).await;

    let rejected = rig
        .balancer
        .submit("picky", vec![json!("reject")], "test")
        .expect("submit rejected");
    let record = rig.balancer.wait(rejected).await.expect("wait rejected");
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.error.expect("verify error").kind, ErrorKind::Verify);
    assert!(record.resources.is_empty());

    // Everything the rejected task might have named is still available.
    let holder = rig
        .balancer
        .submit("hold", vec![json!("pool-a")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;
    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
}

/// A subtask naming its parent's own held resource runs anyway: children
/// bypass admission, so a parent can decompose work on what it already holds.
#[tokio::test]
async fn subtasks_bypass_admission_for_held_resources() {
    let rig = rig(1).await;

    let id = rig
        .balancer
        .submit(
            "decompose",
            vec![json!("pool-a"), json!("quick"), json!("pool-a")],
            "test",
        )
        .expect("submit");
    let record = rig.balancer.wait(id).await.expect("wait");

    assert_eq!(record.state, TaskState::Finished);
    assert_eq!(record.resources, vec!["pool-a".to_string()]);
    assert_eq!(record.result, Some(json!(["ok"])));
}

/// A failing child surfaces on the parent as an execution error wrapping the
/// child's own error.
#[tokio::test]
async fn child_failure_fails_the_parent() {
    let rig = rig(1).await;

    let id = rig
        .balancer
        .submit(
            "decompose",
            vec![json!("disk-b1"), json!("picky"), json!("reject")],
            "test",
        )
        .expect("submit");
    let record = rig.balancer.wait(id).await.expect("wait");

    assert_eq!(record.state, TaskState::Failed);
    let error = record.error.expect("parent error");
    assert_eq!(error.kind, ErrorKind::Execution);
    assert!(error.message.contains("subtask 'picky' failed"));
    assert!(error.message.contains("precondition rejected"));
    let child: TaskError =
        serde_json::from_value(error.extra.expect("wrapped child")).expect("child error");
    assert_eq!(child.kind, ErrorKind::Verify);
}

/// Naming a resource the graph does not know fails the task as an
/// infrastructure error.
#[tokio::test]
async fn unknown_resource_name_fails_admission() {
    let rig = rig(1).await;

    let id = rig
        .balancer
        .submit("quick", vec![json!("ghost")], "test")
        .expect("submit");
    let record = rig.balancer.wait(id).await.expect("wait");
    assert_eq!(record.state, TaskState::Failed);
    let error = record.error.expect("admission error");
    assert_eq!(error.kind, ErrorKind::Infrastructure);
    assert!(error.message.contains("ghost"));
}

/// Unplugging a resource fails the tasks waiting on it; the holder's later
/// release of the vanished node is a no-op.
#[tokio::test]
async fn removing_a_busy_resource_fails_its_waiters() {
    let rig = rig(2).await;

    let holder = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let waiter = rig
        .balancer
        .submit("quick", vec![json!("disk-a1")], "test")
        .expect("submit waiter");
    wait_for_state(&rig.balancer, waiter, TaskState::Waiting).await;

    rig.balancer
        .unregister_resource("disk-a1")
        .await
        .expect("unregister");
    let record = rig.balancer.wait(waiter).await.expect("wait waiter");
    assert_eq!(record.state, TaskState::Failed);
    let error = record.error.expect("waiter error");
    assert_eq!(error.kind, ErrorKind::Infrastructure);
    assert!(error.message.contains("disk-a1"));

    rig.release_all();
    let done = rig.balancer.wait(holder).await.expect("wait holder");
    assert_eq!(done.state, TaskState::Finished);
}

/// Terminal tasks beyond the retention limit are evicted oldest-first.
#[tokio::test]
async fn terminal_retention_evicts_the_oldest() {
    let config = DispatcherConfig {
        max_terminal_tasks: 2,
        ..test_config(1)
    };
    let rig = rig_with(config).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = rig.balancer.submit("quick", vec![], "test").expect("submit");
        rig.balancer.wait(id).await.expect("wait");
        ids.push(id);
    }

    let err = rig.balancer.status(ids[0]).unwrap_err();
    assert!(matches!(err, DispatchError::UnknownTask(_)));
    assert!(rig.balancer.status(ids[1]).is_ok());
    assert!(rig.balancer.status(ids[2]).is_ok());
}

/// State-change events arrive in lifecycle order, with progress interleaved.
#[tokio::test]
async fn events_follow_the_lifecycle() {
    let rig = rig(1).await;
    let mut events = rig.balancer.subscribe();

    let id = rig.balancer.submit("quick", vec![], "test").expect("submit");
    rig.balancer.wait(id).await.expect("wait");

    let mut states = Vec::new();
    let mut progress_events = 0;
    while states.last() != Some(&TaskState::Finished) {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(TaskEvent::StateChanged { id: event_id, state, .. })) if event_id == id => {
                states.push(state);
            }
            Ok(Ok(TaskEvent::Progress { id: event_id, .. })) if event_id == id => {
                progress_events += 1;
            }
            Ok(Ok(_)) => {}
            other => panic!("event stream ended early: {other:?}"),
        }
    }
    assert_eq!(
        states,
        vec![
            TaskState::Created,
            TaskState::Waiting,
            TaskState::Executing,
            TaskState::Finished,
        ]
    );
    assert!(progress_events >= 1);
}

/// Listing filters on state and handler name.
#[tokio::test]
async fn list_filters_by_state_and_name() {
    let rig = rig(2).await;

    let quick = rig.balancer.submit("quick", vec![], "test").expect("submit quick");
    rig.balancer.wait(quick).await.expect("wait quick");
    let holder = rig
        .balancer
        .submit("hold", vec![json!("disk-a1")], "test")
        .expect("submit holder");
    wait_for_running(&rig, 1).await;

    let finished = rig.balancer.list(&TaskFilter {
        state: Some(TaskState::Finished),
        name: None,
    });
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].id, quick);

    let holds = rig.balancer.list(&TaskFilter {
        state: None,
        name: Some("hold".to_string()),
    });
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].id, holder);

    assert_eq!(rig.balancer.list(&TaskFilter::default()).len(), 2);

    rig.release_all();
    rig.balancer.wait(holder).await.expect("wait holder");
}

/// After shutdown the engine refuses new submissions.
#[tokio::test]
async fn shutdown_stops_the_engine() {
    let rig = rig(1).await;

    let id = rig.balancer.submit("quick", vec![], "test").expect("submit");
    rig.balancer.wait(id).await.expect("wait");
    rig.balancer.shutdown().await.expect("shutdown");

    let mut refused = false;
    for _ in 0..100 {
        if rig.balancer.submit("quick", vec![], "test").is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused, "submissions were still accepted after shutdown");
}
