//! The out-of-process worker's half of the control protocol.
//!
//! On launch the runtime connects back to the dispatcher, authenticates with
//! its slot key, then serves run requests one at a time: execute the handler,
//! answer status polls and abort requests while it runs, report the terminal
//! outcome through `put_status`, and wait for the next request. One runtime
//! serves many sequential tasks over its lifetime.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{ErrorKind, TaskError};
use crate::core::handler::HandlerRegistry;
use crate::core::task::TaskId;
use crate::worker::channel::{Connection, DispatcherChannel, IncomingRequest, ReplyHandle};
use crate::worker::context::TaskContext;
use crate::worker::proto::{
    ProtoError, RequestBody, ResponseBody, RunDescriptor, StatusReport, TaskOutcome,
};

/// The task currently being executed, if any.
struct ActiveTask {
    id: TaskId,
    ctx: TaskContext,
    cancel: CancellationToken,
    abortable: bool,
    runner: JoinHandle<()>,
}

/// Worker-side protocol engine.
pub struct WorkerRuntime {
    registry: Arc<HandlerRegistry>,
    key: String,
    call_timeout: Duration,
    child_ids: Arc<AtomicU64>,
}

impl WorkerRuntime {
    /// A runtime authenticating with `key` and resolving handlers in
    /// `registry`.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, key: impl Into<String>) -> Self {
        Self {
            registry,
            key: key.into(),
            call_timeout: Duration::from_secs(10),
            child_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Override the timeout applied to worker-initiated calls.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Serve the dispatcher over `stream` until the connection ends.
    pub async fn serve<S>(&self, stream: S) -> Result<(), ProtoError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_with_shutdown(stream, CancellationToken::new())
            .await
    }

    /// Serve the dispatcher until the connection ends or `shutdown` fires.
    ///
    /// Shutdown is abrupt on purpose: in-flight work is aborted without a
    /// terminal report, exactly like a killed worker process, so the
    /// dispatcher-side slot observes the same failure either way.
    pub async fn serve_with_shutdown<S>(
        &self,
        stream: S,
        shutdown: CancellationToken,
    ) -> Result<(), ProtoError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, mut incoming) = Connection::open(stream);
        let channel = DispatcherChannel::new(conn, self.call_timeout);
        channel.checkin(&self.key, std::process::id()).await?;
        info!(pid = std::process::id(), "worker checked in");

        let active: Arc<Mutex<Option<ActiveTask>>> = Arc::new(Mutex::new(None));

        loop {
            tokio::select! {
                request = incoming.recv() => {
                    match request {
                        Some(request) => self.dispatch(request, &channel, &active),
                        None => {
                            debug!("dispatcher connection ended");
                            break;
                        }
                    }
                }
                () = shutdown.cancelled() => {
                    debug!("worker shutdown requested");
                    break;
                }
            }
        }

        // Connection is gone; orphaned work cannot report anywhere.
        if let Some(active) = active.lock().take() {
            warn!(task = active.id, "abandoning in-flight task");
            active.cancel.cancel();
            active.runner.abort();
        }
        Ok(())
    }

    fn dispatch(
        &self,
        request: IncomingRequest,
        channel: &DispatcherChannel,
        active: &Arc<Mutex<Option<ActiveTask>>>,
    ) {
        match request.body {
            RequestBody::Run { descriptor } => {
                self.handle_run(descriptor, request.reply, channel, active);
            }
            RequestBody::GetStatus => {
                let progress = active.lock().as_ref().and_then(|a| a.ctx.latest_progress());
                request.reply.respond(ResponseBody::Status { progress });
            }
            RequestBody::Abort => {
                let supported = match active.lock().as_ref() {
                    Some(task) if task.abortable => {
                        task.cancel.cancel();
                        true
                    }
                    Some(_) => false,
                    // Nothing running: the terminal report is already on its
                    // way, so the abort is trivially satisfied.
                    None => true,
                };
                request.reply.respond(ResponseBody::AbortAck { supported });
            }
            other => {
                debug!(?other, "unexpected call on worker side");
                request.reply.respond(ResponseBody::Error {
                    message: "unexpected call for a worker".into(),
                });
            }
        }
    }

    fn handle_run(
        &self,
        descriptor: RunDescriptor,
        reply: ReplyHandle,
        channel: &DispatcherChannel,
        active: &Arc<Mutex<Option<ActiveTask>>>,
    ) {
        // Held until the new task is stored, so the runner's cleanup cannot
        // interleave with the busy check.
        let mut slot = active.lock();
        if slot.is_some() {
            reply.respond(ResponseBody::Error {
                message: "executor busy".into(),
            });
            return;
        }
        let Some(handler) = self.registry.get(&descriptor.name) else {
            reply.respond(ResponseBody::Error {
                message: format!("unknown task name: {}", descriptor.name),
            });
            return;
        };

        let RunDescriptor { task_id, name, args } = descriptor;
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(
            task_id,
            Arc::clone(&self.registry),
            cancel.clone(),
            Arc::clone(&self.child_ids),
        );
        let abortable = handler.abortable();
        info!(task = task_id, task_name = %name, "task execution starting");

        let runner_ctx = ctx.clone();
        let runner_channel = channel.clone();
        let runner_active = Arc::clone(active);
        let runner = tokio::spawn(async move {
            let handle = tokio::spawn(async move { handler.run(runner_ctx, args).await });
            let outcome = match handle.await {
                Ok(Ok(result)) => TaskOutcome::Finished { result },
                Ok(Err(error)) if error.kind == ErrorKind::Aborted => {
                    TaskOutcome::Aborted { error }
                }
                Ok(Err(error)) => TaskOutcome::Failed { error },
                Err(join_error) if join_error.is_panic() => TaskOutcome::Failed {
                    error: TaskError::execution("task handler panicked"),
                },
                Err(_) => TaskOutcome::Failed {
                    error: TaskError::execution("task handler was cancelled"),
                },
            };
            match &outcome {
                TaskOutcome::Finished { .. } => info!(task = task_id, "task finished"),
                TaskOutcome::Failed { error } => warn!(task = task_id, %error, "task failed"),
                TaskOutcome::Aborted { error } => info!(task = task_id, %error, "task aborted"),
            }
            // Clear the slot before reporting: the moment the dispatcher
            // learns the outcome it may send the next run.
            runner_active.lock().take();
            let report = StatusReport { task_id, outcome };
            if let Err(error) = runner_channel.put_status(report).await {
                warn!(task = task_id, %error, "failed to deliver terminal status");
            }
        });

        *slot = Some(ActiveTask {
            id: task_id,
            ctx,
            cancel,
            abortable,
            runner,
        });
        reply.respond(ResponseBody::Ok);
    }
}
