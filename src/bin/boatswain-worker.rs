//! Worker-side entry point spawned by the dispatcher for each executor slot.
//!
//! The dispatcher passes the control socket path and a one-time slot key
//! through the environment. The process dials back, checks in, and serves run
//! requests until the dispatcher closes the connection, then exits so the
//! slot supervisor can respawn it.
//!
//! Ships a small set of diagnostic handlers (`echo`, `sleep`, `fail`) used by
//! smoke tests; appliance builds register their real handlers here instead.
//!
//! # Environment
//!
//! ```bash
//! BOATSWAIN_SOCKET=/run/boatswain/boatswain-<uuid>.sock
//! BOATSWAIN_SLOT_KEY=<one-time-key>
//! BOATSWAIN_SLOT_INDEX=0
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use boatswain::core::error::TaskError;
use boatswain::core::handler::{HandlerRegistry, ParamKind, ParamSchema, TaskHandler};
use boatswain::util::init_worker_tracing;
use boatswain::worker::{TaskContext, WorkerRuntime};

/// Returns its arguments back as the task result.
struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![ParamSchema::optional("payload", ParamKind::Any)]
    }

    async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![])
    }

    async fn run(&self, _ctx: TaskContext, args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        Ok(Some(json!(args)))
    }
}

/// Sleeps in ten slices, reporting progress and honoring abort between them.
struct Sleep;

#[async_trait]
impl TaskHandler for Sleep {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![ParamSchema::required("duration_ms", ParamKind::Int)]
    }

    async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![])
    }

    async fn run(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let total_ms = args[0].as_u64().unwrap_or_default();
        let slice = Duration::from_millis(total_ms) / 10;
        for step in 0..10u32 {
            ctx.report_percent(f64::from(step) * 10.0);
            tokio::select! {
                () = ctx.cancelled() => return Err(TaskError::aborted("sleep interrupted")),
                () = tokio::time::sleep(slice) => {}
            }
        }
        Ok(Some(json!({ "slept_ms": total_ms })))
    }

    fn abortable(&self) -> bool {
        true
    }
}

/// Fails with the supplied message.
struct Fail;

#[async_trait]
impl TaskHandler for Fail {
    fn schema(&self) -> Vec<ParamSchema> {
        vec![ParamSchema::optional("message", ParamKind::String)]
    }

    async fn verify(&self, _args: &[Value]) -> Result<Vec<String>, TaskError> {
        Ok(vec![])
    }

    async fn run(&self, _ctx: TaskContext, args: Vec<Value>) -> Result<Option<Value>, TaskError> {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("task failed on request");
        Err(TaskError::execution(message))
    }
}

fn builtin_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry
        .register("echo", Arc::new(Echo))
        .register("sleep", Arc::new(Sleep))
        .register("fail", Arc::new(Fail));
    Arc::new(registry)
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    dotenvy::dotenv().ok();
    init_worker_tracing();

    let socket = std::env::var("BOATSWAIN_SOCKET").context("BOATSWAIN_SOCKET is not set")?;
    let key = std::env::var("BOATSWAIN_SLOT_KEY").context("BOATSWAIN_SLOT_KEY is not set")?;
    let slot = std::env::var("BOATSWAIN_SLOT_INDEX").unwrap_or_else(|_| "?".into());
    info!(%socket, %slot, pid = std::process::id(), "worker starting");

    // SIGTERM ends the serve loop; the dispatcher sees the connection close
    // and handles it like any other worker death.
    let shutdown = tokio_util::sync::CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let signaled = shutdown.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        info!("SIGTERM received, shutting down");
        signaled.cancel();
    });

    let stream = tokio::net::UnixStream::connect(&socket)
        .await
        .with_context(|| format!("connecting to control socket {socket}"))?;
    WorkerRuntime::new(builtin_registry(), key)
        .serve_with_shutdown(stream, shutdown)
        .await
        .context("serving the dispatcher")?;

    info!("dispatcher closed the connection, exiting");
    Ok(())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("boatswain-worker requires unix domain sockets");
    std::process::exit(1);
}
