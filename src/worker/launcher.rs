//! Worker launch backends.
//!
//! The dispatcher never cares where a worker lives, only that it connects
//! back and checks in with the slot key it was handed at launch.
//! [`ProcessLauncher`] spawns real worker processes that dial a Unix control
//! socket; [`InProcessLauncher`] runs the worker runtime on a tokio task over
//! an in-memory pipe, which keeps scheduler tests free of process plumbing
//! and doubles as an embedded mode.

use std::collections::HashMap;
#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
#[cfg(unix)]
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
#[cfg(unix)]
use tracing::{info, warn};

#[cfg(unix)]
use crate::config::WorkerSpawnConfig;
use crate::core::error::AppResult;
use crate::core::handler::HandlerRegistry;
use crate::worker::channel::{Connection, IncomingRequest, WorkerChannel};
use crate::worker::proto::{RequestBody, ResponseBody};
use crate::worker::runtime::WorkerRuntime;

/// A live, checked-in worker as seen from the dispatcher side.
#[derive(Debug)]
pub struct WorkerConnection {
    /// Control calls toward the worker (`run`, `get_status`, `abort`).
    pub channel: WorkerChannel,
    /// Worker-initiated calls (`put_status`).
    pub incoming: mpsc::UnboundedReceiver<IncomingRequest>,
    /// The pid the worker reported at checkin.
    pub pid: u32,
}

/// Launches workers for executor slots and tears them down again.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker for `slot` and wait for it to check in.
    async fn launch(&self, slot: usize) -> AppResult<WorkerConnection>;

    /// Forcefully terminate whatever worker is attached to `slot`.
    async fn kill(&self, slot: usize);
}

// ========== Out-of-process workers ==========

/// Spawns worker processes that dial back over a Unix control socket.
///
/// Each launch hands the child a fresh one-time key through the environment
/// (`BOATSWAIN_SOCKET`, `BOATSWAIN_SLOT_KEY`, `BOATSWAIN_SLOT_INDEX`); the
/// shared accept loop routes an incoming checkin to the slot waiting on that
/// key, so a stray connection cannot claim a slot.
#[cfg(unix)]
pub struct ProcessLauncher {
    config: WorkerSpawnConfig,
    socket_path: PathBuf,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<WorkerConnection>>>>,
    children: Mutex<HashMap<usize, Child>>,
    checkin_timeout: Duration,
    #[allow(dead_code)]
    call_timeout: Duration,
    accept_stop: CancellationToken,
}

#[cfg(unix)]
impl ProcessLauncher {
    /// Bind the control socket and start the accept loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        config: WorkerSpawnConfig,
        checkin_timeout: Duration,
        call_timeout: Duration,
    ) -> AppResult<Self> {
        let dir = config
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating socket directory {}", dir.display()))?;
        let socket_path = dir.join(format!("boatswain-{}.sock", uuid::Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding control socket {}", socket_path.display()))?;

        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<WorkerConnection>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let accept_stop = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pending),
            checkin_timeout,
            call_timeout,
            accept_stop.clone(),
        ));
        info!(socket = %socket_path.display(), "worker control socket ready");

        Ok(Self {
            config,
            socket_path,
            pending,
            children: Mutex::new(HashMap::new()),
            checkin_timeout,
            call_timeout,
            accept_stop,
        })
    }

    /// The path worker processes must dial.
    #[must_use]
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    fn reap(&self, slot: usize) {
        let child = self.children.lock().remove(&slot);
        if let Some(mut child) = child {
            debug!(slot, pid = child.id(), "killing worker process");
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, slot: usize) -> AppResult<WorkerConnection> {
        // Replace whatever child may still be attached to this slot.
        self.reap(slot);

        let key = uuid::Uuid::new_v4().to_string();
        let (slot_tx, slot_rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), slot_tx);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("BOATSWAIN_SOCKET", &self.socket_path)
            .env("BOATSWAIN_SLOT_KEY", &key)
            .env("BOATSWAIN_SLOT_INDEX", slot.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let spawned = cmd
            .spawn()
            .with_context(|| format!("spawning worker command {:?}", self.config.command));
        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                self.pending.lock().remove(&key);
                return Err(error);
            }
        };
        relay_output(&mut child, slot);
        info!(slot, pid = child.id(), "worker process spawned");
        self.children.lock().insert(slot, child);

        match tokio::time::timeout(self.checkin_timeout, slot_rx).await {
            Ok(Ok(connection)) => {
                info!(slot, pid = connection.pid, "worker checked in");
                Ok(connection)
            }
            Ok(Err(_)) => {
                self.pending.lock().remove(&key);
                self.reap(slot);
                anyhow::bail!("control socket closed while waiting for checkin")
            }
            Err(_) => {
                self.pending.lock().remove(&key);
                self.reap(slot);
                anyhow::bail!(
                    "worker for slot {slot} did not check in within {:?}",
                    self.checkin_timeout
                )
            }
        }
    }

    async fn kill(&self, slot: usize) {
        self.reap(slot);
    }
}

#[cfg(unix)]
impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        self.accept_stop.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(unix)]
async fn accept_loop(
    listener: UnixListener,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<WorkerConnection>>>>,
    checkin_timeout: Duration,
    call_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(greet(
                        stream,
                        Arc::clone(&pending),
                        checkin_timeout,
                        call_timeout,
                    ));
                }
                Err(error) => {
                    warn!(%error, "control socket accept failed");
                    break;
                }
            },
            () = stop.cancelled() => break,
        }
    }
    debug!("control socket accept loop ended");
}

/// Handshake with one freshly accepted connection: the first frame must be a
/// checkin whose key matches a slot that is waiting for it.
#[cfg(unix)]
async fn greet(
    stream: UnixStream,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<WorkerConnection>>>>,
    checkin_timeout: Duration,
    call_timeout: Duration,
) {
    let (conn, mut incoming) = Connection::open(stream);
    let first = match tokio::time::timeout(checkin_timeout, incoming.recv()).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(_) => {
            warn!("dropping connection that never checked in");
            return;
        }
    };
    match first.body {
        RequestBody::Checkin { key, pid } => {
            let slot_tx = pending.lock().remove(&key);
            let Some(slot_tx) = slot_tx else {
                warn!(pid, "refusing checkin with unknown key");
                first.reply.respond(ResponseBody::Error {
                    message: "unknown slot key".into(),
                });
                return;
            };
            first.reply.respond(ResponseBody::Ok);
            let connection = WorkerConnection {
                channel: WorkerChannel::new(conn, call_timeout),
                incoming,
                pid,
            };
            if slot_tx.send(connection).is_err() {
                debug!(pid, "slot gave up before the checkin completed");
            }
        }
        other => {
            debug!(?other, "first frame was not a checkin");
            first.reply.respond(ResponseBody::Error {
                message: "checkin required".into(),
            });
        }
    }
}

/// Relay a child's stdout/stderr lines into our own log stream.
#[cfg(unix)]
fn relay_output(child: &mut Child, slot: usize) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(slot, "worker: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(slot, "worker: {}", line);
            }
        });
    }
}

// ========== In-process workers ==========

/// Runs each worker as a tokio task talking over an in-memory duplex pipe.
///
/// Protocol-wise this is indistinguishable from a process worker, and
/// [`InProcessLauncher::kill_worker`] stands in for a process death: the
/// runtime is shut down abruptly, in-flight work is abandoned and the
/// dispatcher side observes a closed connection.
pub struct InProcessLauncher {
    registry: Arc<HandlerRegistry>,
    checkin_timeout: Duration,
    call_timeout: Duration,
    slots: Mutex<HashMap<usize, CancellationToken>>,
}

impl InProcessLauncher {
    /// A launcher executing handlers from `registry`.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            checkin_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Override the handshake and control-call timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, checkin: Duration, call: Duration) -> Self {
        self.checkin_timeout = checkin;
        self.call_timeout = call;
        self
    }

    /// Simulate a worker process death for `slot`.
    pub fn kill_worker(&self, slot: usize) {
        let stop = self.slots.lock().remove(&slot);
        if let Some(stop) = stop {
            debug!(slot, "stopping in-process worker");
            stop.cancel();
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, slot: usize) -> AppResult<WorkerConnection> {
        self.kill_worker(slot);

        let key = uuid::Uuid::new_v4().to_string();
        let stop = CancellationToken::new();
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let runtime = WorkerRuntime::new(Arc::clone(&self.registry), key.clone())
            .with_call_timeout(self.call_timeout);
        let worker_stop = stop.clone();
        tokio::spawn(async move {
            if let Err(error) = runtime.serve_with_shutdown(worker_side, worker_stop).await {
                debug!(slot, %error, "in-process worker ended with an error");
            }
        });
        self.slots.lock().insert(slot, stop);

        let (conn, mut incoming) = Connection::open(host_side);
        let first = tokio::time::timeout(self.checkin_timeout, incoming.recv())
            .await
            .map_err(|_| anyhow::anyhow!("in-process worker did not check in"))?
            .ok_or_else(|| anyhow::anyhow!("in-process worker closed before checkin"))?;
        match first.body {
            RequestBody::Checkin { key: presented, pid } if presented == key => {
                first.reply.respond(ResponseBody::Ok);
                Ok(WorkerConnection {
                    channel: WorkerChannel::new(conn, self.call_timeout),
                    incoming,
                    pid,
                })
            }
            other => anyhow::bail!("expected a checkin frame, got {other:?}"),
        }
    }

    async fn kill(&self, slot: usize) {
        self.kill_worker(slot);
    }
}
