//! Control channel connection machinery.
//!
//! A [`Connection`] owns its byte stream through a background event loop that
//! multiplexes outbound frames with inbound ones, so neither direction takes
//! a lock on the stream. Responses are matched to pending calls by
//! correlation id; inbound requests are handed to the owner through a channel
//! together with a [`ReplyHandle`].
//!
//! The stream type is generic: production uses a `UnixStream`, tests run the
//! identical machinery over `tokio::io::duplex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::task::Progress;
use crate::worker::proto::{
    read_frame, write_frame, Frame, ProtoError, RequestBody, ResponseBody, RunDescriptor,
    StatusReport,
};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;

/// Handle for answering one inbound request.
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    send_tx: mpsc::UnboundedSender<Frame>,
}

impl ReplyHandle {
    /// Send the response. Errors are ignored: if the connection died the
    /// peer is gone anyway.
    pub fn respond(self, body: ResponseBody) {
        let _ = self.send_tx.send(Frame::Response { id: self.id, body });
    }
}

/// An inbound request together with its reply handle.
#[derive(Debug)]
pub struct IncomingRequest {
    /// The call payload.
    pub body: RequestBody,
    /// Handle the receiver uses to answer.
    pub reply: ReplyHandle,
}

/// One end of a control channel.
#[derive(Debug)]
pub struct Connection {
    send_tx: mpsc::UnboundedSender<Frame>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    /// Take ownership of `stream` and start the event loop.
    ///
    /// Returns the connection and the stream of inbound requests. When the
    /// peer disappears the request stream ends and every pending call
    /// resolves with [`ProtoError::Closed`].
    pub fn open<S>(stream: S) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingRequest>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let conn = Arc::new(Self {
            send_tx: send_tx.clone(),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            closed: closed.clone(),
        });

        // The loop only holds a weak sender, so dropping the Connection and
        // every outstanding ReplyHandle ends the loop and the stream with it.
        let reply_tx = send_tx.downgrade();
        drop(send_tx);
        tokio::spawn(event_loop(
            stream,
            reply_tx,
            send_rx,
            incoming_tx,
            pending,
            closed,
        ));

        (conn, incoming_rx)
    }

    /// Issue a request and await its response.
    pub async fn call(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody, ProtoError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.send_tx.send(Frame::Request { id, body }).is_err() {
            self.pending.lock().remove(&id);
            return Err(ProtoError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ResponseBody::Error { message })) => Err(ProtoError::Remote(message)),
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ProtoError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ProtoError::Timeout(timeout))
            }
        }
    }

    /// Resolves once the event loop has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the event loop has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Owns the stream until the peer or the owner goes away.
///
/// Writes run in their own task: a read in progress is never cancelled to
/// service an outbound frame (dropping a partial `read_line` would lose
/// bytes and desync the stream), and a peer that stops reading cannot stall
/// inbound traffic.
async fn event_loop<S>(
    stream: S,
    reply_tx: mpsc::WeakUnboundedSender<Frame>,
    mut send_rx: mpsc::UnboundedReceiver<Frame>,
    incoming_tx: mpsc::UnboundedSender<IncomingRequest>,
    pending: PendingMap,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // Ends when every sender is gone (Connection and all reply handles
    // dropped) or a write fails.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            if let Err(error) = write_frame(&mut write_half, &frame).await {
                warn!(%error, "control channel write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            inbound = read_frame(&mut reader) => {
                match inbound {
                    Ok(Some(Frame::Response { id, body })) => {
                        let entry = pending.lock().remove(&id);
                        match entry {
                            Some(tx) => {
                                let _ = tx.send(body);
                            }
                            None => debug!(id, "response for unknown call id"),
                        }
                    }
                    Ok(Some(Frame::Request { id, body })) => {
                        let Some(send_tx) = reply_tx.upgrade() else {
                            break;
                        };
                        let request = IncomingRequest {
                            body,
                            reply: ReplyHandle { id, send_tx },
                        };
                        if incoming_tx.send(request).is_err() {
                            debug!(id, "inbound request dropped, receiver gone");
                        }
                    }
                    Ok(None) => {
                        debug!("control channel reached end of stream");
                        break;
                    }
                    Err(error) => {
                        warn!(%error, "control channel read failed");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the write half closes the stream for the peer as well.
    writer.abort();
    closed.cancel();
    // Dropping the senders resolves every pending call with Closed.
    pending.lock().clear();
}

/// Dispatcher-side typed view of a checked-in worker connection.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    conn: Arc<Connection>,
    timeout: Duration,
}

impl WorkerChannel {
    /// Wrap `conn`, applying `timeout` to every call.
    #[must_use]
    pub fn new(conn: Arc<Connection>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Dispatch a task. The ack only means the worker accepted it; the
    /// terminal outcome arrives later as a `put_status` request.
    pub async fn run(&self, descriptor: RunDescriptor) -> Result<(), ProtoError> {
        match self.conn.call(RequestBody::Run { descriptor }, self.timeout).await? {
            ResponseBody::Ok => Ok(()),
            other => Err(ProtoError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Poll the running task's progress.
    pub async fn get_status(&self) -> Result<Option<Progress>, ProtoError> {
        match self.conn.call(RequestBody::GetStatus, self.timeout).await? {
            ResponseBody::Status { progress } => Ok(progress),
            other => Err(ProtoError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Request cooperative abort. Returns whether the handler supports it.
    pub async fn abort(&self) -> Result<bool, ProtoError> {
        match self.conn.call(RequestBody::Abort, self.timeout).await? {
            ResponseBody::AbortAck { supported } => Ok(supported),
            other => Err(ProtoError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Resolves once the underlying connection has ended.
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// Whether the underlying connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

/// Worker-side typed view of the dispatcher connection.
#[derive(Debug, Clone)]
pub struct DispatcherChannel {
    conn: Arc<Connection>,
    timeout: Duration,
}

impl DispatcherChannel {
    /// Wrap `conn`, applying `timeout` to every call.
    #[must_use]
    pub fn new(conn: Arc<Connection>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Authenticate this worker against its slot.
    pub async fn checkin(&self, key: &str, pid: u32) -> Result<(), ProtoError> {
        let body = RequestBody::Checkin {
            key: key.to_string(),
            pid,
        };
        match self.conn.call(body, self.timeout).await? {
            ResponseBody::Ok => Ok(()),
            other => Err(ProtoError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Deliver a terminal outcome report.
    pub async fn put_status(&self, report: StatusReport) -> Result<(), ProtoError> {
        match self
            .conn
            .call(RequestBody::PutStatus { report }, self.timeout)
            .await?
        {
            ResponseBody::Ok => Ok(()),
            other => Err(ProtoError::Unexpected(format!("{other:?}"))),
        }
    }
}
