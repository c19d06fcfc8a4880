//! Control-channel endpoint: request/response correlation and notify semantics.
//!
//! One `Channel` sits on each end of a transport connection. `send` suspends
//! the caller until the matching response arrives or the channel closes;
//! `notify` is fire-and-forget; `handle` registers async handlers whose
//! return value (or rejection) becomes the response.
//!
//! All inbound traffic funnels through `dispatch`. A response is matched and
//! removed from the pending table atomically; responses for unknown request
//! ids are dropped.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{ControlMessage, MessageKind, RequestId};

/// Exit code when an inbound frame could not be handled (protocol bug).
pub const EXIT_MESSAGE_HANDLING_FAILED: i32 = 70;
/// Exit code for child-side uncaught application errors, after `fatal_error`.
pub const EXIT_CHILD_FATAL: i32 = 71;
/// Exit code for socket-level transport failures (network/OS, not protocol).
pub const EXIT_TRANSPORT_ERROR: i32 = 74;

/// Marker prefix for "no handler registered" error responses, so the sender
/// can tell an unimplemented command apart from a real handler failure.
pub const NO_HANDLER_PREFIX: &str = "no_handler";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("control channel closed")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
}

impl ChannelError {
    /// True when the remote endpoint had no handler for the command.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, Self::Remote(msg) if msg.starts_with(NO_HANDLER_PREFIX))
    }
}

/// Rejection returned by a handler; becomes the response's `error` field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerRejection(pub String);

impl From<String> for HandlerRejection {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerRejection {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

type Handler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, HandlerRejection>>
        + Send
        + Sync,
>;

type PendingTable = HashMap<RequestId, oneshot::Sender<Result<serde_json::Value, ChannelError>>>;

/// How the connection's read loop terminated. The two variants carry distinct
/// exit codes so operators can tell protocol bugs from network/OS failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelFailure {
    #[error("message handling failed: {0}")]
    Message(io::Error),
    #[error("transport error: {0}")]
    Transport(io::Error),
}

impl ChannelFailure {
    pub fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Message(e)
        } else {
            Self::Transport(e)
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Message(_) => EXIT_MESSAGE_HANDLING_FAILED,
            Self::Transport(_) => EXIT_TRANSPORT_ERROR,
        }
    }
}

/// One end of a control channel.
pub struct Channel {
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pending: Arc<StdMutex<PendingTable>>,
    handlers: StdMutex<HashMap<String, Handler>>,
    strict: bool,
    closed: CancellationToken,
}

impl Channel {
    /// Create an endpoint plus the stream of frames it wants written out.
    ///
    /// The caller owns the writer side: drain the receiver into a framed sink
    /// (`spawn_writer`). Strict endpoints treat unknown notify commands as
    /// protocol errors; lenient endpoints drop them (the agent side tolerates
    /// host commands it does not implement).
    pub fn new(strict: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outbound,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            handlers: StdMutex::new(HashMap::new()),
            strict,
            closed: CancellationToken::new(),
        });
        (channel, outbound_rx)
    }

    /// Register a handler for inbound requests/notifies with this command.
    pub fn handle<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerRejection>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(command.into(), boxed);
    }

    /// Issue a request and suspend until the response or channel closure.
    pub async fn send(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let (_, rx) = self.begin_request(command, payload)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Register a pending request and enqueue its frame, without awaiting.
    ///
    /// Exposed so the supervisor can record which connection owns the request
    /// before suspending on the receiver.
    pub fn begin_request(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<
        (
            RequestId,
            oneshot::Receiver<Result<serde_json::Value, ChannelError>>,
        ),
        ChannelError,
    > {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let req_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(req_id, tx);

        let msg = ControlMessage::request(req_id, command, payload);
        if self.outbound.send(msg).is_err() {
            self.pending
                .lock()
                .expect("pending table lock poisoned")
                .remove(&req_id);
            return Err(ChannelError::Closed);
        }

        Ok((req_id, rx))
    }

    /// Issue a one-way message with no response expectation.
    pub fn notify(&self, command: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(ControlMessage::notify(command, payload))
            .map_err(|_| ChannelError::Closed)
    }

    /// Sender handle for raw frames (panic hooks, tracing forwarders).
    pub fn raw_sender(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.outbound.clone()
    }

    /// Dispatch one inbound message.
    pub fn dispatch(&self, msg: ControlMessage) {
        match msg.kind {
            MessageKind::Response => self.resolve_response(msg),
            MessageKind::Request => {
                let Some(req_id) = msg.req_id else {
                    tracing::warn!(command = %msg.command, "Request frame without reqId, dropping");
                    return;
                };
                let handler = self.lookup(&msg.command);
                match handler {
                    Some(handler) => {
                        let outbound = self.outbound.clone();
                        let command = msg.command;
                        let fut = handler(msg.payload);
                        tokio::spawn(async move {
                            let reply = match fut.await {
                                Ok(value) => ControlMessage::response(req_id, command, value),
                                Err(rejection) => {
                                    ControlMessage::error_response(req_id, command, rejection.0)
                                }
                            };
                            let _ = outbound.send(reply);
                        });
                    }
                    None => {
                        // A request must resolve exactly once, so even a lenient
                        // endpoint answers unknown commands with an error.
                        let _ = self.outbound.send(ControlMessage::error_response(
                            req_id,
                            msg.command.clone(),
                            format!("{NO_HANDLER_PREFIX}: {}", msg.command),
                        ));
                    }
                }
            }
            MessageKind::Notify => {
                let handler = self.lookup(&msg.command);
                match handler {
                    Some(handler) => {
                        let command = msg.command;
                        let fut = handler(msg.payload);
                        tokio::spawn(async move {
                            if let Err(rejection) = fut.await {
                                tracing::warn!(%command, error = %rejection, "Notify handler failed");
                            }
                        });
                    }
                    None if self.strict => {
                        tracing::error!(command = %msg.command, "No handler for notify on strict endpoint");
                    }
                    None => {
                        tracing::trace!(command = %msg.command, "Ignoring unhandled notify");
                    }
                }
            }
        }
    }

    fn resolve_response(&self, msg: ControlMessage) {
        let Some(req_id) = msg.req_id else {
            tracing::warn!(command = %msg.command, "Response frame without reqId, dropping");
            return;
        };
        let entry = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(&req_id);
        match entry {
            Some(tx) => {
                let result = match msg.error {
                    Some(error) => Err(ChannelError::Remote(error)),
                    None => Ok(msg.payload),
                };
                let _ = tx.send(result);
            }
            None => {
                tracing::debug!(%req_id, "Response for unknown request id, dropping");
            }
        }
    }

    fn lookup(&self, command: &str) -> Option<Handler> {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(command)
            .cloned()
    }

    /// Close the endpoint: every pending request resolves with `Closed` and
    /// further sends fail. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            pending.drain().collect()
        };
        for (req_id, tx) in drained {
            tracing::debug!(%req_id, "Failing pending request on channel close");
            let _ = tx.send(Err(ChannelError::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending table lock poisoned").len()
    }
}

/// Drain outbound frames into a framed sink; resolves once the channel is
/// dropped or closed and the queue is flushed.
pub fn spawn_writer<W>(
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
    mut writer: tokio_util::codec::FramedWrite<W, JsonLineCodec<ControlMessage>>,
) -> tokio::task::JoinHandle<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use futures::SinkExt;
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                tracing::warn!(error = %e, "Failed to write control frame");
                break;
            }
        }
        let _ = writer.flush().await;
        let _ = writer.close().await;
    })
}

/// Pump inbound frames from a framed source through the channel.
///
/// Returns `Ok(())` on clean EOF (peer closed). A malformed frame or socket
/// error closes the channel and reports the failure; the caller decides how
/// fatal that is (both supervisor and agent exit with the failure's code).
pub async fn drive<R>(
    channel: &Channel,
    mut reader: FramedRead<R, JsonLineCodec<ControlMessage>>,
) -> Result<(), ChannelFailure>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let result = loop {
        match reader.next().await {
            Some(Ok(msg)) => channel.dispatch(msg),
            Some(Err(e)) => break Err(ChannelFailure::from_io(e)),
            None => break Ok(()),
        }
    };
    channel.close();
    result
}
