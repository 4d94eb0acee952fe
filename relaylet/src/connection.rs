//! Connection - one context's registration against the hub.
//!
//! Flow:
//! 1. Open a relay port through the host [`Environment`]
//! 2. Spawn a writer task (outgoing frames) and a reader task (hub frames)
//! 3. Reader resolves pending calls and hands requests to the message handler
//! 4. Teardown (explicit, rejection, or channel close) drops pending calls
//!    without running them

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::address::{ConnectionId, Role, parse_target, validate_name};
use crate::bridge::codec::JsonCodec;
use crate::bridge::port::{PortStream, SenderMetadata, relay_port_name};
use crate::bridge::protocol::{
    CorrelationToken, Envelope, EnvelopeKind, HubFrame, PortFrame, RejectReason,
};
use crate::error::ConnectionError;
use crate::host::Environment;
use crate::pending::{PendingCalls, ResponseCallback, ResponseFuture};

type PortReader = FramedRead<ReadHalf<Box<dyn PortStream>>, JsonCodec<HubFrame>>;
type PortWriter = FramedWrite<WriteHalf<Box<dyn PortStream>>, JsonCodec<PortFrame>>;

/// A request delivered to this connection.
#[derive(Debug)]
pub struct IncomingMessage {
    pub payload: serde_json::Value,
    pub from: ConnectionId,
    pub metadata: SenderMetadata,
    pub responder: Responder,
}

/// Receives requests addressed to a connection.
///
/// Called on the connection's reader task, one message at a time. Move the
/// [`Responder`] elsewhere to answer later.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: IncomingMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(IncomingMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: IncomingMessage) {
        self(message)
    }
}

/// Answers one request. Consumed by [`Responder::respond`], so a request is
/// answered at most once.
#[derive(Debug)]
pub struct Responder {
    token: Option<CorrelationToken>,
    requester: ConnectionId,
    connection_name: String,
    outgoing: mpsc::UnboundedSender<PortFrame>,
}

impl Responder {
    /// Whether the sender asked for a response.
    pub fn expects_response(&self) -> bool {
        self.token.is_some()
    }

    pub fn requester(&self) -> &ConnectionId {
        &self.requester
    }

    /// Send the response back through the hub.
    ///
    /// A no-op when the sender did not ask for a response.
    pub fn respond(self, payload: serde_json::Value) -> Result<(), ConnectionError> {
        let Some(token) = self.token else {
            tracing::debug!(requester = %self.requester, "Sender expects no response; dropping it");
            return Ok(());
        };
        self.outgoing
            .send(PortFrame::Response { token, payload })
            .map_err(|_| ConnectionError::NotConnected(self.connection_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally by `disconnect()` or by dropping the last handle.
    Disconnected,
    Rejected(RejectReason),
    /// The hub end of the port went away.
    ChannelClosed,
    ChannelError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Port open, registration not yet acknowledged.
    Connecting,
    Registered(ConnectionId),
    Closed(CloseReason),
}

/// State shared between the handle and the reader/writer tasks.
struct Shared {
    pending: PendingCalls,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Move to `Closed`, drop pending calls and stop both tasks.
    ///
    /// Returns `false` if the connection was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Closed(_)) {
                false
            } else {
                *state = ConnectionState::Closed(reason);
                true
            }
        });
        if changed {
            let dropped = self.pending.close();
            if dropped > 0 {
                tracing::debug!(dropped, "Dropped pending calls on close");
            }
        }
        self.shutdown.cancel();
        changed
    }
}

struct ConnectionInner {
    role: Role,
    name: String,
    outgoing: mpsc::UnboundedSender<PortFrame>,
    shared: Arc<Shared>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shared.close(CloseReason::Disconnected);
    }
}

/// Handle to a registered connection. Cheap to clone; the connection closes
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Open a port to the hub and register under `name`.
///
/// Returns as soon as the port is open. Registration is confirmed (or
/// refused) asynchronously; see [`Connection::registered`].
pub async fn init_connection<H>(
    env: &dyn Environment,
    name: &str,
    handler: H,
) -> Result<Connection, ConnectionError>
where
    H: MessageHandler,
{
    validate_name(name)?;
    let role = env.role();
    let port_name = relay_port_name(role, name);

    let port = env.open_port(&port_name).await?;
    let (_, _, stream) = port.into_parts();
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, JsonCodec::<HubFrame>::new());
    let writer = FramedWrite::new(write_half, JsonCodec::<PortFrame>::new());

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(ConnectionState::Connecting);
    let shared = Arc::new(Shared {
        pending: PendingCalls::new(),
        state: state_tx,
        shutdown: CancellationToken::new(),
    });

    tokio::spawn(write_loop(
        port_name.clone(),
        writer,
        outgoing_rx,
        Arc::clone(&shared),
    ));
    tokio::spawn(read_loop(
        port_name.clone(),
        name.to_string(),
        reader,
        Arc::clone(&shared),
        outgoing_tx.clone(),
        handler,
    ));

    tracing::debug!(port = %port_name, "Connection port opened");

    Ok(Connection {
        inner: Arc::new(ConnectionInner {
            role,
            name: name.to_string(),
            outgoing: outgoing_tx,
            shared,
        }),
    })
}

impl Connection {
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.borrow().clone()
    }

    /// The hub-assigned id, once registration is acknowledged.
    pub fn id(&self) -> Option<ConnectionId> {
        match self.state() {
            ConnectionState::Registered(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state(), ConnectionState::Closed(_))
    }

    /// Number of requests still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Age of the oldest request still waiting for a response.
    pub fn oldest_pending_call(&self) -> Option<Duration> {
        self.inner.shared.pending.oldest()
    }

    /// Wait for the hub's registration verdict.
    pub async fn registered(&self) -> Result<ConnectionId, ConnectionError> {
        let mut rx = self.inner.shared.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ConnectionState::Connecting))
            .await
            .map(|state| state.clone());

        match state {
            Ok(ConnectionState::Registered(id)) => Ok(id),
            Ok(ConnectionState::Closed(CloseReason::Rejected(RejectReason::DuplicateName))) => {
                Err(ConnectionError::DuplicateName(self.inner.name.clone()))
            }
            Ok(ConnectionState::Closed(CloseReason::Rejected(RejectReason::InvalidName))) => {
                Err(ConnectionError::InvalidName(self.inner.name.clone()))
            }
            _ => Err(self.not_connected()),
        }
    }

    /// Wait until the connection is closed, for any reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.shared.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, ConnectionState::Closed(_)))
            .await
            .map(|state| state.clone());
        match state {
            Ok(ConnectionState::Closed(reason)) => reason,
            _ => CloseReason::ChannelClosed,
        }
    }

    /// Fire-and-forget send. `to` is parsed here; a malformed target fails
    /// synchronously.
    pub fn send_message(&self, to: &str, message: serde_json::Value) -> Result<(), ConnectionError> {
        self.dispatch(to, message, None)
    }

    /// Send and run `callback` with the first response, if one ever comes.
    pub fn send_message_with_callback<F>(
        &self,
        to: &str,
        message: serde_json::Value,
        callback: F,
    ) -> Result<(), ConnectionError>
    where
        F: FnOnce(serde_json::Value) + Send + 'static,
    {
        self.dispatch(to, message, Some(Box::new(callback)))
    }

    /// Send and await the first response.
    pub fn request(
        &self,
        to: &str,
        message: serde_json::Value,
    ) -> Result<ResponseFuture, ConnectionError> {
        let (callback, response) = ResponseFuture::channel();
        self.dispatch(to, message, Some(callback))?;
        Ok(response)
    }

    /// Close the port. Outstanding calls are dropped without running.
    pub fn disconnect(&self) {
        if self.inner.shared.close(CloseReason::Disconnected) {
            tracing::info!(role = %self.inner.role, name = %self.inner.name, "Connection disconnected");
        }
    }

    fn dispatch(
        &self,
        to: &str,
        payload: serde_json::Value,
        callback: Option<ResponseCallback>,
    ) -> Result<(), ConnectionError> {
        let target = parse_target(to)?;
        if !self.is_open() {
            return Err(self.not_connected());
        }

        let token = match callback {
            Some(callback) => Some(
                self.inner
                    .shared
                    .pending
                    .insert(callback)
                    .ok_or_else(|| self.not_connected())?,
            ),
            None => None,
        };
        if token.is_some() && target.names.is_fan_out() {
            tracing::debug!(%target, "Fan-out request expects a response; first response wins");
        }

        let frame = PortFrame::Request {
            target: target.to_string(),
            token,
            payload,
        };
        if self.inner.outgoing.send(frame).is_err() {
            if let Some(token) = token {
                self.inner.shared.pending.remove(&token);
            }
            return Err(self.not_connected());
        }
        tracing::trace!(%target, expects_response = token.is_some(), "Queued request");
        Ok(())
    }

    fn not_connected(&self) -> ConnectionError {
        ConnectionError::NotConnected(self.inner.name.clone())
    }
}

async fn write_loop(
    port_name: String,
    mut writer: PortWriter,
    mut outgoing: mpsc::UnboundedReceiver<PortFrame>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => {
                // Frames queued before the close were already accepted.
                while let Ok(frame) = outgoing.try_recv() {
                    if let Err(e) = writer.feed(frame).await {
                        tracing::debug!(port = %port_name, error = %e, "Dropped queued frame on close");
                        break;
                    }
                }
                break;
            }

            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(frame).await {
                    tracing::error!(port = %port_name, error = %e, "Failed to write frame");
                    shared.close(close_reason_for(&e));
                    break;
                }
            }
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(port = %port_name, error = %e, "Port already closed");
    }
    tracing::trace!(port = %port_name, "Writer task exiting");
}

/// A peer hanging up is a channel close, whichever side notices first.
fn close_reason_for(e: &std::io::Error) -> CloseReason {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => CloseReason::ChannelClosed,
        _ => CloseReason::ChannelError(e.to_string()),
    }
}

async fn read_loop<H: MessageHandler>(
    port_name: String,
    name: String,
    mut reader: PortReader,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<PortFrame>,
    handler: H,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => {
                tracing::trace!(port = %port_name, "Reader task exiting");
                return;
            }
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(HubFrame::Registered { id })) => {
                tracing::info!(%id, "Registered with hub");
                shared.state.send_if_modified(|state| {
                    if matches!(state, ConnectionState::Connecting) {
                        *state = ConnectionState::Registered(id);
                        true
                    } else {
                        false
                    }
                });
            }
            Some(Ok(HubFrame::Rejected { reason })) => {
                tracing::warn!(port = %port_name, ?reason, "Hub rejected registration");
                break CloseReason::Rejected(reason);
            }
            Some(Ok(HubFrame::Deliver { envelope })) => {
                deliver(&name, &shared, &outgoing, &handler, envelope);
            }
            Some(Err(e)) => {
                tracing::error!(port = %port_name, error = %e, "Port channel error");
                break close_reason_for(&e);
            }
            None => {
                tracing::debug!(port = %port_name, "Hub closed the port");
                break CloseReason::ChannelClosed;
            }
        }
    };
    shared.close(reason);
}

fn deliver<H: MessageHandler>(
    name: &str,
    shared: &Shared,
    outgoing: &mpsc::UnboundedSender<PortFrame>,
    handler: &H,
    envelope: Envelope,
) {
    match envelope.kind {
        EnvelopeKind::Response => match envelope.token {
            Some(token) => {
                shared.pending.resolve(&token, envelope.payload);
            }
            None => {
                tracing::warn!(sender = %envelope.sender, "Response without token dropped");
            }
        },
        EnvelopeKind::Request => {
            tracing::debug!(from = %envelope.sender, expects_response = envelope.token.is_some(), "Request received");
            let responder = Responder {
                token: envelope.token,
                requester: envelope.sender.clone(),
                connection_name: name.to_string(),
                outgoing: outgoing.clone(),
            };
            handler.on_message(IncomingMessage {
                payload: envelope.payload,
                from: envelope.sender,
                metadata: envelope.metadata,
                responder,
            });
        }
    }
}
