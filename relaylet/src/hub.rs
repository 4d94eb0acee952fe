//! Background hub - the single relay point every connection registers with.
//!
//! One event loop owns all hub state (registry, ports, in-flight relays), so
//! none of it is locked. Each accepted port gets a reader task forwarding
//! frames into the loop and a writer task draining an outgoing queue.
//!
//! Relay rules:
//! - The envelope sender is always the registered id of the port a frame
//!   arrived on.
//! - A request with a token opens a relay awaiting every resolved target. The
//!   first response closes it; later ones are stale.
//! - A relay is dropped when its requester disconnects or when every target
//!   it awaits has disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::address::{ConnectionId, parse_target};
use crate::bridge::codec::JsonCodec;
use crate::bridge::port::{
    Port, PortStream, SenderMetadata, is_relay_port, parse_relay_port_name,
};
use crate::bridge::protocol::{
    CorrelationToken, Envelope, EnvelopeKind, HubFrame, PortFrame, RejectReason,
};
use crate::error::{HubError, RelayWarning};
use crate::registry::{PortKey, RegisterError, Registry};

type PortReader = FramedRead<ReadHalf<Box<dyn PortStream>>, JsonCodec<PortFrame>>;
type PortWriter = FramedWrite<WriteHalf<Box<dyn PortStream>>, JsonCodec<HubFrame>>;

pub type ConnectionObserver = Arc<dyn Fn(&ConnectionId) + Send + Sync>;
pub type WarningObserver = Arc<dyn Fn(&RelayWarning) + Send + Sync>;

/// Hub configuration.
///
/// Observers run on the hub event loop and must not block.
#[derive(Clone, Default)]
pub struct HubConfig {
    on_connected: Option<ConnectionObserver>,
    on_disconnected: Option<ConnectionObserver>,
    on_warning: Option<WarningObserver>,
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after a registration is accepted.
    pub fn on_connected(mut self, f: impl Fn(&ConnectionId) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    /// Called after a registered connection's port closes.
    pub fn on_disconnected(mut self, f: impl Fn(&ConnectionId) + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_warning(mut self, f: impl Fn(&RelayWarning) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_warning", &self.on_warning.is_some())
            .finish()
    }
}

enum HubCommand {
    Snapshot(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running hub.
///
/// Dropping every handle does not stop the hub; it keeps relaying until its
/// host stops handing it ports and the last port closes.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Currently registered connection ids, in id order.
    pub async fn registered(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Snapshot(tx))
            .await
            .map_err(|_| HubError::NotRunning)?;
        rx.await.map_err(|_| HubError::NotRunning)
    }

    /// Close every port and stop the hub.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Shutdown(tx))
            .await
            .map_err(|_| HubError::NotRunning)?;
        rx.await.map_err(|_| HubError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Start the hub event loop over a queue of ports opened towards it.
pub(crate) fn spawn_hub(config: HubConfig, incoming: mpsc::UnboundedReceiver<Port>) -> HubHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    tokio::spawn(run_hub(config, incoming, command_rx));
    HubHandle {
        commands: command_tx,
    }
}

enum PortEvent {
    Frame(PortFrame),
    Closed(Option<std::io::Error>),
}

struct PortEntry {
    id: ConnectionId,
    metadata: SenderMetadata,
    outgoing: mpsc::UnboundedSender<HubFrame>,
    reader_cancel: CancellationToken,
}

/// A request waiting for its first response.
struct PendingRelay {
    requester: PortKey,
    awaiting: HashSet<PortKey>,
}

struct Hub {
    config: HubConfig,
    registry: Registry,
    ports: HashMap<PortKey, PortEntry>,
    relays: HashMap<CorrelationToken, PendingRelay>,
    next_key: PortKey,
    events: mpsc::UnboundedSender<(PortKey, PortEvent)>,
}

async fn run_hub(
    config: HubConfig,
    mut incoming: mpsc::UnboundedReceiver<Port>,
    mut commands: mpsc::Receiver<HubCommand>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut hub = Hub::new(config, event_tx);
    let mut commands_closed = false;
    let mut incoming_closed = false;

    tracing::info!("Background hub started");

    loop {
        tokio::select! {
            biased;

            command = commands.recv(), if !commands_closed => {
                match command {
                    Some(HubCommand::Snapshot(reply)) => {
                        let _ = reply.send(hub.registry.ids());
                    }
                    Some(HubCommand::Shutdown(reply)) => {
                        tracing::info!(connections = hub.registry.len(), "Hub shutting down");
                        hub.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    None => commands_closed = true,
                }
            }

            port = incoming.recv(), if !incoming_closed => {
                match port {
                    Some(port) => hub.accept(port),
                    None => {
                        tracing::debug!("Host stopped handing ports to the hub");
                        incoming_closed = true;
                    }
                }
            }

            Some((key, event)) = event_rx.recv() => {
                hub.handle_event(key, event);
            }
        }

        if commands_closed && incoming_closed && hub.ports.is_empty() {
            break;
        }
    }

    tracing::info!("Background hub stopped");
}

impl Hub {
    fn new(config: HubConfig, events: mpsc::UnboundedSender<(PortKey, PortEvent)>) -> Self {
        Self {
            config,
            registry: Registry::new(),
            ports: HashMap::new(),
            relays: HashMap::new(),
            next_key: 0,
            events,
        }
    }

    fn accept(&mut self, port: Port) {
        if !is_relay_port(&port) {
            tracing::debug!(port = port.name(), "Ignoring non-relay port");
            return;
        }

        let (port_name, metadata, stream) = port.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);
        let key = self.next_key;
        self.next_key += 1;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(port_writer(
            key,
            FramedWrite::new(write_half, JsonCodec::new()),
            outgoing_rx,
        ));

        // Instance ids come from the host, never from the port name.
        let id = parse_relay_port_name(&port_name).and_then(|(role, name)| {
            let instance_id = if role.is_per_instance() {
                metadata.instance_id
            } else {
                None
            };
            ConnectionId::new(role, name, instance_id)
        });
        let id = match id {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(port = %port_name, error = %e, "Rejecting port with invalid name");
                let _ = outgoing_tx.send(HubFrame::Rejected {
                    reason: RejectReason::InvalidName,
                });
                return;
            }
        };

        if let Err(RegisterError::Duplicate { existing }) = self.registry.register(id.clone(), key) {
            tracing::warn!(%id, existing_port = existing, "Rejecting duplicate registration");
            let _ = outgoing_tx.send(HubFrame::Rejected {
                reason: RejectReason::DuplicateName,
            });
            return;
        }

        let reader_cancel = CancellationToken::new();
        tokio::spawn(port_reader(
            key,
            FramedRead::new(read_half, JsonCodec::new()),
            self.events.clone(),
            reader_cancel.clone(),
        ));

        let _ = outgoing_tx.send(HubFrame::Registered { id: id.clone() });
        self.ports.insert(
            key,
            PortEntry {
                id: id.clone(),
                metadata,
                outgoing: outgoing_tx,
                reader_cancel,
            },
        );

        tracing::info!(%id, port = key, "Connection registered");
        if let Some(observer) = &self.config.on_connected {
            observer(&id);
        }
    }

    fn handle_event(&mut self, key: PortKey, event: PortEvent) {
        match event {
            PortEvent::Frame(PortFrame::Request {
                target,
                token,
                payload,
            }) => self.relay_request(key, target, token, payload),
            PortEvent::Frame(PortFrame::Response { token, payload }) => {
                self.relay_response(key, token, payload)
            }
            PortEvent::Closed(error) => {
                if let Some(e) = error {
                    tracing::warn!(port = key, error = %e, "Port channel error, disconnecting");
                }
                self.close_port(key);
            }
        }
    }

    fn relay_request(
        &mut self,
        key: PortKey,
        target: String,
        token: Option<CorrelationToken>,
        payload: serde_json::Value,
    ) {
        let Some(entry) = self.ports.get(&key) else {
            return;
        };
        let sender = entry.id.clone();
        let metadata = entry.metadata.clone();

        let spec = match parse_target(&target) {
            Ok(spec) => spec,
            Err(error) => {
                self.warn(RelayWarning::MalformedTarget {
                    sender,
                    target,
                    error,
                });
                return;
            }
        };

        let recipients = self.registry.resolve(&spec, &sender);
        if recipients.is_empty() {
            self.warn(RelayWarning::UnresolvedTarget { sender, target });
            return;
        }

        if let Some(token) = token {
            if self.relays.contains_key(&token) {
                self.warn(RelayWarning::DuplicateRequestToken { sender, token });
                return;
            }
            self.relays.insert(
                token,
                PendingRelay {
                    requester: key,
                    awaiting: recipients.iter().map(|(_, key)| *key).collect(),
                },
            );
        }

        for (_, recipient) in &recipients {
            self.deliver(
                *recipient,
                Envelope {
                    sender: sender.clone(),
                    target: target.clone(),
                    token,
                    metadata: metadata.clone(),
                    payload: payload.clone(),
                    kind: EnvelopeKind::Request,
                },
            );
        }

        tracing::debug!(
            %sender,
            %target,
            recipients = recipients.len(),
            expects_response = token.is_some(),
            "Relayed request"
        );
    }

    fn relay_response(&mut self, key: PortKey, token: CorrelationToken, payload: serde_json::Value) {
        let Some(entry) = self.ports.get(&key) else {
            return;
        };
        let responder = entry.id.clone();
        let metadata = entry.metadata.clone();

        let awaited = self
            .relays
            .get(&token)
            .is_some_and(|relay| relay.awaiting.contains(&key));
        let relay = if awaited { self.relays.remove(&token) } else { None };
        let Some(relay) = relay else {
            self.warn(RelayWarning::StaleResponse { responder, token });
            return;
        };

        let Some(requester) = self.ports.get(&relay.requester).map(|entry| entry.id.clone()) else {
            return;
        };
        tracing::debug!(%responder, %requester, %token, "Relayed response");
        self.deliver(
            relay.requester,
            Envelope {
                sender: responder,
                target: requester.to_string(),
                token: Some(token),
                metadata,
                payload,
                kind: EnvelopeKind::Response,
            },
        );
    }

    fn deliver(&self, key: PortKey, envelope: Envelope) {
        if let Some(entry) = self.ports.get(&key)
            && entry.outgoing.send(HubFrame::Deliver { envelope }).is_err()
        {
            tracing::debug!(id = %entry.id, "Writer gone, envelope dropped");
        }
    }

    fn close_port(&mut self, key: PortKey) {
        let Some(entry) = self.ports.remove(&key) else {
            return;
        };
        entry.reader_cancel.cancel();
        self.registry.deregister(&entry.id, key);

        let before = self.relays.len();
        self.relays.retain(|_, relay| {
            if relay.requester == key {
                return false;
            }
            relay.awaiting.remove(&key);
            !relay.awaiting.is_empty()
        });

        tracing::info!(
            id = %entry.id,
            port = key,
            dropped_relays = before - self.relays.len(),
            "Connection disconnected"
        );
        if let Some(observer) = &self.config.on_disconnected {
            observer(&entry.id);
        }
    }

    fn close_all(&mut self) {
        let keys: Vec<PortKey> = self.ports.keys().copied().collect();
        for key in keys {
            self.close_port(key);
        }
    }

    fn warn(&self, warning: RelayWarning) {
        tracing::warn!(%warning, "Relay warning");
        if let Some(observer) = &self.config.on_warning {
            observer(&warning);
        }
    }
}

async fn port_reader(
    key: PortKey,
    mut reader: PortReader,
    events: mpsc::UnboundedSender<(PortKey, PortEvent)>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                if events.send((key, PortEvent::Frame(frame))).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                let _ = events.send((key, PortEvent::Closed(Some(e))));
                break;
            }
            None => {
                let _ = events.send((key, PortEvent::Closed(None)));
                break;
            }
        }
    }
    tracing::trace!(port = key, "Port reader task exiting");
}

/// Drains queued frames, then closes the write side once the hub drops the
/// queue.
async fn port_writer(
    key: PortKey,
    mut writer: PortWriter,
    mut outgoing: mpsc::UnboundedReceiver<HubFrame>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = writer.send(frame).await {
            tracing::debug!(port = key, error = %e, "Failed to write to port");
            break;
        }
    }
    let _ = writer.close().await;
    tracing::trace!(port = key, "Port writer task exiting");
}
