//! relaylet: hub-and-spoke message relay between named execution contexts.

mod pending;
mod registry;

pub mod address;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod host;
pub mod hub;

pub use address::{ConnectionId, InstanceId, Role, TargetNames, TargetSpec, WILDCARD, parse_target};
pub use bridge::port::{Port, SenderMetadata};
pub use bridge::transport::{UnixEnvironment, UnixHost};
pub use connection::{
    CloseReason, Connection, ConnectionState, IncomingMessage, MessageHandler, Responder,
    init_connection,
};
pub use error::{ConnectionError, HubError, RelayWarning};
pub use host::{Environment, MemoryContext, MemoryHost};
pub use hub::{HubConfig, HubHandle};
pub use pending::ResponseFuture;
