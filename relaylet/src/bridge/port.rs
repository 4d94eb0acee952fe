//! Port: the host-provided bidirectional channel a connection talks over.
//!
//! Ports opened by this crate are named `relaylet:<role>:<name>`. The prefix
//! is what tells relay ports apart from unrelated host channels.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::{InstanceId, MalformedIdentifierError, Role, validate_name};

/// Reserved port-name prefix marking relay ports.
pub const RELAY_PORT_PREFIX: &str = "relaylet:";

/// What the host knows about the context on the other end of a port.
///
/// Supplied by the host transport, never by the connecting code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Byte stream backing a port.
pub trait PortStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PortStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// One open channel between a context and the hub.
pub struct Port {
    name: String,
    metadata: SenderMetadata,
    stream: Box<dyn PortStream>,
}

impl Port {
    pub fn new(name: impl Into<String>, metadata: SenderMetadata, stream: impl PortStream) -> Self {
        Self {
            name: name.into(),
            metadata,
            stream: Box::new(stream),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &SenderMetadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (String, SenderMetadata, Box<dyn PortStream>) {
        (self.name, self.metadata, self.stream)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

pub fn relay_port_name(role: Role, name: &str) -> String {
    format!("{RELAY_PORT_PREFIX}{role}:{name}")
}

pub fn is_relay_port_name(name: &str) -> bool {
    name.starts_with(RELAY_PORT_PREFIX)
}

pub fn is_relay_port(port: &Port) -> bool {
    is_relay_port_name(port.name())
}

/// Split a relay port name into the role and name it registers.
pub fn parse_relay_port_name(port_name: &str) -> Result<(Role, String), MalformedIdentifierError> {
    let rest = port_name
        .strip_prefix(RELAY_PORT_PREFIX)
        .ok_or_else(|| MalformedIdentifierError::Shape(port_name.to_string()))?;
    let (role, name) = rest
        .split_once(':')
        .ok_or_else(|| MalformedIdentifierError::Shape(port_name.to_string()))?;
    let role: Role = role.parse()?;
    validate_name(name)?;
    Ok((role, name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_ports_are_recognized_by_name() {
        let (a, _b) = tokio::io::duplex(64);
        let port = Port::new(relay_port_name(Role::Popup, "main"), SenderMetadata::default(), a);
        assert_eq!(port.name(), "relaylet:popup:main");
        assert!(is_relay_port(&port));

        let (c, _d) = tokio::io::duplex(64);
        let foreign = Port::new("devtools-page", SenderMetadata::default(), c);
        assert!(!is_relay_port(&foreign));
    }

    #[test]
    fn parses_port_names() {
        assert_eq!(
            parse_relay_port_name("relaylet:content_script:main").unwrap(),
            (Role::ContentScript, "main".to_string())
        );
        assert!(parse_relay_port_name("relaylet:popup:*").is_err());
        assert!(parse_relay_port_name("relaylet:popup:a:b").is_err());
        assert!(parse_relay_port_name("relaylet:window:main").is_err());
        assert!(parse_relay_port_name("other:popup:main").is_err());
    }

    #[test]
    fn empty_metadata_serializes_empty() {
        insta::assert_json_snapshot!(SenderMetadata::default(), @"{}");
    }
}
