//! Wire protocol types for connection-hub communication.
//!
//! Two directions on every port:
//! - **PortFrame** (connection → hub): requests and responses. Never carries
//!   the sender's identity; the hub attaches it.
//! - **HubFrame** (hub → connection): registration outcome and relayed
//!   envelopes.

use serde::{Deserialize, Serialize};

use super::port::SenderMetadata;
use crate::address::ConnectionId;

/// Opaque id linking a request to its single response.
///
/// UUID v4, so tokens from different connections do not collide at the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(uuid::Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames from a connection to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortFrame {
    /// `target` stays a string on the wire; the hub parses it on ingress.
    Request {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<CorrelationToken>,
        payload: serde_json::Value,
    },

    Response {
        token: CorrelationToken,
        payload: serde_json::Value,
    },
}

/// Why the hub refused a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Name already registered in that role+instance scope.
    DuplicateName,
    /// Port name did not carry a valid role and name.
    InvalidName,
}

/// Frames from the hub to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    /// Registration accepted. `id` is authoritative (includes the
    /// host-supplied instance id).
    Registered { id: ConnectionId },

    /// Registration refused. The hub closes the port right after.
    Rejected { reason: RejectReason },

    Deliver { envelope: Envelope },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// A relayed message as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Rewritten by the hub; never taken from the sender.
    pub sender: ConnectionId,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<CorrelationToken>,
    #[serde(default)]
    pub metadata: SenderMetadata,
    pub payload: serde_json::Value,
    pub kind: EnvelopeKind,
}

/// Host-side handshake written once at the start of a socket port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortOpen {
    pub name: String,
    #[serde(default)]
    pub metadata: SenderMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Role;
    use serde_json::json;

    fn test_token() -> CorrelationToken {
        CorrelationToken::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn request_without_token_serializes() {
        let frame = PortFrame::Request {
            target: "popup:*".to_string(),
            token: None,
            payload: json!({"text": "HI!"}),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "request",
          "target": "popup:*",
          "payload": {
            "text": "HI!"
          }
        }
        "#);
    }

    #[test]
    fn request_with_token_serializes() {
        let frame = PortFrame::Request {
            target: "content_script:main:4".to_string(),
            token: Some(test_token()),
            payload: json!("ping"),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "request",
          "target": "content_script:main:4",
          "token": "550e8400-e29b-41d4-a716-446655440000",
          "payload": "ping"
        }
        "#);
    }

    #[test]
    fn response_serializes() {
        let frame = PortFrame::Response {
            token: test_token(),
            payload: json!("HOWDY!"),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "response",
          "token": "550e8400-e29b-41d4-a716-446655440000",
          "payload": "HOWDY!"
        }
        "#);
    }

    #[test]
    fn rejected_serializes() {
        let frame = HubFrame::Rejected {
            reason: RejectReason::DuplicateName,
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "rejected",
          "reason": "duplicate_name"
        }
        "#);
    }

    #[test]
    fn deliver_serializes() {
        let frame = HubFrame::Deliver {
            envelope: Envelope {
                sender: ConnectionId::new(Role::Background, "hub", None).unwrap(),
                target: "content_script:main".to_string(),
                token: Some(test_token()),
                metadata: SenderMetadata::default(),
                payload: json!({"text": "HI!"}),
                kind: EnvelopeKind::Request,
            },
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "deliver",
          "envelope": {
            "sender": "background:hub",
            "target": "content_script:main",
            "token": "550e8400-e29b-41d4-a716-446655440000",
            "metadata": {},
            "payload": {
              "text": "HI!"
            },
            "kind": "request"
          }
        }
        "#);
    }

    #[test]
    fn registered_carries_instance_id() {
        let frame: HubFrame =
            serde_json::from_value(json!({"type": "registered", "id": "devtool:panel:9"}))
                .unwrap();
        assert_eq!(
            frame,
            HubFrame::Registered {
                id: ConnectionId::new(Role::Devtool, "panel", Some(9)).unwrap()
            }
        );
    }

    #[test]
    fn tokens_are_unique() {
        let a = CorrelationToken::new();
        let b = CorrelationToken::new();
        assert_ne!(a, b);
    }
}
