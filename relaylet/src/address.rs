//! Connection addressing.
//!
//! Wire grammar: `role ":" (name ("," name)* | "*") (":" instanceId)?`
//!
//! Targets are parsed once, at the API boundary, into a [`TargetSpec`]. The
//! relay path only ever sees the parsed form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved name meaning "every name registered under the role".
pub const WILDCARD: &str = "*";

const SEGMENT_DELIMITER: char = ':';
const NAME_DELIMITER: char = ',';

/// Host-managed numeric slot a context is bound to (e.g. a tab).
pub type InstanceId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedIdentifierError {
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("identifier '{0}' must have the form role:name[:instance]")]
    Shape(String),
    #[error("wildcard cannot be combined with other names in '{0}'")]
    MixedWildcard(String),
    #[error("empty name in '{0}'")]
    EmptyName(String),
    #[error("instance id '{0}' is not numeric")]
    NonNumericInstance(String),
    #[error("'{0}' is not a valid connection name")]
    InvalidName(String),
}

/// Kind of execution context. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The privileged, always-on context that hosts the hub.
    Background,
    /// Per-instance context injected into a host slot.
    ContentScript,
    Popup,
    /// Per-instance context attached to the slot it inspects.
    Devtool,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Background,
        Role::ContentScript,
        Role::Popup,
        Role::Devtool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::ContentScript => "content_script",
            Self::Popup => "popup",
            Self::Devtool => "devtool",
        }
    }

    /// Whether registrations of this role are scoped by an instance id.
    pub fn is_per_instance(&self) -> bool {
        matches!(self, Self::ContentScript | Self::Devtool)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MalformedIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| MalformedIdentifierError::UnknownRole(s.to_string()))
    }
}

/// Check a registration name.
///
/// Names must be addressable through the target grammar, so they cannot be
/// empty, the wildcard, or contain either delimiter.
pub fn validate_name(name: &str) -> Result<(), MalformedIdentifierError> {
    if name.is_empty()
        || name == WILDCARD
        || name.contains(SEGMENT_DELIMITER)
        || name.contains(NAME_DELIMITER)
    {
        return Err(MalformedIdentifierError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Identity of one registered connection.
///
/// Serialized as its wire string (`popup:main`, `content_script:main:12`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConnectionId {
    pub role: Role,
    pub name: String,
    pub instance_id: Option<InstanceId>,
}

impl ConnectionId {
    pub fn new(
        role: Role,
        name: impl Into<String>,
        instance_id: Option<InstanceId>,
    ) -> Result<Self, MalformedIdentifierError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            role,
            name,
            instance_id,
        })
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEGMENT_DELIMITER}{}", self.role, self.name)?;
        if let Some(instance_id) = self.instance_id {
            write!(f, "{SEGMENT_DELIMITER}{instance_id}")?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionId {
    type Err = MalformedIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_target(s)?
            .single_id()
            .ok_or_else(|| MalformedIdentifierError::Shape(s.to_string()))
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = MalformedIdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.to_string()
    }
}

/// Name part of a parsed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetNames {
    Single(String),
    List(Vec<String>),
    Wildcard,
}

impl TargetNames {
    pub fn is_fan_out(&self) -> bool {
        !matches!(self, Self::Single(_))
    }
}

/// A parsed send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub role: Role,
    pub names: TargetNames,
    pub instance_id: Option<InstanceId>,
}

impl TargetSpec {
    /// The concrete id this target names, if it names exactly one.
    pub fn single_id(&self) -> Option<ConnectionId> {
        match &self.names {
            TargetNames::Single(name) => Some(ConnectionId {
                role: self.role,
                name: name.clone(),
                instance_id: self.instance_id,
            }),
            _ => None,
        }
    }
}

impl From<&ConnectionId> for TargetSpec {
    fn from(id: &ConnectionId) -> Self {
        Self {
            role: id.role,
            names: TargetNames::Single(id.name.clone()),
            instance_id: id.instance_id,
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEGMENT_DELIMITER}", self.role)?;
        match &self.names {
            TargetNames::Single(name) => f.write_str(name)?,
            TargetNames::List(names) => f.write_str(&names.join(","))?,
            TargetNames::Wildcard => f.write_str(WILDCARD)?,
        }
        if let Some(instance_id) = self.instance_id {
            write!(f, "{SEGMENT_DELIMITER}{instance_id}")?;
        }
        Ok(())
    }
}

impl FromStr for TargetSpec {
    type Err = MalformedIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_target(s)
    }
}

/// Parse a target string.
///
/// Names are matched exactly; no whitespace is trimmed.
pub fn parse_target(spec: &str) -> Result<TargetSpec, MalformedIdentifierError> {
    let segments: Vec<&str> = spec.split(SEGMENT_DELIMITER).collect();
    let (role, names, instance) = match segments.as_slice() {
        [role, names] => (*role, *names, None),
        [role, names, instance] => (*role, *names, Some(*instance)),
        _ => return Err(MalformedIdentifierError::Shape(spec.to_string())),
    };

    let role: Role = role.parse()?;

    let names = if names == WILDCARD {
        TargetNames::Wildcard
    } else {
        let list: Vec<&str> = names.split(NAME_DELIMITER).collect();
        if list.iter().any(|n| n.is_empty()) {
            return Err(MalformedIdentifierError::EmptyName(spec.to_string()));
        }
        if list.contains(&WILDCARD) {
            return Err(MalformedIdentifierError::MixedWildcard(spec.to_string()));
        }
        match list.as_slice() {
            [single] => TargetNames::Single(single.to_string()),
            _ => TargetNames::List(list.into_iter().map(str::to_string).collect()),
        }
    };

    let instance_id = match instance {
        Some(raw) if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) => Some(
            raw.parse::<InstanceId>()
                .map_err(|_| MalformedIdentifierError::NonNumericInstance(raw.to_string()))?,
        ),
        Some(raw) => {
            return Err(MalformedIdentifierError::NonNumericInstance(
                raw.to_string(),
            ));
        }
        None => None,
    };

    Ok(TargetSpec {
        role,
        names,
        instance_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_name() {
        let spec = parse_target("content_script:main").unwrap();
        assert_eq!(spec.role, Role::ContentScript);
        assert_eq!(spec.names, TargetNames::Single("main".to_string()));
        assert_eq!(spec.instance_id, None);
    }

    #[test]
    fn parses_name_list_with_instance() {
        let spec = parse_target("devtool:panel,sidebar:42").unwrap();
        assert_eq!(spec.role, Role::Devtool);
        assert_eq!(
            spec.names,
            TargetNames::List(vec!["panel".to_string(), "sidebar".to_string()])
        );
        assert_eq!(spec.instance_id, Some(42));
        assert!(spec.names.is_fan_out());
    }

    #[test]
    fn parses_wildcard() {
        let spec = parse_target("popup:*").unwrap();
        assert_eq!(spec.names, TargetNames::Wildcard);
        assert_eq!(spec.to_string(), "popup:*");
    }

    #[test]
    fn rejects_unknown_role() {
        assert_eq!(
            parse_target("sidebar:main"),
            Err(MalformedIdentifierError::UnknownRole("sidebar".to_string()))
        );
    }

    #[test]
    fn rejects_wildcard_mixed_with_names() {
        assert!(matches!(
            parse_target("popup:main,*"),
            Err(MalformedIdentifierError::MixedWildcard(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_instance() {
        assert!(matches!(
            parse_target("content_script:main:abc"),
            Err(MalformedIdentifierError::NonNumericInstance(_))
        ));
        assert!(matches!(
            parse_target("content_script:main:-1"),
            Err(MalformedIdentifierError::NonNumericInstance(_))
        ));
        assert!(matches!(
            parse_target("content_script:main:"),
            Err(MalformedIdentifierError::NonNumericInstance(_))
        ));
    }

    #[test]
    fn rejects_bad_shape() {
        assert!(matches!(
            parse_target("popup"),
            Err(MalformedIdentifierError::Shape(_))
        ));
        assert!(matches!(
            parse_target("popup:a:1:2"),
            Err(MalformedIdentifierError::Shape(_))
        ));
        assert!(matches!(
            parse_target("popup:a,,b"),
            Err(MalformedIdentifierError::EmptyName(_))
        ));
    }

    #[test]
    fn names_are_not_trimmed() {
        let spec = parse_target("popup:a, b").unwrap();
        assert_eq!(
            spec.names,
            TargetNames::List(vec!["a".to_string(), " b".to_string()])
        );
    }

    #[test]
    fn formatted_ids_parse_back_to_themselves() {
        let ids = [
            ConnectionId::new(Role::Background, "hub", None).unwrap(),
            ConnectionId::new(Role::Popup, "main", None).unwrap(),
            ConnectionId::new(Role::ContentScript, "main", Some(7)).unwrap(),
            ConnectionId::new(Role::Devtool, "panel-1", Some(u32::MAX)).unwrap(),
        ];
        for id in ids {
            let spec = parse_target(&id.to_string()).unwrap();
            assert_eq!(spec.single_id(), Some(id.clone()));
            assert_eq!(TargetSpec::from(&id), spec);
        }
    }

    #[test]
    fn validates_registration_names() {
        for bad in ["", "*", "a:b", "a,b"] {
            assert!(ConnectionId::new(Role::Popup, bad, None).is_err(), "{bad:?}");
        }
        assert!(ConnectionId::new(Role::Popup, "main window", None).is_ok());
    }

    #[test]
    fn connection_id_serializes_as_wire_string() {
        let id = ConnectionId::new(Role::ContentScript, "main", Some(3)).unwrap();
        insta::assert_json_snapshot!(id, @r#""content_script:main:3""#);

        let parsed: ConnectionId = serde_json::from_str("\"popup:main\"").unwrap();
        assert_eq!(parsed, ConnectionId::new(Role::Popup, "main", None).unwrap());
        assert!(serde_json::from_str::<ConnectionId>("\"popup:*\"").is_err());
    }
}
