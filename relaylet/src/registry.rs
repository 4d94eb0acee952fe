//! Hub registry: which connection id is live on which port.
//!
//! At most one live registration per exact `ConnectionId`. A second
//! registration of a live id is rejected and leaves the first untouched.
//! Only the hub event loop touches the registry.

use std::collections::BTreeMap;

use crate::address::{ConnectionId, InstanceId, TargetNames, TargetSpec};

/// Hub-local handle for one accepted port.
pub(crate) type PortKey = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegisterError {
    Duplicate { existing: PortKey },
}

/// Instance scope a target resolves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceScope {
    Exact(Option<InstanceId>),
    Any,
}

impl InstanceScope {
    /// An explicit instance wins. Otherwise a per-instance target inherits
    /// the sender's own instance; a sender without one reaches every
    /// instance.
    fn for_target(target: &TargetSpec, sender: &ConnectionId) -> Self {
        match target.instance_id {
            Some(id) => Self::Exact(Some(id)),
            None if target.role.is_per_instance() && sender.instance_id.is_some() => {
                Self::Exact(sender.instance_id)
            }
            None => Self::Any,
        }
    }

    fn admits(&self, id: &ConnectionId) -> bool {
        match self {
            Self::Exact(instance) => id.instance_id == *instance,
            Self::Any => true,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: BTreeMap<ConnectionId, PortKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ConnectionId, key: PortKey) -> Result<(), RegisterError> {
        if let Some(&existing) = self.entries.get(&id) {
            return Err(RegisterError::Duplicate { existing });
        }
        self.entries.insert(id, key);
        Ok(())
    }

    /// Remove `id` if it is still held by `key`.
    pub fn deregister(&mut self, id: &ConnectionId, key: PortKey) -> bool {
        match self.entries.get(id) {
            Some(&held) if held == key => {
                self.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolve a target to the live registrations it names, in id order.
    ///
    /// Names in an explicit list that are not registered are skipped.
    pub fn resolve(&self, target: &TargetSpec, sender: &ConnectionId) -> Vec<(ConnectionId, PortKey)> {
        let scope = InstanceScope::for_target(target, sender);
        let name_matches = |name: &str| match &target.names {
            TargetNames::Single(single) => single == name,
            TargetNames::List(list) => list.iter().any(|n| n == name),
            TargetNames::Wildcard => true,
        };

        self.entries
            .iter()
            .filter(|(id, _)| id.role == target.role && name_matches(&id.name) && scope.admits(id))
            .map(|(id, key)| (id.clone(), *key))
            .collect()
    }
}
