//! Host environment: the capability that knows which role the current code
//! runs as and how to open a port to the hub.
//!
//! [`MemoryHost`] keeps every context in one process and connects them with
//! in-memory duplex pipes. The socket variant lives in
//! [`crate::bridge::transport`].

use std::io;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::{InstanceId, Role};
use crate::bridge::port::{Port, SenderMetadata};
use crate::error::HubError;
use crate::hub::{HubConfig, HubHandle, spawn_hub};

/// Buffer size of each in-memory pipe direction.
const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;

/// Extension point for different host transports.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Role of the context this environment represents.
    fn role(&self) -> Role;

    /// Open a named port to the hub.
    ///
    /// The returned port carries the metadata the host attaches to it.
    async fn open_port(&self, name: &str) -> io::Result<Port>;
}

/// In-process host.
///
/// Holds the hub's incoming-port queue until [`MemoryHost::init_background_hub`]
/// hands it to the hub, which can happen once.
pub struct MemoryHost {
    port_tx: mpsc::UnboundedSender<Port>,
    port_rx: StdMutex<Option<mpsc::UnboundedReceiver<Port>>>,
    hub_started: AtomicBool,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            port_tx,
            port_rx: StdMutex::new(Some(port_rx)),
            hub_started: AtomicBool::new(false),
        })
    }

    /// Start the hub for this host. Must run before any context connects.
    pub fn init_background_hub(&self, config: HubConfig) -> Result<HubHandle, HubError> {
        let port_rx = self
            .port_rx
            .lock()
            .map_err(|_| HubError::NotRunning)?
            .take()
            .ok_or(HubError::AlreadyInitialized)?;

        let handle = spawn_hub(config, port_rx);
        self.hub_started.store(true, Ordering::SeqCst);
        tracing::debug!("Background hub initialized");
        Ok(handle)
    }

    /// An environment for a context of `role` on this host.
    pub fn context(self: &Arc<Self>, role: Role) -> MemoryContext {
        MemoryContext {
            host: Arc::clone(self),
            role,
            metadata: SenderMetadata::default(),
        }
    }

    /// Hand a raw port to the hub, as the host does for every channel opened
    /// towards the hub context. Ports without the relay prefix are ignored
    /// by the hub.
    pub fn open_raw(&self, port: Port) -> io::Result<()> {
        if !self.hub_started.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "background hub is not initialized",
            ));
        }
        self.port_tx
            .send(port)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "background hub stopped"))
    }
}

/// Environment of one context on a [`MemoryHost`].
#[derive(Clone)]
pub struct MemoryContext {
    host: Arc<MemoryHost>,
    role: Role,
    metadata: SenderMetadata,
}

impl MemoryContext {
    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.metadata.instance_id = Some(instance_id);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.metadata.origin = Some(origin.into());
        self
    }

    pub fn metadata(&self) -> &SenderMetadata {
        &self.metadata
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("role", &self.role)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Environment for MemoryContext {
    fn role(&self) -> Role {
        self.role
    }

    async fn open_port(&self, name: &str) -> io::Result<Port> {
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        self.host
            .open_raw(Port::new(name, self.metadata.clone(), remote))?;
        Ok(Port::new(name, self.metadata.clone(), local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_initializes_once() {
        let host = MemoryHost::new();
        let _hub = host.init_background_hub(HubConfig::new()).unwrap();
        assert!(matches!(
            host.init_background_hub(HubConfig::new()),
            Err(HubError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn ports_need_a_running_hub() {
        let host = MemoryHost::new();
        let err = host
            .context(Role::Popup)
            .open_port("relaylet:popup:main")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn ports_carry_host_metadata() {
        let host = MemoryHost::new();
        let _hub = host.init_background_hub(HubConfig::new()).unwrap();
        let ctx = host
            .context(Role::ContentScript)
            .with_instance_id(12)
            .with_origin("https://example.com");

        let port = ctx.open_port("relaylet:content_script:main").await.unwrap();
        assert_eq!(port.metadata().instance_id, Some(12));
        assert_eq!(port.metadata().origin.as_deref(), Some("https://example.com"));
        assert_eq!(ctx.role(), Role::ContentScript);
    }
}
