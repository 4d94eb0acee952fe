//! Unix socket host transport.
//!
//! The hub listens on one socket path. Each accepted stream is one port: the
//! connecting host side writes a single length-prefixed `PortOpen` frame
//! (port name + host metadata), after which the stream carries JSON frames.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

use super::codec::{JsonCodec, MAX_FRAME_BYTES};
use super::port::{Port, SenderMetadata};
use super::protocol::PortOpen;
use crate::address::{InstanceId, Role};
use crate::error::HubError;
use crate::host::Environment;
use crate::hub::{HubConfig, HubHandle, spawn_hub};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hub side of the socket transport.
///
/// The listener can back exactly one hub; it is handed over on
/// [`UnixHost::init_background_hub`].
pub struct UnixHost {
    path: PathBuf,
    listener: StdMutex<Option<UnixListener>>,
}

impl UnixHost {
    /// Bind the hub socket, replacing a stale socket file at `path`.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        tracing::debug!(path = %path.display(), "Bound hub socket");

        Ok(Self {
            path,
            listener: StdMutex::new(Some(listener)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the hub on this socket. Only the first call succeeds.
    pub fn init_background_hub(&self, config: HubConfig) -> Result<HubHandle, HubError> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| HubError::NotRunning)?
            .take()
            .ok_or(HubError::AlreadyInitialized)?;

        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let handle = spawn_hub(config, port_rx);
        tokio::spawn(accept_loop(listener, port_tx));
        Ok(handle)
    }
}

impl Drop for UnixHost {
    fn drop(&mut self) {
        if self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Removing hub socket");
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(error = %e, "Failed to remove hub socket");
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, port_tx: mpsc::UnboundedSender<Port>) {
    loop {
        tokio::select! {
            _ = port_tx.closed() => break,
            accepted = listener.accept() => {
                let mut stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "Hub socket accept failed");
                        break;
                    }
                };
                let port_tx = port_tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_port_open(&mut stream)).await {
                        Ok(Ok(open)) => {
                            let port = Port::new(open.name, open.metadata, stream);
                            if port_tx.send(port).is_err() {
                                tracing::debug!("Hub stopped before port could be handed over");
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Invalid port handshake");
                        }
                        Err(_) => {
                            tracing::warn!("Port handshake timed out");
                        }
                    }
                });
            }
        }
    }
    tracing::debug!("Hub socket accept loop exiting");
}

/// Read the handshake without buffering past it.
async fn read_port_open(stream: &mut UnixStream) -> io::Result<PortOpen> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_port_open(stream: &mut UnixStream, open: PortOpen) -> io::Result<()> {
    let mut buf = BytesMut::new();
    JsonCodec::<PortOpen>::new().encode(open, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await
}

/// Context side of the socket transport.
#[derive(Debug, Clone)]
pub struct UnixEnvironment {
    path: PathBuf,
    role: Role,
    metadata: SenderMetadata,
}

impl UnixEnvironment {
    pub fn new(path: impl Into<PathBuf>, role: Role) -> Self {
        Self {
            path: path.into(),
            role,
            metadata: SenderMetadata::default(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.metadata.instance_id = Some(instance_id);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.metadata.origin = Some(origin.into());
        self
    }
}

#[async_trait]
impl Environment for UnixEnvironment {
    fn role(&self) -> Role {
        self.role
    }

    async fn open_port(&self, name: &str) -> io::Result<Port> {
        let mut stream = UnixStream::connect(&self.path).await?;
        write_port_open(
            &mut stream,
            PortOpen {
                name: name.to_string(),
                metadata: self.metadata.clone(),
            },
        )
        .await?;
        tracing::trace!(port = name, path = %self.path.display(), "Opened socket port");
        Ok(Port::new(name, self.metadata.clone(), stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{IncomingMessage, init_connection};
    use serde_json::json;

    #[tokio::test]
    async fn handshake_is_read_without_overrun() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_port_open(
            &mut a,
            PortOpen {
                name: "relaylet:popup:main".to_string(),
                metadata: SenderMetadata {
                    instance_id: None,
                    origin: Some("app://popup".to_string()),
                },
            },
        )
        .await
        .unwrap();
        a.write_all(b"trailing").await.unwrap();

        let open = read_port_open(&mut b).await.unwrap();
        assert_eq!(open.name, "relaylet:popup:main");
        assert_eq!(open.metadata.origin.as_deref(), Some("app://popup"));

        let mut rest = [0u8; 8];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"trailing");
    }

    #[tokio::test]
    async fn second_hub_on_same_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let host = UnixHost::bind(dir.path().join("hub.sock")).unwrap();
        let _hub = host.init_background_hub(HubConfig::new()).unwrap();
        assert!(matches!(
            host.init_background_hub(HubConfig::new()),
            Err(HubError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn relays_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let host = UnixHost::bind(&path).unwrap();
        let hub = host.init_background_hub(HubConfig::new()).unwrap();

        let content = UnixEnvironment::new(&path, Role::ContentScript).with_instance_id(3);
        let a = init_connection(&content, "main", |msg: IncomingMessage| {
            let text = msg.payload["text"].as_str().unwrap_or_default().to_uppercase();
            msg.responder.respond(json!(text)).unwrap();
        })
        .await
        .unwrap();
        assert_eq!(
            a.registered().await.unwrap().to_string(),
            "content_script:main:3"
        );

        let background = UnixEnvironment::new(&path, Role::Background);
        let b = init_connection(&background, "hub", |_msg: IncomingMessage| {})
            .await
            .unwrap();
        b.registered().await.unwrap();

        let reply = b
            .request("content_script:main:3", json!({"text": "hi"}))
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, json!("HI"));

        hub.shutdown().await.unwrap();
        drop(host);
        assert!(!path.exists());
    }
}
