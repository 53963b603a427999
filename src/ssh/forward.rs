//! Remote port forwarding (`tcpip-forward` / `cancel-tcpip-forward`).
//!
//! A bind request never names the port it wants. The client always asks for
//! `localhost:0`, and the request is matched to a webhook set up earlier by
//! the same public key. The listener is bound on that webhook's internal
//! socket and every inbound connection is relayed over a fresh
//! `forwarded-tcpip` channel back to the client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::Handle;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::store::SessionStore;
use crate::types::TunnelSession;

/// The only bind address accepted from clients.
pub const CANONICAL_BIND_ADDRESS: &str = "localhost";

static NEXT_FORWARD_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream of an SSH channel opened back to the client.
pub trait ForwardedStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardedStream for T {}

/// Opens `forwarded-tcpip` channels towards the SSH client.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_forwarded(
        &self,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Box<dyn ForwardedStream>, TunnelError>;
}

#[async_trait]
impl ChannelOpener for Handle {
    async fn open_forwarded(
        &self,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Box<dyn ForwardedStream>, TunnelError> {
        let channel = self
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await
            .map_err(|e| TunnelError::ChannelOpen(format!("{:?}", e)))?;
        Ok(Box::new(channel.into_stream()))
    }
}

struct ForwardEntry {
    forward_id: u64,
    webhook_id: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, ForwardEntry>>>;

/// Remote forwards owned by one SSH connection.
pub struct RemoteForwards {
    store: Arc<SessionStore>,
    session_id: String,
    connection: CancellationToken,
    registry: Registry,
}

impl RemoteForwards {
    /// `connection` is cancelled when the owning SSH connection goes away;
    /// every listener created here is shut down with it.
    pub fn new(
        store: Arc<SessionStore>,
        session_id: impl Into<String>,
        connection: CancellationToken,
    ) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            connection,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Handle a `tcpip-forward` request and return the bound port.
    ///
    /// `preferred` pins which of the key's webhooks to bind; without it the
    /// newest idle one is chosen.
    pub async fn tcpip_forward(
        &self,
        address: &str,
        port: u32,
        fingerprint: Option<&str>,
        preferred: Option<&str>,
        opener: Arc<dyn ChannelOpener>,
    ) -> Result<u32, TunnelError> {
        if address != CANONICAL_BIND_ADDRESS || port != 0 {
            return Err(TunnelError::BindRejected {
                address: address.to_string(),
                port,
            });
        }
        let fingerprint = fingerprint.ok_or(TunnelError::MissingPublicKey)?;

        let candidate = self.store.find_bind_candidate(fingerprint, preferred).await?;
        let internal = candidate.internal_server_socket;
        let config = self
            .store
            .find_by_public_key_and_socket(fingerprint, &internal.host, internal.port)
            .await?;

        let shutdown = self.connection.child_token();
        self.store
            .try_activate(
                &config.id,
                TunnelSession::new(self.session_id.clone(), shutdown.clone()),
            )
            .await?;

        let listener = match TcpListener::bind((internal.host.as_str(), internal.port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.store.release(&config.id, &self.session_id).await;
                return Err(TunnelError::BindFailed {
                    address: internal.to_string(),
                    source,
                });
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                self.store.release(&config.id, &self.session_id).await;
                return Err(e.into());
            }
        };
        self.store
            .mark_bound(&config.id, &self.session_id, bound_port)
            .await;

        let key = registry_key(address, u32::from(bound_port));
        let forward_id = NEXT_FORWARD_ID.fetch_add(1, Ordering::Relaxed);
        let accept = AcceptLoop {
            listener,
            opener,
            connected_address: address.to_string(),
            connected_port: u32::from(bound_port),
            shutdown: shutdown.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            key: key.clone(),
            forward_id,
            webhook_id: config.id.clone(),
            session_id: self.session_id.clone(),
        };

        // Held across the spawn so the loop cannot clean up before its entry exists.
        let mut registry = self.registry.lock().await;
        let task = tokio::spawn(accept.run());
        registry.insert(
            key,
            ForwardEntry {
                forward_id,
                webhook_id: config.id.clone(),
                shutdown,
                task,
            },
        );
        drop(registry);

        info!(
            "Webhook {} bound on {}:{} for session {}",
            config.id, internal.host, bound_port, self.session_id
        );
        Ok(u32::from(bound_port))
    }

    /// Handle a `cancel-tcpip-forward` request. Unknown forwards are ignored.
    ///
    /// Returns once the listener is closed and the webhook released.
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) {
        let entries: Vec<ForwardEntry> = {
            let mut registry = self.registry.lock().await;
            if port == 0 {
                let prefix = format!("{}:", address);
                let keys: Vec<String> = registry
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.iter().filter_map(|k| registry.remove(k)).collect()
            } else {
                registry.remove(&registry_key(address, port)).into_iter().collect()
            }
        };

        if entries.is_empty() {
            debug!("No forward registered for {}:{}", address, port);
            return;
        }
        for entry in entries {
            info!("Cancelling forward of webhook {}", entry.webhook_id);
            entry.shutdown.cancel();
            if let Err(e) = entry.task.await {
                warn!("Accept loop for {} ended abnormally: {}", entry.webhook_id, e);
            }
        }
    }

    /// Webhook ids currently bound by this connection.
    pub async fn bound_webhooks(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        registry.values().map(|e| e.webhook_id.clone()).collect()
    }
}

fn registry_key(address: &str, port: u32) -> String {
    format!("{}:{}", address, port)
}

struct AcceptLoop {
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    connected_address: String,
    connected_port: u32,
    shutdown: CancellationToken,
    store: Arc<SessionStore>,
    registry: Registry,
    key: String,
    forward_id: u64,
    webhook_id: String,
    session_id: String,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, origin)) => {
                        debug!("Inbound connection from {} for webhook {}", origin, self.webhook_id);
                        tokio::spawn(relay(
                            stream,
                            origin,
                            self.opener.clone(),
                            self.connected_address.clone(),
                            self.connected_port,
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed for webhook {}: {}", self.webhook_id, e);
                        break;
                    }
                }
            }
        }

        let AcceptLoop {
            listener,
            store,
            registry,
            key,
            forward_id,
            webhook_id,
            session_id,
            ..
        } = self;
        drop(listener);

        {
            let mut registry = registry.lock().await;
            if registry.get(&key).is_some_and(|e| e.forward_id == forward_id) {
                registry.remove(&key);
            }
        }
        store.release(&webhook_id, &session_id).await;
        info!("Listener for webhook {} closed", webhook_id);
    }
}

/// Pump bytes between an inbound connection and a new channel to the client.
async fn relay(
    inbound: TcpStream,
    origin: SocketAddr,
    opener: Arc<dyn ChannelOpener>,
    connected_address: String,
    connected_port: u32,
    shutdown: CancellationToken,
) {
    let channel = match opener
        .open_forwarded(
            &connected_address,
            connected_port,
            &origin.ip().to_string(),
            u32::from(origin.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Could not open forwarded channel for {}: {}", origin, e);
            return;
        }
    };

    pump(inbound, channel, shutdown, &origin.to_string()).await;
}

/// Copy both directions until either side finishes or `shutdown` fires.
pub(super) async fn pump<A, B>(mut a: A, mut b: B, shutdown: CancellationToken, label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = copy_bidirectional(&mut a, &mut b) => match result {
            Ok((sent, received)) => debug!(
                "Relay {} done: {} bytes out, {} bytes back",
                label, sent, received
            ),
            Err(e) => debug!("Relay {} closed: {}", label, e),
        },
        _ = shutdown.cancelled() => debug!("Relay {} cancelled", label),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::provisioner::{Provisioner, ProvisionerSettings};

    const FINGERPRINT: &str = "SHA256:test-key";

    /// Opens "channels" as plain TCP connections to a local service.
    struct TcpOpener {
        target: SocketAddr,
    }

    #[async_trait]
    impl ChannelOpener for TcpOpener {
        async fn open_forwarded(
            &self,
            _connected_address: &str,
            _connected_port: u32,
            _originator_address: &str,
            _originator_port: u32,
        ) -> Result<Box<dyn ForwardedStream>, TunnelError> {
            let stream = TcpStream::connect(self.target).await?;
            Ok(Box::new(stream))
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });
        addr
    }

    async fn setup() -> (Arc<SessionStore>, String, Arc<dyn ChannelOpener>) {
        let store = Arc::new(SessionStore::new());
        let provisioner = Provisioner::new(ProvisionerSettings::default(), store.clone());
        let mut config = provisioner
            .get_hook_config("http://127.0.0.1:3000/hook")
            .await
            .unwrap();
        config.public_key_fingerprint = FINGERPRINT.to_string();
        let id = config.id.clone();
        store.set(&id, config).await;

        let opener: Arc<dyn ChannelOpener> = Arc::new(TcpOpener {
            target: echo_server().await,
        });
        (store, id, opener)
    }

    fn forwards(store: &Arc<SessionStore>, session_id: &str) -> (RemoteForwards, CancellationToken) {
        let connection = CancellationToken::new();
        (
            RemoteForwards::new(store.clone(), session_id, connection.clone()),
            connection,
        )
    }

    async fn wait_until_released(store: &SessionStore, id: &str) {
        for _ in 0..200 {
            if !store.get_by_id(id).await.unwrap().is_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("webhook {} was never released", id);
    }

    async fn echo_through(port: u32, payload: Vec<u8>) -> Vec<u8> {
        let stream = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        write.await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_rejects_non_canonical_requests() {
        let (store, _id, opener) = setup().await;
        let (forwards, _conn) = forwards(&store, "ssh-1");

        let err = forwards
            .tcpip_forward("0.0.0.0", 0, Some(FINGERPRINT), None, opener.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindRejected { port: 0, .. }));

        let err = forwards
            .tcpip_forward("localhost", 8080, Some(FINGERPRINT), None, opener.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindRejected { port: 8080, .. }));

        let err = forwards
            .tcpip_forward("localhost", 0, None, None, opener.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MissingPublicKey));

        let err = forwards
            .tcpip_forward("localhost", 0, Some("SHA256:other"), None, opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoMatchingWebhook));
        assert!(forwards.bound_webhooks().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_activates_webhook() {
        let (store, id, opener) = setup().await;
        let (forwards, _conn) = forwards(&store, "ssh-1");

        let port = forwards
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .unwrap();

        let config = store.get_by_id(&id).await.unwrap();
        assert_eq!(u32::from(config.internal_server_socket.port), port);
        let session = config.active_session.unwrap();
        assert_eq!(session.session_id, "ssh-1");
        assert_eq!(session.bound_port, Some(port as u16));
        assert_eq!(forwards.bound_webhooks().await, vec![id]);
    }

    #[tokio::test]
    async fn test_second_bind_conflicts_and_first_keeps_serving() {
        let (store, id, opener) = setup().await;
        let (first, _c1) = forwards(&store, "ssh-1");
        let (second, _c2) = forwards(&store, "ssh-2");

        let port = first
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener.clone())
            .await
            .unwrap();
        let err = second
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), Some(&id), opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::SessionAlreadyActive(_)));

        let config = store.get_by_id(&id).await.unwrap();
        assert_eq!(config.active_session.unwrap().session_id, "ssh-1");
        assert_eq!(echo_through(port, b"still here".to_vec()).await, b"still here");
    }

    #[tokio::test]
    async fn test_cancel_releases_and_allows_rebind() {
        let (store, id, opener) = setup().await;
        let (first, _c1) = forwards(&store, "ssh-1");

        let port = first
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener.clone())
            .await
            .unwrap();
        first.cancel_tcpip_forward("localhost", port).await;

        assert!(!store.get_by_id(&id).await.unwrap().is_active());
        assert!(first.bound_webhooks().await.is_empty());

        // Idempotent
        first.cancel_tcpip_forward("localhost", port).await;
        first.cancel_tcpip_forward("localhost", 1).await;

        let (second, _c2) = forwards(&store, "ssh-2");
        let rebound = second
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .unwrap();
        assert_eq!(rebound, port);
    }

    #[tokio::test]
    async fn test_connection_close_releases_webhook() {
        let (store, id, opener) = setup().await;
        let (first, connection) = forwards(&store, "ssh-1");

        first
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener.clone())
            .await
            .unwrap();
        connection.cancel();
        wait_until_released(&store, &id).await;

        let (second, _c2) = forwards(&store, "ssh-2");
        assert!(second
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back_activation() {
        let (store, id, opener) = setup().await;
        let internal = store.get_by_id(&id).await.unwrap().internal_server_socket;
        let _squatter = TcpListener::bind((internal.host.as_str(), internal.port))
            .await
            .unwrap();

        let (forwards, _conn) = forwards(&store, "ssh-1");
        let err = forwards
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindFailed { .. }));
        assert!(!store.get_by_id(&id).await.unwrap().is_active());
        assert!(forwards.bound_webhooks().await.is_empty());
    }

    #[tokio::test]
    async fn test_relays_many_concurrent_connections() {
        let (store, _id, opener) = setup().await;
        let (forwards, _conn) = forwards(&store, "ssh-1");
        let port = forwards
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..100u32 {
            tasks.push(tokio::spawn(async move {
                let payload: Vec<u8> = format!("connection-{}-", i).repeat(64).into_bytes();
                let received = echo_through(port, payload.clone()).await;
                assert_eq!(received, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_relays_multi_megabyte_stream_in_order() {
        let (store, _id, opener) = setup().await;
        let (forwards, _conn) = forwards(&store, "ssh-1");
        let port = forwards
            .tcpip_forward("localhost", 0, Some(FINGERPRINT), None, opener)
            .await
            .unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let received = echo_through(port, payload.clone()).await;
        assert_eq!(received.len(), payload.len());
        assert!(received == payload);
    }
}
