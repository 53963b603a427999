//! Webhook configuration and tunnel session types shared by every layer.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socket {
    pub host: String,
    pub port: u16,
}

impl Socket {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Something that can print text on the terminal of a live SSH session.
///
/// Configs only ever hold a [`Weak`] reference to a writer: the SSH connection
/// owns it, and once the connection is gone the reference simply stops
/// upgrading.
#[async_trait]
pub trait TerminalWriter: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<(), TunnelError>;
}

/// The SSH connection currently bound to a webhook.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Port the listener actually bound, once the bind succeeded
    pub bound_port: Option<u16>,
    pub terminal: Option<Weak<dyn TerminalWriter>>,
    /// Cancelling this closes the listener owned by the session
    pub shutdown: CancellationToken,
}

impl TunnelSession {
    pub fn new(session_id: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            bound_port: None,
            terminal: None,
            shutdown,
        }
    }

    /// The live terminal, if one is attached and its connection still exists.
    pub fn terminal(&self) -> Option<Arc<dyn TerminalWriter>> {
        self.terminal.as_ref().and_then(Weak::upgrade)
    }
}

/// A provisioned tunnel endpoint.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub id: String,
    /// SHA-256 fingerprint of the key that ran `setup`
    pub public_key_fingerprint: String,
    /// Service on the client machine, e.g. 127.0.0.1:3000
    pub client_socket: Socket,
    /// Loopback socket on this server where public requests are injected
    pub internal_server_socket: Socket,
    pub scheme: String,
    pub path: String,
    pub public_url: String,
    pub internal_url: String,
    pub created_at: DateTime<Utc>,
    pub active_session: Option<TunnelSession>,
}

impl WebhookConfig {
    pub fn is_active(&self) -> bool {
        self.active_session.is_some()
    }

    pub fn tunnel_command(&self, ssh_host: &str, ssh_port: u16) -> String {
        format!(
            "ssh -R 0:{} {} -p {} tunnel",
            self.client_socket, ssh_host, ssh_port
        )
    }
}

impl fmt::Display for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientSocket: {}\nInternalServerSocket: {}\nPublicURL: {}\nInternalURL: {}\n",
            self.client_socket, self.internal_server_socket, self.public_url, self.internal_url
        )
    }
}

/// Per-request record pushed to the bound terminal by the HTTP proxy.
#[derive(Debug, Clone)]
pub struct RequestAnalytic {
    pub method: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
    pub time_taken: Duration,
    pub request_body_size: usize,
    pub response_body_size: usize,
    pub response_code: u16,
}

impl fmt::Display for RequestAnalytic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} from {} -> {} | req {}B | resp {}B | {}ms",
            self.received_at.format("%Y-%m-%d %H:%M:%S"),
            self.method,
            self.from,
            self.response_code,
            self.request_body_size,
            self.response_body_size,
            self.time_taken.as_millis()
        )
    }
}
