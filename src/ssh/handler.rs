//! Per-connection SSH handler state.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::server::Handle;
use russh::ChannelId;
use tokio_util::sync::CancellationToken;

use crate::provisioner::Provisioner;
use crate::terminal_ui;
use crate::types::TerminalWriter;

use super::console::Console;
use super::direct::DirectForwarder;
use super::forward::RemoteForwards;
use super::types::{generate_session_id, SessionTerminal};

/// Handler for a single SSH connection.
pub struct SshHandler {
    pub(super) provisioner: Arc<Provisioner>,
    pub(super) direct: DirectForwarder,
    pub(super) peer_addr: Option<SocketAddr>,
    pub(super) username: Option<String>,
    pub(super) session_id: String,
    pub(super) public_key_fingerprint: Option<String>,
    /// Cancelled when the connection goes away
    pub(super) connection: CancellationToken,
    pub(super) forwards: RemoteForwards,
    pub(super) session_handle: Option<Handle>,
    pub(super) session_channel_id: Option<ChannelId>,
    pub(super) console: Option<Console>,
    /// Owned here; configs only see it through a weak reference
    pub(super) terminal: Option<Arc<dyn TerminalWriter>>,
    /// Why a bind from this connection was refused
    pub(super) close_reason: Option<String>,
}

impl SshHandler {
    pub fn new(
        provisioner: Arc<Provisioner>,
        direct: DirectForwarder,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let session_id = generate_session_id();
        let connection = CancellationToken::new();
        let forwards = RemoteForwards::new(
            provisioner.store().clone(),
            session_id.clone(),
            connection.clone(),
        );
        Self {
            provisioner,
            direct,
            peer_addr,
            username: None,
            session_id,
            public_key_fingerprint: None,
            connection,
            forwards,
            session_handle: None,
            session_channel_id: None,
            console: None,
            terminal: None,
            close_reason: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Remember a refused bind and tell the client if its session is open.
    pub(super) fn reject(&mut self, reason: String) {
        warn!(
            "Session {} from {:?} refused: {}",
            self.session_id, self.peer_addr, reason
        );
        self.close_reason = Some(reason);
        if let Some(channel) = self.session_channel_id {
            self.send_reason_and_close(channel);
        }
    }

    /// Print the stored rejection, if any, then close `channel`.
    pub(super) fn send_reason_and_close(&self, channel: ChannelId) -> bool {
        let Some(reason) = self.close_reason.as_deref() else {
            return false;
        };
        self.send_and_close(channel, terminal_ui::create_rejection_box(reason));
        true
    }

    pub(super) fn send_and_close(&self, channel: ChannelId, text: String) {
        let Some(handle) = self.session_handle.clone() else {
            return;
        };
        tokio::spawn(async move {
            if !text.is_empty() {
                let _ = handle.data(channel, text.into_bytes().into()).await;
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
    }

    /// Writer for the session channel, created on first use.
    pub(super) fn session_terminal(&mut self, channel: ChannelId) -> Option<Arc<dyn TerminalWriter>> {
        if self.terminal.is_none() {
            let handle = self.session_handle.clone()?;
            self.terminal = Some(Arc::new(SessionTerminal::new(handle, channel)));
        }
        self.terminal.clone()
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        info!(
            "SSH connection {} closed (peer {:?}, user {:?})",
            self.session_id, self.peer_addr, self.username
        );
        // Listeners and relays owned by this connection shut down with it.
        self.connection.cancel();
        debug!("Cancelled connection token for {}", self.session_id);
    }
}
