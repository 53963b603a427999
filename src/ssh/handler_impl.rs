//! Handler trait implementation for SshHandler.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::HashAlg;

use crate::error::TunnelError;
use crate::terminal_ui;

use super::console::Console;
use super::forward::ChannelOpener;
use super::handler::SshHandler;
use super::types::preferred_webhook;

const INTERRUPT_KEYS: [u8; 2] = [3, 4];

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);

        info!(
            "Public key auth attempt: user='{}', fingerprint='{}'",
            user, fingerprint
        );

        self.username = Some(user.to_string());
        self.public_key_fingerprint = Some(fingerprint.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        info!(
            "Authentication succeeded for user {:?} (session {})",
            self.username, self.session_id
        );
        self.session_handle = Some(session.handle());
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            "tcpip-forward request: address='{}', port={}, session={}",
            address, port, self.session_id
        );

        let opener: Arc<dyn ChannelOpener> = Arc::new(session.handle());
        let preferred = preferred_webhook(self.username.as_deref());
        let result = self
            .forwards
            .tcpip_forward(
                address,
                *port,
                self.public_key_fingerprint.as_deref(),
                preferred.as_deref(),
                opener,
            )
            .await;

        match result {
            Ok(bound) => {
                *port = bound;
                Ok(true)
            }
            Err(e) => {
                self.reject(e.to_string());
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Cancel tcpip-forward: address='{}', port={}", address, port);
        self.forwards.cancel_tcpip_forward(address, port).await;
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "direct-tcpip request: {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );
        match self.direct.dial(host_to_connect, port_to_connect).await {
            Ok(stream) => {
                self.direct
                    .spawn_relay(stream, channel.into_stream(), self.connection.child_token());
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "direct-tcpip to {}:{} failed: {}",
                    host_to_connect, port_to_connect, e
                );
                Ok(false)
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Session channel opened: id={:?}", channel.id());
        self.session_channel_id = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("PTY request on channel {:?}", channel);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel);
        session.channel_success(channel)?;

        if self.send_reason_and_close(channel) {
            return Ok(());
        }

        let console = Console::new(
            self.provisioner.clone(),
            self.public_key_fingerprint.clone(),
        );
        session.data(channel, console.greeting().into_bytes().into())?;
        self.console = Some(console);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).trim().to_string();
        info!("Exec request on channel {:?}: '{}'", channel, command);
        session.channel_success(channel)?;

        if self.send_reason_and_close(channel) {
            return Ok(());
        }
        if command != "tunnel" {
            let mut text = terminal_ui::create_error_line(&format!("unknown command '{}'", command));
            text.push_str(&terminal_ui::create_help_text());
            self.send_and_close(channel, text);
            return Ok(());
        }

        let Some(terminal) = self.session_terminal(channel) else {
            return Ok(());
        };
        let store = self.provisioner.store();
        match store
            .attach_terminal(&self.session_id, Arc::downgrade(&terminal))
            .await
        {
            Ok(configs) => {
                info!(
                    "Session {} attached as terminal of {} webhook(s)",
                    self.session_id,
                    configs.len()
                );
                let message = terminal_ui::create_tunnel_connected_box(&configs);
                session.data(channel, message.into_bytes().into())?;
            }
            Err(e) => {
                warn!("Tunnel session {} has nothing bound: {}", self.session_id, e);
                let text = terminal_ui::create_error_line(
                    "no tunnel is bound by this connection, run setup and use the printed command",
                );
                self.send_and_close(channel, text);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Data received on channel {:?}: {} bytes", channel, data.len());
        if self.session_channel_id != Some(channel) {
            return Ok(());
        }

        let Some(console) = self.console.as_mut() else {
            if data.iter().any(|b| INTERRUPT_KEYS.contains(b)) {
                info!("Tunnel session {} interrupted by user", self.session_id);
                self.send_and_close(channel, "\r\nBye!\r\n".to_string());
            }
            return Ok(());
        };

        let reply = console.handle_input(data).await;
        if reply.close {
            self.console = None;
            self.send_and_close(channel, reply.output);
        } else if !reply.output.is_empty() {
            session.data(channel, reply.output.into_bytes().into())?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("EOF on channel {:?}", channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channel_id == Some(channel) {
            info!("Session channel {:?} closed", channel);
            self.console = None;
            self.session_channel_id = None;
        } else {
            debug!("Channel {:?} closed", channel);
        }
        Ok(())
    }
}
