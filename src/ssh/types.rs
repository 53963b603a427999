//! SSH session helpers shared by the handler modules.

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use russh::server::Handle;
use russh::ChannelId;

use crate::error::TunnelError;
use crate::types::TerminalWriter;

pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    format!("ssh-{}", hex::encode(bytes))
}

/// An SSH username that names a webhook pins the bind to that webhook.
///
/// Ids are lowercase hex, so the username is lowercased before lookup.
pub fn preferred_webhook(username: Option<&str>) -> Option<String> {
    username
        .filter(|u| u.len() == 32 && u.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

/// Writes text on the session channel of a live SSH connection.
pub struct SessionTerminal {
    handle: Handle,
    channel: ChannelId,
}

impl SessionTerminal {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl TerminalWriter for SessionTerminal {
    async fn write_text(&self, text: &str) -> Result<(), TunnelError> {
        self.handle
            .data(self.channel, text.as_bytes().to_vec().into())
            .await
            .map_err(|_| {
                TunnelError::IoError(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "session channel closed",
                ))
            })
    }
}
