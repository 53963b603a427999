//! In-memory store of webhook configurations.
//!
//! Every query is a predicate match evaluated under the lock; callers only
//! ever receive clones, never an iterator into the map.

use std::collections::HashMap;
use std::sync::Weak;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::error::TunnelError;
use crate::types::{TerminalWriter, TunnelSession, WebhookConfig};

/// Thread-safe repository of webhook configurations, keyed by id.
#[derive(Debug, Default)]
pub struct SessionStore {
    webhooks: RwLock<HashMap<String, WebhookConfig>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<WebhookConfig, TunnelError> {
        let webhooks = self.webhooks.read().await;
        webhooks
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::WebhookNotFound(id.to_string()))
    }

    /// Linear scan over active sessions; cardinality is small.
    pub async fn get_by_session_id(&self, session_id: &str) -> Result<WebhookConfig, TunnelError> {
        let webhooks = self.webhooks.read().await;
        webhooks
            .values()
            .find(|w| {
                w.active_session
                    .as_ref()
                    .is_some_and(|s| s.session_id == session_id)
            })
            .cloned()
            .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))
    }

    pub async fn set(&self, id: &str, config: WebhookConfig) {
        let mut webhooks = self.webhooks.write().await;
        debug!("Storing webhook {}", id);
        webhooks.insert(id.to_string(), config);
    }

    /// Same as [`SessionStore::set`]: upserts.
    pub async fn update(&self, id: &str, config: WebhookConfig) {
        self.set(id, config).await;
    }

    pub async fn delete(&self, id: &str) -> Option<WebhookConfig> {
        let mut webhooks = self.webhooks.write().await;
        let removed = webhooks.remove(id);
        if removed.is_some() {
            info!("Deleted webhook {}", id);
        }
        removed
    }

    /// True iff no stored config uses `port` as its internal port.
    pub async fn is_port_available(&self, port: u16) -> bool {
        let webhooks = self.webhooks.read().await;
        !webhooks
            .values()
            .any(|w| w.internal_server_socket.port == port)
    }

    pub async fn find_by_public_key_and_socket(
        &self,
        fingerprint: &str,
        host: &str,
        port: u16,
    ) -> Result<WebhookConfig, TunnelError> {
        let webhooks = self.webhooks.read().await;
        webhooks
            .values()
            .find(|w| {
                w.public_key_fingerprint == fingerprint
                    && w.internal_server_socket.host == host
                    && w.internal_server_socket.port == port
            })
            .cloned()
            .ok_or(TunnelError::NoMatchingWebhook)
    }

    /// Pick the config a bind request from this key should target.
    ///
    /// A `preferred` id owned by the key wins; otherwise the newest idle
    /// config; otherwise the newest config at all (which is active, so the
    /// caller will hit a conflict).
    pub async fn find_bind_candidate(
        &self,
        fingerprint: &str,
        preferred: Option<&str>,
    ) -> Result<WebhookConfig, TunnelError> {
        let webhooks = self.webhooks.read().await;

        if let Some(config) = preferred
            .and_then(|id| webhooks.get(id))
            .filter(|w| w.public_key_fingerprint == fingerprint)
        {
            return Ok(config.clone());
        }

        let mut owned: Vec<&WebhookConfig> = webhooks
            .values()
            .filter(|w| w.public_key_fingerprint == fingerprint)
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        owned
            .iter()
            .find(|w| !w.is_active())
            .or_else(|| owned.first())
            .map(|w| (*w).clone())
            .ok_or(TunnelError::NoMatchingWebhook)
    }

    pub async fn list_by_public_key(&self, fingerprint: &str) -> Vec<WebhookConfig> {
        let webhooks = self.webhooks.read().await;
        let mut owned: Vec<WebhookConfig> = webhooks
            .values()
            .filter(|w| w.public_key_fingerprint == fingerprint)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        owned
    }

    pub async fn list_all(&self) -> Vec<WebhookConfig> {
        let webhooks = self.webhooks.read().await;
        let mut all: Vec<WebhookConfig> = webhooks.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Atomically claim a config for an SSH session.
    pub async fn try_activate(
        &self,
        id: &str,
        session: TunnelSession,
    ) -> Result<WebhookConfig, TunnelError> {
        let mut webhooks = self.webhooks.write().await;
        let config = webhooks
            .get_mut(id)
            .ok_or_else(|| TunnelError::WebhookNotFound(id.to_string()))?;
        if config.is_active() {
            return Err(TunnelError::SessionAlreadyActive(id.to_string()));
        }
        config.active_session = Some(session);
        Ok(config.clone())
    }

    /// Record the port a session's listener actually bound.
    pub async fn mark_bound(&self, id: &str, session_id: &str, port: u16) -> bool {
        let mut webhooks = self.webhooks.write().await;
        match webhooks
            .get_mut(id)
            .and_then(|w| w.active_session.as_mut())
            .filter(|s| s.session_id == session_id)
        {
            Some(session) => {
                session.bound_port = Some(port);
                true
            }
            None => false,
        }
    }

    /// Attach a terminal to every config owned by `session_id`.
    pub async fn attach_terminal(
        &self,
        session_id: &str,
        terminal: Weak<dyn TerminalWriter>,
    ) -> Result<Vec<WebhookConfig>, TunnelError> {
        let mut webhooks = self.webhooks.write().await;
        let mut attached = Vec::new();
        for config in webhooks.values_mut() {
            if let Some(session) = config
                .active_session
                .as_mut()
                .filter(|s| s.session_id == session_id)
            {
                session.terminal = Some(terminal.clone());
                attached.push(config.clone());
            }
        }
        if attached.is_empty() {
            return Err(TunnelError::SessionNotFound(session_id.to_string()));
        }
        Ok(attached)
    }

    /// Clear the active session of `id` if `session_id` still owns it.
    pub async fn release(&self, id: &str, session_id: &str) -> bool {
        let mut webhooks = self.webhooks.write().await;
        let Some(config) = webhooks.get_mut(id) else {
            return false;
        };
        let owned = config
            .active_session
            .as_ref()
            .is_some_and(|s| s.session_id == session_id);
        if owned {
            config.active_session = None;
            info!("Released webhook {} from session {}", id, session_id);
        }
        owned
    }
}
