//! Provisioning of webhook configurations and their internal sockets.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use reqwest::Url;

use crate::error::TunnelError;
use crate::store::SessionStore;
use crate::types::{Socket, WebhookConfig};

/// Lowest internal port handed out.
pub const MIN_INTERNAL_PORT: u16 = 20000;
/// Highest internal port handed out.
pub const MAX_INTERNAL_PORT: u16 = 65000;
/// Give up looking for a free internal port after this many draws.
pub const MAX_PORT_ATTEMPTS: usize = 50;

const INTERNAL_HOST: &str = "127.0.0.1";

/// Static settings the provisioner needs to render URLs and commands.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Base of the URLs handed to users, without trailing slash
    pub public_base_url: String,
    pub ssh_host: String,
    pub ssh_port: u16,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:4001".to_string(),
            ssh_host: "localhost".to_string(),
            ssh_port: 2222,
        }
    }
}

/// Builds webhook configurations and resolves them for the proxy.
pub struct Provisioner {
    settings: ProvisionerSettings,
    store: Arc<SessionStore>,
}

impl Provisioner {
    pub fn new(settings: ProvisionerSettings, store: Arc<SessionStore>) -> Self {
        Self { settings, store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Validate `target_url` and build a fresh, inactive configuration.
    ///
    /// The caller attaches the public key fingerprint and persists the result.
    pub async fn get_hook_config(&self, target_url: &str) -> Result<WebhookConfig, TunnelError> {
        let parsed = parse_target(target_url)?;

        let scheme = parsed.scheme().to_string();
        let host = match parsed.host_str() {
            Some("localhost") => INTERNAL_HOST.to_string(),
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(TunnelError::InvalidHost),
        };
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| TunnelError::InvalidPort(target_url.to_string()))?;

        let id = generate_webhook_id();
        let internal_socket = self.provision_socket().await?;
        let path = normalize_path(parsed.path());

        let public_url = format!("{}/{}", self.settings.public_base_url, id);
        let internal_url = format!("{}://{}{}", scheme, internal_socket, path);

        Ok(WebhookConfig {
            id,
            public_key_fingerprint: String::new(),
            client_socket: Socket::new(host, port),
            internal_server_socket: internal_socket,
            scheme,
            path,
            public_url,
            internal_url,
            created_at: Utc::now(),
            active_session: None,
        })
    }

    /// Provision a webhook for `target` owned by `fingerprint` and store it.
    pub async fn create_webhook(
        &self,
        fingerprint: &str,
        target: &str,
    ) -> Result<WebhookConfig, TunnelError> {
        let mut config = self.get_hook_config(&normalize_target(target)).await?;
        config.public_key_fingerprint = fingerprint.to_string();
        self.store.set(&config.id, config.clone()).await;
        info!(
            "Created webhook {} -> {} for {}",
            config.id, config.client_socket, fingerprint
        );
        Ok(config)
    }

    pub fn tunnel_command(&self, config: &WebhookConfig) -> String {
        config.tunnel_command(&self.settings.ssh_host, self.settings.ssh_port)
    }

    /// Loopback socket on a port no stored config uses.
    pub async fn provision_socket(&self) -> Result<Socket, TunnelError> {
        let port = self.random_unassigned_port().await?;
        Ok(Socket::new(INTERNAL_HOST, port))
    }

    pub async fn random_unassigned_port(&self) -> Result<u16, TunnelError> {
        for _ in 0..MAX_PORT_ATTEMPTS {
            let candidate = rand::thread_rng().gen_range(MIN_INTERNAL_PORT..=MAX_INTERNAL_PORT);
            if self.store.is_port_available(candidate).await {
                return Ok(candidate);
            }
        }
        warn!("No free internal port after {} attempts", MAX_PORT_ATTEMPTS);
        Err(TunnelError::PortsExhausted {
            attempts: MAX_PORT_ATTEMPTS,
        })
    }

    pub async fn get_config(&self, id: &str) -> Result<WebhookConfig, TunnelError> {
        self.store.get_by_id(id).await
    }

    pub async fn get_forwarding_address(&self, id: &str) -> Result<Url, TunnelError> {
        let config = self.store.get_by_id(id).await?;
        Url::parse(&config.internal_url).map_err(|_| TunnelError::InvalidUrl(config.internal_url))
    }

    /// Remove a config and close the listener of any session holding it.
    ///
    /// The config leaves the store before the session is cancelled, so a
    /// bind racing with this call finds nothing to activate.
    pub async fn deprovision(&self, id: &str) -> Result<WebhookConfig, TunnelError> {
        let removed = self
            .store
            .delete(id)
            .await
            .ok_or_else(|| TunnelError::WebhookNotFound(id.to_string()))?;
        if let Some(session) = &removed.active_session {
            info!(
                "Closing listener of webhook {} held by session {}",
                id, session.session_id
            );
            session.shutdown.cancel();
        }
        Ok(removed)
    }
}

/// Prefix `http://` when the input carries no scheme.
pub fn normalize_target(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Ensure a path starts with `/`.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Append the part of a public request path after the webhook id, and its
/// query, to a config's internal URL.
pub fn forwarding_url(
    config: &WebhookConfig,
    suffix: &str,
    query: Option<&str>,
) -> Result<Url, TunnelError> {
    let mut target = config.internal_url.clone();
    let suffix = suffix.trim_start_matches('/');
    if !suffix.is_empty() {
        if !target.ends_with('/') {
            target.push('/');
        }
        target.push_str(suffix);
    }
    let mut url = Url::parse(&target).map_err(|_| TunnelError::InvalidUrl(target.clone()))?;
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.set_query(Some(q));
    }
    Ok(url)
}

/// 128 random bits from the OS, hex encoded.
pub fn generate_webhook_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn parse_target(target_url: &str) -> Result<Url, TunnelError> {
    let parsed = match Url::parse(target_url.trim()) {
        Ok(url) => url,
        Err(url::ParseError::EmptyHost) => return Err(TunnelError::InvalidHost),
        Err(url::ParseError::InvalidPort) => {
            return Err(TunnelError::InvalidPort(target_url.to_string()))
        }
        Err(_) => return Err(TunnelError::InvalidUrl(target_url.to_string())),
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(TunnelError::InvalidScheme(parsed.scheme().to_string()));
    }
    Ok(parsed)
}
