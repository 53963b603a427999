//! Centralized configuration management for the webhook tunnel server.
//!
//! Configuration comes from environment variables (optionally seeded from a
//! `.env` file). Every variable has a default; invalid values are a start-up
//! error.

use std::net::SocketAddr;
use std::sync::OnceLock;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const SSH_ADDR: &str = "SSH_ADDR";
    pub const HTTP_ADDR: &str = "HTTP_ADDR";
    pub const MANAGEMENT_ADDR: &str = "MANAGEMENT_ADDR";
    pub const PUBLIC_URL: &str = "PUBLIC_URL";
    pub const INTERNAL_URL: &str = "INTERNAL_URL";
    pub const SSH_PUBLIC_HOST: &str = "SSH_PUBLIC_HOST";
    pub const SSH_PUBLIC_PORT: &str = "SSH_PUBLIC_PORT";
    pub const SERVER_KEY_PATH: &str = "SERVER_KEY_PATH";
    pub const APP_ENV: &str = "APP_ENV";
}

const DEFAULT_SSH_ADDR: &str = "0.0.0.0:2222";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:4001";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:4001";
const DEFAULT_SSH_PUBLIC_HOST: &str = "localhost";
const DEFAULT_SERVER_KEY_PATH: &str = "keys/hostkey";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not a valid socket address: '{value}'")]
    InvalidAddress { name: &'static str, value: String },

    #[error("{name} must be an http(s) URL, got '{value}'")]
    InvalidUrl { name: &'static str, value: String },

    #[error("{name} is not a valid port: '{value}'")]
    InvalidPort { name: &'static str, value: String },
}

// ============================================================================
// Global configuration (loaded once at startup)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub management_addr: Option<SocketAddr>,
    /// Base of the public webhook URLs (e.g. "https://hooks.example.com")
    pub public_url: String,
    /// Base used for webhook URLs in development mode
    pub internal_url: String,
    /// Host name printed in tunnel commands
    pub ssh_public_host: String,
    pub ssh_public_port: u16,
    pub server_key_path: String,
    pub development: bool,
}

impl Config {
    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let ssh_addr = parse_addr(env::SSH_ADDR, &var(env::SSH_ADDR, DEFAULT_SSH_ADDR))?;
        let http_addr = parse_addr(env::HTTP_ADDR, &var(env::HTTP_ADDR, DEFAULT_HTTP_ADDR))?;
        let management_addr = lookup(env::MANAGEMENT_ADDR)
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_addr(env::MANAGEMENT_ADDR, &v))
            .transpose()?;

        let public_url = parse_base_url(env::PUBLIC_URL, &var(env::PUBLIC_URL, DEFAULT_PUBLIC_URL))?;
        let internal_url =
            parse_base_url(env::INTERNAL_URL, &var(env::INTERNAL_URL, DEFAULT_PUBLIC_URL))?;

        let ssh_public_port = match lookup(env::SSH_PUBLIC_PORT) {
            Some(value) => value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                name: env::SSH_PUBLIC_PORT,
                value,
            })?,
            None => ssh_addr.port(),
        };

        let development = lookup(env::APP_ENV)
            .map(|v| v.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        Ok(Self {
            ssh_addr,
            http_addr,
            management_addr,
            public_url,
            internal_url,
            ssh_public_host: var(env::SSH_PUBLIC_HOST, DEFAULT_SSH_PUBLIC_HOST),
            ssh_public_port,
            server_key_path: var(env::SERVER_KEY_PATH, DEFAULT_SERVER_KEY_PATH),
            development,
        })
    }

    fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Base URL shown to users for their webhooks.
    pub fn webhook_base_url(&self) -> &str {
        if self.development {
            &self.internal_url
        } else {
            &self.public_url
        }
    }
}

fn parse_addr(name: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidAddress {
        name,
        value: value.to_string(),
    })
}

fn parse_base_url(name: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    match reqwest::Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
            Ok(trimmed.to_string())
        }
        _ => Err(ConfigError::InvalidUrl {
            name,
            value: value.to_string(),
        }),
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize configuration. Must be called once at startup.
pub fn init() -> Result<&'static Config, ConfigError> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = Config::load()?;
    Ok(CONFIG.get_or_init(|| config))
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG.get().expect("Config not initialized. Call config::init() first.")
}

pub fn is_development() -> bool {
    CONFIG.get().is_some_and(|c| c.development)
}
