//! Webhook tunnels over plain SSH remote port forwarding.
//!
//! A client runs `setup` over SSH to get a public URL, then keeps
//! `ssh -R 0:<local service> <server> tunnel` open. Requests to the public
//! URL are proxied through the SSH connection to the local service.

pub mod config;
pub mod error;
pub mod key;
pub mod management;
pub mod provisioner;
pub mod proxy;
pub mod ssh;
pub mod store;
pub mod terminal_ui;
pub mod types;

pub use config::{is_development, Config, ConfigError};
pub use error::{ErrorKind, TunnelError};
pub use key::load_server_key;
pub use management::{create_management_router, run_management_api};
pub use provisioner::{Provisioner, ProvisionerSettings};
pub use proxy::{run_http_proxy, serve_http_proxy};
pub use ssh::{ChannelOpener, ForwardedStream, RemoteForwards, SshHandler, TunnelServer};
pub use store::SessionStore;
pub use types::{RequestAnalytic, Socket, TerminalWriter, TunnelSession, WebhookConfig};
