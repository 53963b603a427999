//! Webhook tunnel server
//!
//! Runs the SSH server, the public HTTP proxy and, when configured, the
//! management API in one process.
//!
//! ## Usage
//! ```bash
//! ssh -p 2222 localhost                                  # run `setup`
//! ssh -R 0:localhost:3000 localhost -p 2222 tunnel       # keep open
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use russh::server::Server;

use sshhook::config;
use sshhook::{
    load_server_key, run_http_proxy, run_management_api, Provisioner, ProvisionerSettings,
    SessionStore, TunnelServer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::init()?;
    info!("Starting webhook tunnel server...");
    if config.development {
        info!("Development mode enabled");
    }

    let key = load_server_key(Path::new(&config.server_key_path), config.development)?;

    let store = Arc::new(SessionStore::new());
    let provisioner = Arc::new(Provisioner::new(
        ProvisionerSettings {
            public_base_url: config.webhook_base_url().to_string(),
            ssh_host: config.ssh_public_host.clone(),
            ssh_port: config.ssh_public_port,
        },
        store,
    ));

    let ssh_config = Arc::new(russh::server::Config {
        methods: russh::MethodSet::PUBLICKEY,
        server_id: russh::SshId::Standard(format!(
            "SSH-2.0-sshhook-{}",
            env!("CARGO_PKG_VERSION")
        )),
        keys: vec![key],
        inactivity_timeout: Some(Duration::from_secs(1800)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });

    let proxy = tokio::spawn(run_http_proxy(provisioner.clone(), config.http_addr));

    if let Some(addr) = config.management_addr {
        let provisioner = provisioner.clone();
        tokio::spawn(async move {
            if let Err(e) = run_management_api(provisioner, addr).await {
                error!("Management API failed: {}", e);
            }
        });
    }

    let mut server = TunnelServer::new(provisioner);
    info!("SSH server listening on {}", config.ssh_addr);
    info!(
        "Create a webhook with: ssh -p {} {}",
        config.ssh_public_port, config.ssh_public_host
    );

    tokio::select! {
        result = server.run_on_address(ssh_config, config.ssh_addr) => result?,
        result = proxy => result??,
    }

    Ok(())
}
