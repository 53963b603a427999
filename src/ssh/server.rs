//! SSH server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use russh::server::{Handler, Server};

use super::direct::DirectForwarder;
use super::SshHandler;
use crate::provisioner::Provisioner;

/// The main SSH server that creates handlers for each connection.
#[derive(Clone)]
pub struct TunnelServer {
    provisioner: Arc<Provisioner>,
    direct: DirectForwarder,
}

impl TunnelServer {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self::with_direct_forwarder(provisioner, DirectForwarder::default())
    }

    pub fn with_direct_forwarder(provisioner: Arc<Provisioner>, direct: DirectForwarder) -> Self {
        Self {
            provisioner,
            direct,
        }
    }
}

impl Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let handler = SshHandler::new(self.provisioner.clone(), self.direct.clone(), peer_addr);
        info!(
            "New SSH connection from {:?} (session {})",
            peer_addr,
            handler.session_id()
        );
        handler
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("Session error: {:?}", error);
    }
}
