//! Local port forwarding (`direct-tcpip`): dial on the client's behalf and
//! pump bytes. No store or registry involvement.

use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;

use super::forward::{pump, ForwardedStream};

/// Decides whether a `direct-tcpip` destination may be dialed.
pub type DirectAuthorizer = Arc<dyn Fn(&str, u32) -> bool + Send + Sync>;

pub fn allow_all() -> DirectAuthorizer {
    Arc::new(|_: &str, _: u32| true)
}

#[derive(Clone)]
pub struct DirectForwarder {
    authorize: DirectAuthorizer,
}

impl Default for DirectForwarder {
    fn default() -> Self {
        Self::new(allow_all())
    }
}

impl DirectForwarder {
    pub fn new(authorize: DirectAuthorizer) -> Self {
        Self { authorize }
    }

    /// Authorize and connect to the requested destination.
    pub async fn dial(&self, host: &str, port: u32) -> Result<TcpStream, TunnelError> {
        if !(self.authorize)(host, port) {
            warn!("direct-tcpip to {}:{} denied", host, port);
            return Err(TunnelError::BindRejected {
                address: host.to_string(),
                port,
            });
        }
        let port = u16::try_from(port).map_err(|_| TunnelError::InvalidPort(port.to_string()))?;
        let stream = TcpStream::connect((host, port)).await?;
        info!("direct-tcpip connected to {}:{}", host, port);
        Ok(stream)
    }

    /// Relay between an accepted channel and the dialed destination.
    pub fn spawn_relay<S>(&self, stream: TcpStream, channel: S, shutdown: CancellationToken)
    where
        S: ForwardedStream + 'static,
    {
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "direct-tcpip".to_string());
        tokio::spawn(async move {
            pump(stream, channel, shutdown, &label).await;
        });
    }
}
