#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use sshhook::{
    ChannelOpener, ForwardedStream, Provisioner, ProvisionerSettings, SessionStore, TerminalWriter,
    TunnelError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub const FINGERPRINT: &str = "SHA256:integration-test-key";

/// Stands in for the SSH client: every forwarded channel becomes a TCP
/// connection to the "local service".
pub struct TcpOpener {
    pub target: SocketAddr,
}

#[async_trait]
impl ChannelOpener for TcpOpener {
    async fn open_forwarded(
        &self,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
    ) -> Result<Box<dyn ForwardedStream>, TunnelError> {
        Ok(Box::new(TcpStream::connect(self.target).await?))
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Default)]
pub struct Captured(pub Arc<Mutex<Vec<CapturedRequest>>>);

impl Captured {
    pub async fn all(&self) -> Vec<CapturedRequest> {
        self.0.lock().await.clone()
    }
}

async fn capture(
    State(captured): State<Captured>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    captured.0.lock().await.push(CapturedRequest {
        method,
        uri,
        headers,
        body,
    });
    (StatusCode::ACCEPTED, "pong")
}

/// The service on the client machine that webhooks are delivered to.
pub async fn spawn_capture_service() -> (SocketAddr, Captured) {
    let captured = Captured::default();
    let router = Router::new()
        .fallback(capture)
        .with_state(captured.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, captured)
}

pub fn provisioner() -> Arc<Provisioner> {
    Arc::new(Provisioner::new(
        ProvisionerSettings {
            public_base_url: "https://hooks.example.com".to_string(),
            ssh_host: "hooks.example.com".to_string(),
            ssh_port: 2222,
        },
        Arc::new(SessionStore::new()),
    ))
}

pub async fn spawn_proxy(provisioner: Arc<Provisioner>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(sshhook::serve_http_proxy(listener, provisioner));
    addr
}

/// Records everything written to the "terminal".
#[derive(Default)]
pub struct RecordingTerminal {
    pub lines: Mutex<Vec<String>>,
}

#[async_trait]
impl TerminalWriter for RecordingTerminal {
    async fn write_text(&self, text: &str) -> Result<(), TunnelError> {
        self.lines.lock().await.push(text.to_string());
        Ok(())
    }
}
