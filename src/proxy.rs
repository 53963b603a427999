//! Public HTTP surface: `/{id}[/...]` is forwarded to the webhook's internal
//! listener, and a one-line summary is pushed to the bound SSH terminal.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;

use crate::error::{ErrorKind, TunnelError};
use crate::provisioner::{forwarding_url, Provisioner};
use crate::terminal_ui;
use crate::types::RequestAnalytic;

/// Headers that describe a single hop and are never relayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
    "content-length",
];

struct ProxyState {
    provisioner: Arc<Provisioner>,
    client: reqwest::Client,
}

/// Split `/id/rest` into `("id", "/rest")`.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

pub fn status_for(err: &TunnelError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn error_response(err: &TunnelError) -> Response<Body> {
    text_response(status_for(err), &err.to_string())
}

async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Response<Body> {
    let received_at = Utc::now();
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let (id, suffix) = split_path(parts.uri.path());

    if id.is_empty() {
        return text_response(StatusCode::NOT_FOUND, "webhook id missing from path");
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body from {}: {}", remote_addr, e);
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read request body: {}", e),
            );
        }
    };

    let config = match state.provisioner.get_config(id).await {
        Ok(config) => config,
        Err(e) => {
            debug!("No webhook for {} {}: {}", parts.method, parts.uri, e);
            return error_response(&e);
        }
    };
    let url = match forwarding_url(&config, suffix, parts.uri.query()) {
        Ok(url) => url,
        Err(e) => return error_response(&e),
    };

    info!("{} /{} -> {}", parts.method, id, url);

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    let request_body_size = body.len();

    let upstream = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let (response, response_body_size) = match upstream {
        Ok(upstream) => relay_response(upstream),
        Err(e) => {
            let err = TunnelError::Upstream(e.to_string());
            warn!("Webhook {}: {}", id, err);
            let response = error_response(&err);
            let size = response_size(&response);
            (response, size)
        }
    };

    let analytic = RequestAnalytic {
        method: parts.method.to_string(),
        from: remote_addr.to_string(),
        received_at,
        time_taken: started.elapsed(),
        request_body_size,
        response_body_size,
        response_code: response.status().as_u16(),
    };
    tokio::spawn(report_analytic(state.provisioner.clone(), id.to_string(), analytic));

    response
}

/// Stream the upstream response back. The reported size comes from the
/// upstream length, or 0 when it is chunked.
fn relay_response(upstream: reqwest::Response) -> (Response<Body>, usize) {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    let size = upstream
        .content_length()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    (response, size)
}

fn response_size(response: &Response<Body>) -> usize {
    use hyper::body::Body as _;
    response
        .body()
        .size_hint()
        .exact()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0)
}

/// Best effort: a missing or dead terminal is not an error.
async fn report_analytic(provisioner: Arc<Provisioner>, id: String, analytic: RequestAnalytic) {
    debug!("Webhook {}: {}", id, analytic);
    let Ok(config) = provisioner.get_config(&id).await else {
        return;
    };
    let Some(terminal) = config.active_session.as_ref().and_then(|s| s.terminal()) else {
        return;
    };
    if let Err(e) = terminal
        .write_text(&terminal_ui::create_analytics_line(&analytic))
        .await
    {
        debug!("Dropping analytics for webhook {}: {}", id, e);
    }
}

/// Serve the proxy on an already bound listener.
pub async fn serve_http_proxy(
    listener: TcpListener,
    provisioner: Arc<Provisioner>,
) -> anyhow::Result<()> {
    // Targets are loopback listeners; an environment proxy must never see them.
    let client = reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let state = Arc::new(ProxyState {
        provisioner,
        client,
    });

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            debug!("HTTP connection from {}", remote_addr);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_request(state, req, remote_addr).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("HTTP connection from {} ended: {}", remote_addr, e);
            }
        });
    }
}

/// Run the HTTP proxy server.
pub async fn run_http_proxy(provisioner: Arc<Provisioner>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind HTTP proxy on {}: {}", addr, e);
        e
    })?;
    info!("HTTP proxy listening on {}", addr);
    serve_http_proxy(listener, provisioner).await
}
