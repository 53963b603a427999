//! Management API for webhook administration.
//!
//! Provides HTTP endpoints for listing, inspecting and deleting webhooks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use log::{info, warn};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::TunnelError;
use crate::provisioner::Provisioner;
use crate::types::WebhookConfig;

/// JSON response for a single webhook.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub id: String,
    pub public_url: String,
    pub client_socket: String,
    pub internal_socket: String,
    pub created_at: String,
    pub is_active: bool,
    /// When the current tunnel session bound the webhook
    pub session_started_at: Option<String>,
    pub bound_port: Option<u16>,
}

impl From<WebhookConfig> for WebhookResponse {
    fn from(config: WebhookConfig) -> Self {
        let session = config.active_session.as_ref();
        Self {
            is_active: session.is_some(),
            session_started_at: session.map(|s| s.started_at.to_rfc3339()),
            bound_port: session.and_then(|s| s.bound_port),
            created_at: config.created_at.to_rfc3339(),
            client_socket: config.client_socket.to_string(),
            internal_socket: config.internal_server_socket.to_string(),
            public_url: config.public_url,
            id: config.id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhooksListResponse {
    pub webhooks: Vec<WebhookResponse>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: TunnelError) -> ApiError {
    (
        crate::proxy::status_for(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// GET /webhooks
async fn list_webhooks(State(provisioner): State<Arc<Provisioner>>) -> Json<WebhooksListResponse> {
    let webhooks = provisioner
        .store()
        .list_all()
        .await
        .into_iter()
        .map(WebhookResponse::from)
        .collect();
    Json(WebhooksListResponse { webhooks })
}

/// GET /webhooks/{id}
async fn get_webhook(
    State(provisioner): State<Arc<Provisioner>>,
    Path(id): Path<String>,
) -> Result<Json<WebhookResponse>, ApiError> {
    provisioner
        .get_config(&id)
        .await
        .map(|config| Json(config.into()))
        .map_err(api_error)
}

/// DELETE /webhooks/{id}: closes any live listener, then removes the webhook.
async fn delete_webhook(
    State(provisioner): State<Arc<Provisioner>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    info!("Management API: delete request for webhook '{}'", id);

    match provisioner.deprovision(&id).await {
        Ok(_) => Ok(Json(SuccessResponse {
            success: true,
            message: format!("Webhook '{}' deleted", id),
        })),
        Err(e) => {
            warn!("Management API: failed to delete webhook '{}': {}", id, e);
            Err(api_error(e))
        }
    }
}

/// Create the management API router
pub fn create_management_router(provisioner: Arc<Provisioner>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks/{id}", get(get_webhook).delete(delete_webhook))
        .layer(cors)
        .with_state(provisioner)
}

/// Run the management API server
pub async fn run_management_api(
    provisioner: Arc<Provisioner>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let router = create_management_router(provisioner);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Management API listening on {}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
