//! HTTP server for GitHub push webhooks.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::github_client::FileSource;
use crate::rollout::Deployer;
use crate::webhooks::{
    delivery_payload, verify_delivery, PushEvent, WebhookEvent, DELIVERY_HEADER, EVENT_HEADER,
    SIGNATURE_256_HEADER, SIGNATURE_HEADER,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Configuration.
    pub config: Arc<Config>,
    /// Rollout pipeline shared by every delivery.
    pub deployer: Arc<Deployer>,
    /// Where changed definitions are fetched from.
    pub files: Arc<dyn FileSource>,
    /// Cancelled on shutdown; each rollout polls with a child token.
    pub shutdown: CancellationToken,
}

/// Build the HTTP router for the webhook service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/github", post(github_webhook_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handle incoming GitHub webhooks.
///
/// This handler:
/// 1. Verifies the payload signature (if a secret is configured)
/// 2. Decodes the delivery (JSON or form-encoded) by its event header
/// 3. Rolls out every changed file of a push, one after another
///
/// Every failure answers 500; successes keep the default status.
pub async fn github_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let event_type = header(&headers, EVENT_HEADER).unwrap_or("unknown");
    let delivery_id = header(&headers, DELIVERY_HEADER).unwrap_or("unknown");

    info!(
        event_type = %event_type,
        delivery_id = %delivery_id,
        "Received GitHub webhook"
    );

    if let Some(secret) = &state.config.webhook_secret {
        if let Err(e) = verify_delivery(
            &body,
            header(&headers, SIGNATURE_256_HEADER),
            header(&headers, SIGNATURE_HEADER),
            secret,
        ) {
            error!(delivery_id = %delivery_id, error = %e, "Webhook validation failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        debug!("Webhook signature verified");
    } else {
        warn!("No webhook secret configured, skipping signature verification");
    }

    let event = delivery_payload(header(&headers, CONTENT_TYPE.as_str()), &body)
        .and_then(|payload| WebhookEvent::parse(event_type, &payload))
        .map_err(|e| {
            error!(delivery_id = %delivery_id, error = %e, "Failed to parse webhook payload");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    match event {
        WebhookEvent::HookRegistered(ping) => {
            info!(
                hook_id = ?ping.hook_id,
                zen = ?ping.zen,
                "Hook registered"
            );
            Ok(Json(json!({ "status": "ok", "event": "ping" })))
        }
        WebhookEvent::Push(push) => handle_push(&state, &push).await,
        WebhookEvent::Unsupported(kind) => {
            error!(event_type = %kind, "Event not handled");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Fetch and roll out each changed file of a push.
///
/// Files are processed sequentially; the first failure aborts the delivery.
async fn handle_push(state: &AppState, push: &PushEvent) -> Result<Json<Value>, StatusCode> {
    let Some(owner) = push.repository.owner_name() else {
        error!(repo = %push.repository.name, "Push payload has no repository owner");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let repo = push.repository.name.as_str();
    let git_ref = push.after.as_deref().filter(|sha| !is_null_sha(sha));

    let (tracked, ignored): (Vec<String>, Vec<String>) = push
        .changed_files()
        .into_iter()
        .partition(|path| state.config.is_tracked(path));

    if !ignored.is_empty() {
        debug!(ignored = ?ignored, "Skipping untracked files");
    }

    info!(
        owner = %owner,
        repo = %repo,
        git_ref = %push.git_ref,
        files = tracked.len(),
        "Processing push"
    );

    let mut deployed = Vec::with_capacity(tracked.len());
    for path in &tracked {
        let bytes = state
            .files
            .fetch(owner, repo, path, git_ref)
            .await
            .map_err(|e| {
                error!(path = %path, error = %e, "DownloadContents error");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

        let cancel = state.shutdown.child_token();
        let report = state.deployer.rollout(&bytes, &cancel).await.map_err(|e| {
            error!(path = %path, error = %e, "Deploy error");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        deployed.push(json!({
            "path": path,
            "name": report.reconciled.name,
            "action": report.reconciled.action.to_string(),
            "replicas": report.reconciled.expected_replicas,
            "ticks": report.convergence.ticks,
        }));
    }

    Ok(Json(json!({
        "status": "deployed",
        "deployments": deployed,
    })))
}

/// GitHub reports `after` as all zeros when a ref is deleted.
fn is_null_sha(sha: &str) -> bool {
    sha.chars().all(|c| c == '0')
}
