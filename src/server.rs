//! Inbound Pub/Sub push webhook
//!
//! Pub/Sub wraps the Gmail notification as base64 JSON inside an envelope.
//! Bodies that cannot be decoded into a notification with a history id are
//! acknowledged with `204 No Content` so Pub/Sub does not redeliver them.
//! Processing failures map to an error status, which makes Pub/Sub retry.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::AppError;
use crate::gmail::decode_base64;
use crate::ingest::IngestionController;
use crate::models::{PushEnvelope, PushNotification};

pub const WEBHOOK_PATH: &str = "/gmail/webhook";

/// Shared handler state
pub struct AppState {
    pub controller: Arc<IngestionController>,
    /// Expected `token` query parameter, if the endpoint is protected
    pub webhook_token: Option<SecretString>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookQuery {
    token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(WEBHOOK_PATH, post(webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.webhook_token
        && query.token.as_deref() != Some(expected.expose_secret())
    {
        tracing::warn!("rejected push with missing or wrong token");
        return AppError::AuthFailed("invalid webhook token".to_owned()).into_response();
    }

    let correlation_id = Uuid::new_v4();
    let span = tracing::info_span!("push", %correlation_id);
    async move {
        let Some(notification) = decode_push(&body) else {
            tracing::debug!(bytes = body.len(), "ignoring empty or malformed push");
            return StatusCode::NO_CONTENT.into_response();
        };

        match state.controller.handle(&notification).await {
            Ok(report) => {
                tracing::debug!(
                    delivered = report.delivered,
                    skipped = report.skipped,
                    data_loss = report.data_loss,
                    "push handled"
                );
                StatusCode::NO_CONTENT.into_response()
            }
            Err(e) => {
                tracing::error!(code = e.code(), error = %e, "push handling failed");
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

/// Decode a push envelope into a notification carrying a history id
pub fn decode_push(body: &[u8]) -> Option<PushNotification> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let envelope: PushEnvelope = serde_json::from_slice(body).ok()?;
    let message = envelope.message?;
    let payload = decode_base64(message.data.as_deref()?)?;
    let notification: PushNotification = serde_json::from_slice(&payload).ok()?;
    tracing::debug!(
        subscription = ?envelope.subscription,
        pubsub_message_id = ?message.message_id,
        email = ?notification.email_address,
        history_id = ?notification.history_id.map(|c| c.value()),
        "decoded push"
    );
    notification.history_id.is_some().then_some(notification)
}
