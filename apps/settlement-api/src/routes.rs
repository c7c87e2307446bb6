//! HTTP handlers.
//!
//! ```text
//! POST /webhooks/processor              signed processor deliveries
//! GET  /health                          database reachability
//! GET  /admin/webhooks/failed?limit=N   operator queue
//! POST /admin/webhooks/{event_id}/replay
//! ```

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetpay_core::WebhookEvent;
use fleetpay_engine::{signature, WebhookOutcome, SIGNATURE_HEADER};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_FAILED_LIMIT: u32 = 50;
const MAX_FAILED_LIMIT: u32 = 500;

/// Acknowledgement returned for every accepted delivery.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        let (outcome, note) = match outcome {
            WebhookOutcome::Applied => ("applied", None),
            WebhookOutcome::Duplicate => ("duplicate", None),
            WebhookOutcome::Noted(note) => ("noted", Some(note)),
            WebhookOutcome::Deferred => ("deferred", None),
        };
        WebhookAck {
            received: true,
            outcome: outcome.to_string(),
            note,
        }
    }
}

// =============================================================================
// Webhooks
// =============================================================================

/// Verifies the signature over the raw body, then hands the delivery to the
/// reconciler.
///
/// Deferred events are still acknowledged; retries happen on our side.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingHeader(SIGNATURE_HEADER))?;

    signature::verify(
        &state.webhook.signing_secret,
        signature_header,
        &body,
        state.signature_tolerance(),
        Utc::now().timestamp(),
    )?;

    let outcome = state.reconciler.handle(&body).await?;
    debug!(?outcome, "Webhook handled");

    Ok(Json(WebhookAck::from(outcome)))
}

// =============================================================================
// Health
// =============================================================================

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.db.health_check().await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DATABASE UNAVAILABLE")
    }
}

// =============================================================================
// Operator Queue
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<u32>,
}

pub async fn failed_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FailedQuery>,
) -> Result<Json<Vec<WebhookEvent>>, ApiError> {
    authorize(&state, &headers)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .clamp(1, MAX_FAILED_LIMIT);
    let events = state.reconciler.failed_events(limit).await?;
    Ok(Json(events))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<WebhookAck>, ApiError> {
    authorize(&state, &headers)?;

    let outcome = state.reconciler.replay(&event_id).await?;
    info!(event_id = %event_id, ?outcome, "Webhook event replayed by operator");
    Ok(Json(WebhookAck::from(outcome)))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
