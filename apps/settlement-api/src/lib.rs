//! # FleetPay Settlement API
//!
//! HTTP surface of the settlement engine: the processor webhook endpoint,
//! a health check, and an operator queue for events that ran out of
//! retries.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

pub use error::ApiError;
pub use state::AppState;

/// Builds the router. Admin routes exist only when an admin token is
/// configured.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health))
        .route("/webhooks/processor", post(routes::processor_webhook));

    if state.admin_token.is_some() {
        app = app
            .route("/admin/webhooks/failed", get(routes::failed_webhooks))
            .route(
                "/admin/webhooks/{event_id}/replay",
                post(routes::replay_webhook),
            );
    }

    app.with_state(state)
}
