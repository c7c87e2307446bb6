//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use fleetpay_db::Database;
use fleetpay_engine::{WebhookReconciler, WebhookSettings};

/// Cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub reconciler: WebhookReconciler,
    pub webhook: Arc<WebhookSettings>,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        db: Database,
        reconciler: WebhookReconciler,
        webhook: WebhookSettings,
        admin_token: Option<String>,
    ) -> Self {
        AppState {
            db,
            reconciler,
            webhook: Arc::new(webhook),
            admin_token: admin_token.map(Arc::from),
        }
    }

    pub fn signature_tolerance(&self) -> Duration {
        Duration::from_secs(self.webhook.tolerance_secs)
    }
}
