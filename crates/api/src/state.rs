//! Shared application state
//!
//! All services are constructed once at process start and injected into
//! handlers through this state; nothing reaches for globals.

use std::sync::Arc;

use shelfscore_billing::{EntitlementStore, QuotaLedger, WebhookIngestor};
use sqlx::PgPool;

use crate::auth::JwtVerifier;
use crate::scoring::ScoringBackend;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub quota: QuotaLedger,
    pub ingestor: Arc<WebhookIngestor>,
    pub entitlements: EntitlementStore,
    pub scoring: Arc<dyn ScoringBackend>,
    pub jwt: JwtVerifier,
}
