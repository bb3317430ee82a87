//! Billing routes: provider webhook and quota status

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shelfscore_billing::{BillingError, QuotaStatus};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Handle billing provider webhook events
///
/// Response contract: `200 {status}` when the event was handled (including
/// duplicates and ignored kinds), `401` on signature or freshness failures,
/// `400` on payloads that can never succeed, and `500 {status: "error"}` so
/// the provider retries on our internal failures.
pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    tracing::info!(body_len = body.len(), "Billing webhook received");

    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(signature) = signature else {
        tracing::warn!("Billing webhook missing signature header");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error" })),
        )
            .into_response();
    };

    match state.ingestor.ingest(&body, &signature).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(BillingError::InvalidSignature) => {
            // Do not echo payload contents for rejected deliveries.
            tracing::warn!("Billing webhook signature verification failed");
            (StatusCode::UNAUTHORIZED, Json(json!({ "status": "error" }))).into_response()
        }
        Err(BillingError::StaleEvent { age_seconds }) => {
            tracing::warn!(age_seconds, "Billing webhook outside replay window");
            (StatusCode::UNAUTHORIZED, Json(json!({ "status": "error" }))).into_response()
        }
        Err(BillingError::MalformedEvent(e)) => {
            tracing::warn!(error = %e, "Billing webhook payload malformed");
            (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" }))).into_response()
        }
        Err(e) => {
            // Non-2xx tells the provider to retry with its own backoff.
            tracing::error!(error = %e, "Billing webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
                .into_response()
        }
    }
}

/// Per-resource quota status for the authenticated user
pub async fn quota_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<QuotaStatus>> {
    let status = state.quota.status(user.user_id).await?;
    Ok(Json(status))
}
