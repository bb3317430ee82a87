//! Metered product routes
//!
//! Every handler here consumes quota before delegating to the scoring
//! pipeline. Quota decisions come back as structured admissions, never as
//! exceptions: denial is a 402 with the admission attached, and a contended
//! quota lease is retried a bounded number of times before surfacing 429.

use axum::{
    extract::State,
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use shelfscore_billing::{Admission, BillingError};
use shelfscore_shared::ResourceType;
use tokio_retry::{strategy::FixedInterval, RetryIf};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub barcode: String,
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub barcode: String,
    pub question: String,
}

/// Consume one unit of quota, retrying briefly when the lease is contended.
///
/// `QuotaBusy` is transient backpressure; the bounded retry lives here, at
/// the caller, rather than inside the ledger.
async fn consume(
    state: &AppState,
    user: &AuthUser,
    resource: ResourceType,
) -> Result<Admission, ApiError> {
    let strategy = FixedInterval::from_millis(100).take(2);
    let admission = RetryIf::spawn(
        strategy,
        || state.quota.check_and_consume(user.user_id, resource),
        |e: &BillingError| matches!(e, BillingError::QuotaBusy { .. }),
    )
    .await?;

    if !admission.allowed {
        return Err(ApiError::QuotaExceeded(Box::new(admission)));
    }
    Ok(admission)
}

/// Attach quota headers so clients can track consumption without polling
fn with_quota_headers(mut response: Response, admission: &Admission) -> Response {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&admission.limit.to_string()) {
        headers.insert("x-quota-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&admission.remaining.to_string()) {
        headers.insert("x-quota-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&admission.reset_at.unix_timestamp().to_string()) {
        headers.insert("x-quota-reset", v);
    }
    response
}

/// Submit a product identifier for scoring
pub async fn submit_scan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ScanRequest>,
) -> Result<Response, ApiError> {
    if req.barcode.trim().is_empty() {
        return Err(ApiError::Validation("barcode must not be empty".to_string()));
    }

    let admission = consume(&state, &user, ResourceType::Scan).await?;

    let score = state.scoring.score_product(&req.barcode).await.map_err(|e| {
        tracing::error!(user_id = %user.user_id, error = %e, "Scoring pipeline failed");
        ApiError::ServiceUnavailable
    })?;

    Ok(with_quota_headers(Json(score).into_response(), &admission))
}

/// Ask an AI question about a scanned product
pub async fn ask_question(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<QuestionRequest>,
) -> Result<Response, ApiError> {
    if req.question.trim().is_empty() {
        return Err(ApiError::Validation("question must not be empty".to_string()));
    }

    let admission = consume(&state, &user, ResourceType::AiQuestion).await?;

    let answer = state
        .scoring
        .answer_question(&req.barcode, &req.question)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %user.user_id, error = %e, "AI pipeline failed");
            ApiError::ServiceUnavailable
        })?;

    Ok(with_quota_headers(Json(answer).into_response(), &admission))
}

/// Queue an export of the user's scan history
pub async fn create_export(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Response, ApiError> {
    let admission = consume(&state, &user, ResourceType::Export).await?;

    let receipt = state.scoring.export_history(user.user_id).await.map_err(|e| {
        tracing::error!(user_id = %user.user_id, error = %e, "Export pipeline failed");
        ApiError::ServiceUnavailable
    })?;

    Ok(with_quota_headers(Json(receipt).into_response(), &admission))
}
