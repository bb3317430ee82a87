//! User registration
//!
//! Registration seeds the billing control plane: every new user gets a
//! free/none entitlement record, which the quota ledger requires before it
//! will admit anything.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub email: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("a valid email is required".to_string()));
    }

    let user_id = Uuid::new_v4();
    let created: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO users (id, email)
        VALUES ($1, $2)
        ON CONFLICT (email) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(&email)
    .fetch_optional(&state.pool)
    .await?;

    let Some((user_id,)) = created else {
        return Err(ApiError::Conflict("Email already registered".to_string()));
    };

    state.entitlements.create_for_user(user_id).await?;

    tracing::info!(user_id = %user_id, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, email }),
    ))
}
