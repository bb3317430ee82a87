//! Billing error types

use shelfscore_shared::ResourceType;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("No entitlement record for user: {0}")]
    UserNotFound(String),

    #[error("Quota lease busy for {resource}, retry shortly")]
    QuotaBusy { resource: ResourceType },

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Webhook event outside the replay window ({age_seconds}s old)")]
    StaleEvent { age_seconds: i64 },

    #[error("No entitlement matches subscription: {0}")]
    UnknownSubscription(String),

    #[error("Event {event} not applicable from status {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Malformed webhook payload: {0}")]
    MalformedEvent(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
