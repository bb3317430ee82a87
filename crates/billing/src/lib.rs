// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shelfscore Billing Module
//!
//! The billing-entitlement control plane: meters per-user, per-period
//! consumption against tier-specific quotas, and keeps entitlement state
//! consistent with the billing provider's asynchronous webhook stream.
//!
//! ## Components
//!
//! - **Quota Ledger**: admit/deny metered operations, lazy period resets
//! - **Lock Service**: short-lived leases over Redis (fail-open)
//! - **Webhook Ingestor**: verify, dedupe, dispatch provider events
//! - **Entitlement State Machine**: pure transition logic
//! - **Idempotency Log**: at-most-once event application
//! - **Audit Events / Email**: best-effort observability and notifications

pub mod config;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod lock;
pub mod quota;
pub mod state_machine;
pub mod webhooks;

// Config
pub use config::{BillingConfig, LimitTable, UNLIMITED};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Entitlement
pub use entitlement::{EntitlementRecord, EntitlementStore};

// Error
pub use error::{BillingError, BillingResult};

// Idempotency
pub use idempotency::{Claim, IdempotencyLog, IdempotencyRecord};

// Lock
pub use lock::{LockService, LockSettings};

// Quota
pub use quota::{Admission, QuotaLedger, QuotaStatus};

// State machine
pub use state_machine::{BillingEvent, SideEffect, Transition};

// Webhooks
pub use webhooks::{IngestResult, IngestStatus, WebhookIngestor};
