// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shelfscore API Library
//!
//! This crate contains the API server components for Shelfscore.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod scoring;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
