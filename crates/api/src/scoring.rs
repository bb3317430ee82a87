//! Interfaces to the product-intelligence collaborators
//!
//! Scoring heuristics, AI answers, and export assembly run in a separate
//! service; this crate only meters access to them. Handlers talk to the
//! trait so the pipeline can be swapped out in tests.

use axum::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Score for one scanned product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductScore {
    pub barcode: String,
    pub score: i32,
    pub verdict: String,
}

/// Answer to one AI question about a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAnswer {
    pub answer: String,
}

/// Receipt for a queued data export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub export_id: Uuid,
    pub status: String,
}

/// The out-of-scope product pipeline, seen from the metered API
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    async fn score_product(&self, barcode: &str) -> anyhow::Result<ProductScore>;
    async fn answer_question(&self, barcode: &str, question: &str) -> anyhow::Result<AiAnswer>;
    async fn export_history(&self, user_id: Uuid) -> anyhow::Result<ExportReceipt>;
}

/// HTTP client for the internal scoring service
pub struct RemoteScoringBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteScoringBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ScoringBackend for RemoteScoringBackend {
    async fn score_product(&self, barcode: &str) -> anyhow::Result<ProductScore> {
        let response = self
            .client
            .post(format!("{}/internal/score", self.base_url))
            .json(&serde_json::json!({ "barcode": barcode }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn answer_question(&self, barcode: &str, question: &str) -> anyhow::Result<AiAnswer> {
        let response = self
            .client
            .post(format!("{}/internal/answer", self.base_url))
            .json(&serde_json::json!({ "barcode": barcode, "question": question }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn export_history(&self, user_id: Uuid) -> anyhow::Result<ExportReceipt> {
        let response = self
            .client
            .post(format!("{}/internal/export", self.base_url))
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
