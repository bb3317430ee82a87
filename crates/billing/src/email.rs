//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API for entitlement transitions.
//! Sending is best-effort: a failed send is logged and never fails the
//! webhook that triggered it.

use time::OffsetDateTime;

use crate::error::BillingResult;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Shelfscore <noreply@shelfscore.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Shelfscore".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://shelfscore.app".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` on a failed or skipped
    /// send so callers can track delivery without propagating the failure.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    /// Welcome email after an upgrade to premium
    pub async fn send_premium_welcome(&self, to: &str) -> BillingResult<bool> {
        let subject = format!("Welcome to {} Premium", self.config.app_name);
        let html = format!(
            r#"<h2>You're on Premium now</h2>
            <p>Unlimited scans, AI questions, and exports are active on your account.</p>
            <p><a href="{}/dashboard">Open your dashboard</a></p>"#,
            self.config.dashboard_url
        );
        self.send_email(to, &subject, &html).await
    }

    /// Confirmation after a cancellation, naming when access ends
    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        ends_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let subject = format!("Your {} subscription was cancelled", self.config.app_name);
        let until = ends_at
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "the end of your current period".to_string());
        let html = format!(
            r#"<h2>Subscription cancelled</h2>
            <p>Your premium access stays active until {}.</p>
            <p>Changed your mind? You can resume any time before then from
            <a href="{}/billing">your billing page</a>.</p>"#,
            until, self.config.dashboard_url
        );
        self.send_email(to, &subject, &html).await
    }

    /// Warning after a failed renewal payment
    pub async fn send_payment_failed(&self, to: &str) -> BillingResult<bool> {
        let subject = format!("{}: payment failed", self.config.app_name);
        let html = format!(
            r#"<h2>We couldn't process your payment</h2>
            <p>Your subscription is past due. Please update your payment method to
            keep premium access.</p>
            <p><a href="{}/billing">Update payment method</a></p>"#,
            self.config.dashboard_url
        );
        self.send_email(to, &subject, &html).await
    }

    /// Notice that the account moved back to the free tier
    pub async fn send_downgraded_to_free(&self, to: &str) -> BillingResult<bool> {
        let subject = format!("Your {} subscription has ended", self.config.app_name);
        let html = format!(
            r#"<h2>Back on the free plan</h2>
            <p>Your subscription has ended and free-tier limits now apply.</p>
            <p><a href="{}/billing">Resubscribe</a> to get unlimited access back.</p>"#,
            self.config.dashboard_url
        );
        self.send_email(to, &subject, &html).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_disabled_without_api_key() {
        let config = EmailConfig {
            resend_api_key: String::new(),
            email_from: "Shelfscore <noreply@shelfscore.app>".to_string(),
            app_name: "Shelfscore".to_string(),
            dashboard_url: "https://shelfscore.app".to_string(),
        };
        assert!(!config.is_enabled());
    }

    #[tokio::test]
    async fn test_unconfigured_send_is_skipped_not_failed() {
        let service = BillingEmailService::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "Shelfscore <noreply@shelfscore.app>".to_string(),
            app_name: "Shelfscore".to_string(),
            dashboard_url: "https://shelfscore.app".to_string(),
        });
        let sent = service.send_premium_welcome("user@example.com").await.unwrap();
        assert!(!sent);
    }
}
