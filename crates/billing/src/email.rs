//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API. Sends are non-fatal: a mail
//! failure must never fail notification processing.

use sitebill_shared::money::format_cents;
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
    /// Support email
    pub support_email: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Sitebill <noreply@sitebill.dev>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Sitebill".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@sitebill.dev".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://sitebill.dev".to_string()),
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

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent successfully,
    /// `Ok(false)` if sending failed (non-fatal - doesn't propagate error).
    /// The `Ok(false)` return allows callers to track delivery status while
    /// not failing notification processing due to email errors.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if to.is_empty() {
            tracing::debug!(subject = %subject, "No recipient on record, skipping email");
            return Ok(false);
        }
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
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
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
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

    fn wrap(&self, heading: &str, heading_color: &str, inner: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: {heading_color};">{heading}</h2>
    {inner}
    <p>Questions? Contact us at <a href="mailto:{support}">{support}</a>.</p>
    <p>— The {app} Team</p>
</body>
</html>"#,
            heading_color = heading_color,
            heading = heading,
            inner = inner,
            support = self.config.support_email,
            app = self.config.app_name,
        )
    }

    fn format_date(at: OffsetDateTime) -> String {
        format!("{} {}, {}", at.month(), at.day(), at.year())
    }

    /// Payment receipt after a successful charge or renewal
    pub async fn send_receipt(
        &self,
        to: &str,
        plan_name: &str,
        amount_cents: i64,
        paid_through: OffsetDateTime,
    ) -> BillingResult<bool> {
        let inner = format!(
            "<p>Thanks! We received your payment of <strong>{}</strong> for the <strong>{}</strong> plan.</p>\
             <p>Your subscription is paid through <strong>{}</strong>.</p>",
            format_cents(amount_cents),
            plan_name,
            Self::format_date(paid_through),
        );
        self.send_email(
            to,
            &format!("{} payment received", self.config.app_name),
            &self.wrap("Payment Received", "#16a34a", &inner),
        )
        .await
    }

    /// Payment failed notification
    pub async fn send_payment_failed(&self, to: &str, amount_cents: i64) -> BillingResult<bool> {
        let update_link = format!("{}/billing", self.config.dashboard_url);
        let inner = format!(
            "<p>We weren't able to process your payment of <strong>{}</strong>.</p>\
             <p>Please update your payment method to avoid any interruption to your service.</p>\
             <p><a href=\"{update_link}\" style=\"color: #6366f1;\">Update payment method</a></p>",
            format_cents(amount_cents),
        );
        self.send_email(
            to,
            "Payment failed - action required",
            &self.wrap("Payment Failed", "#dc2626", &inner),
        )
        .await
    }

    /// Subscription cancelled confirmation; access runs until the paid-through date
    pub async fn send_cancelled(&self, to: &str, paid_through: OffsetDateTime) -> BillingResult<bool> {
        let inner = format!(
            "<p>Your subscription has been cancelled.</p>\
             <p>You keep full access until <strong>{}</strong>; no further charges will be made.</p>",
            Self::format_date(paid_through),
        );
        self.send_email(
            to,
            "Subscription cancelled",
            &self.wrap("Subscription Cancelled", "#333", &inner),
        )
        .await
    }

    /// Operator alert: a charge settled but the recurring profile could not
    /// be created and retries were exhausted
    pub async fn send_reconciliation_alert(
        &self,
        to: &str,
        tenant_id: i64,
        intent_id: &str,
        error: &str,
    ) -> BillingResult<bool> {
        let inner = format!(
            "<p>A checkout charge settled but creating the recurring profile keeps failing.</p>\
             <p>Tenant: <strong>{tenant_id}</strong><br>Intent: <strong>{intent_id}</strong></p>\
             <p>Last error: <code>{error}</code></p>\
             <p>Manual follow-up is required; the customer has paid-through access.</p>",
        );
        self.send_email(
            to,
            "Reconciliation needed: recurring profile creation failing",
            &self.wrap("Reconciliation Needed", "#d97706", &inner),
        )
        .await
    }
}
