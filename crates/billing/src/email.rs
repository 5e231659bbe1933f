//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API for billing-related events.
//! Delivery is fire-and-forget: failures are logged and reported as `false`,
//! never propagated into webhook processing.

use async_trait::async_trait;

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCategory {
    PaymentFailed,
    SubscriptionCanceled,
    BillingSummary,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentFailed => "payment_failed",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::BillingSummary => "billing_summary",
        }
    }
}

/// An outbound user notification. `body` is an HTML fragment; the sender adds branding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub category: NotificationCategory,
}

fn format_amount(amount_cents: i64, currency: Option<&str>) -> String {
    let currency = currency.unwrap_or("eur").to_uppercase();
    format!("{:.2} {}", amount_cents as f64 / 100.0, currency)
}

impl Notification {
    pub fn payment_failed(
        to: &str,
        amount_cents: i64,
        currency: Option<&str>,
        invoice_url: Option<&str>,
    ) -> Self {
        let invoice_section = invoice_url
            .map(|url| {
                format!(
                    r#"<p><a href="{}" style="color: #6366f1;">View Invoice</a></p>"#,
                    url
                )
            })
            .unwrap_or_default();

        Self {
            to: to.to_string(),
            subject: "Payment Failed".to_string(),
            body: format!(
                r#"<h2 style="color: #dc2626;">Payment Failed</h2>
    <p>We weren't able to process your payment of <strong>{amount}</strong>.</p>
    <p>Please update your payment method to keep generating images without interruption.</p>
    {invoice_section}"#,
                amount = format_amount(amount_cents, currency),
                invoice_section = invoice_section,
            ),
            category: NotificationCategory::PaymentFailed,
        }
    }

    pub fn subscription_canceled(to: &str, plan_label: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Subscription Cancelled".to_string(),
            body: format!(
                r#"<h2>Your {plan} subscription has ended</h2>
    <p>Your account is back on the free plan. You can subscribe again at any time from the billing page.</p>"#,
                plan = plan_label,
            ),
            category: NotificationCategory::SubscriptionCanceled,
        }
    }

    pub fn billing_summary(
        to: &str,
        plan_label: &str,
        amount_cents: i64,
        currency: Option<&str>,
        quota_limit: i32,
    ) -> Self {
        Self {
            to: to.to_string(),
            subject: "Your monthly billing summary".to_string(),
            body: format!(
                r#"<h2>Thanks for your payment</h2>
    <p>We received <strong>{amount}</strong> for your <strong>{plan}</strong> plan.</p>
    <p>Your generation quota has been reset: <strong>{quota}</strong> generations are available this period.</p>"#,
                amount = format_amount(amount_cents, currency),
                plan = plan_label,
                quota = quota_limit,
            ),
            category: NotificationCategory::BillingSummary,
        }
    }
}

/// Fire-and-forget notification delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the notification was handed off successfully
    async fn send(&self, notification: Notification) -> bool;
}

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
                .unwrap_or_else(|_| "Retouch <noreply@retouch.studio>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Retouch".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@retouch.studio".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
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
    /// Create a new email service
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

    fn render(&self, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    {body}
    <p>
        <a href="{billing_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Manage Billing
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        If you have any questions, please contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            body = body,
            billing_link = format!("{}/billing", self.config.dashboard_url),
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        )
    }

    /// Send an email via Resend API.
    ///
    /// Returns `true` if the email was accepted, `false` otherwise.
    async fn send_email(&self, to: &str, subject: &str, html: &str, category: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html,
            "tags": [{ "name": "category", "value": category }]
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
                true
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
                false
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send(&self, notification: Notification) -> bool {
        let subject = format!("{} - {}", notification.subject, self.config.app_name);
        let html = self.render(&notification.body);
        self.send_email(&notification.to, &subject, &html, notification.category.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_service() -> BillingEmailService {
        BillingEmailService::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "Retouch <noreply@example.com>".to_string(),
            app_name: "Retouch".to_string(),
            support_email: "help@example.com".to_string(),
            dashboard_url: "https://app.example.com".to_string(),
        })
    }

    #[tokio::test]
    async fn test_disabled_email_is_skipped() {
        let sent = disabled_service()
            .send(Notification::subscription_canceled("a@example.com", "Pro"))
            .await;
        assert!(!sent);
    }

    #[test]
    fn test_render_includes_branding() {
        let html = disabled_service().render("<p>hello</p>");
        assert!(html.contains("<p>hello</p>"));
        assert!(html.contains("https://app.example.com/billing"));
        assert!(html.contains("help@example.com"));
    }

    #[test]
    fn test_payment_failed_formats_amount() {
        let n = Notification::payment_failed("a@example.com", 1900, Some("eur"), Some("https://inv"));
        assert_eq!(n.category, NotificationCategory::PaymentFailed);
        assert!(n.body.contains("19.00 EUR"));
        assert!(n.body.contains("https://inv"));
    }
}
