//! Stripe webhook handling
//!
//! Verifies the `stripe-signature` header, decodes the event envelope, and hands
//! supported events to the [`BillingEventProcessor`].

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventProcessor, EventOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// The envelope of a Stripe event
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub object: Value,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: Value,
}

/// Check a `stripe-signature` header against `payload`.
///
/// The header is `t=<unix>,v1=<hex>[,v1=<hex>...]`; any matching `v1` passes.
/// The full signing secret, including its `whsec_` prefix, is the HMAC key.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

/// Decode the event envelope
pub fn parse_event(payload: &str) -> BillingResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_str(payload).map_err(|e| {
        tracing::warn!(error = %e, "Failed to parse webhook event JSON");
        BillingError::MalformedEvent(e.to_string())
    })?;

    Ok(WebhookEvent {
        id: raw.id,
        event_type: raw.event_type,
        created: raw.created,
        object: raw.data.object,
    })
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    processor: BillingEventProcessor,
}

impl WebhookHandler {
    pub fn new(webhook_secret: impl Into<String>, processor: BillingEventProcessor) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            processor,
        }
    }

    /// Verify the signature and decode the envelope
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;
        parse_event(payload)
    }

    /// Apply a verified event. Unsupported types are acknowledged and ignored.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<EventOutcome> {
        let Some(billing_event) = BillingEvent::parse(&event.event_type, event.object)? else {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring unsupported webhook event"
            );
            return Ok(EventOutcome::Ignored);
        };

        let outcome = self.processor.apply_billing_event(billing_event).await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Webhook processed"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryIdentityProvider, InMemorySubscriptionStore, RecordingNotifier, StaticCustomerDirectory};
    use crate::plans::PlanCatalog;
    use crate::reconciler::QuotaReconciler;
    use retouch_shared::UserId;
    use serde_json::json;
    use std::sync::Arc;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn handler() -> (WebhookHandler, Arc<InMemorySubscriptionStore>) {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let processor = BillingEventProcessor::new(
            QuotaReconciler::new(store.clone(), PlanCatalog::default()),
            Arc::new(StaticCustomerDirectory::new()),
            Arc::new(InMemoryIdentityProvider::new()),
            Arc::new(RecordingNotifier::new()),
        );
        (WebhookHandler::new(SECRET, processor), store)
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, SECRET, 1_000);
        assert!(verify_signature(payload, &header, SECRET, 1_010).is_ok());
    }

    #[test]
    fn test_signature_uses_full_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "test_secret", 1_000);
        assert!(verify_signature(payload, &header, SECRET, 1_000).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"amount":1}"#, SECRET, 1_000);
        assert!(matches!(
            verify_signature(r#"{"amount":2}"#, &header, SECRET, 1_000),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign(payload, SECRET, 1_000);
        assert!(verify_signature(payload, &header, SECRET, 1_000 + SIGNATURE_TOLERANCE_SECS + 1).is_err());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = "{}";
        let valid = sign(payload, SECRET, 1_000);
        let header = format!("t=1000,v1=deadbeef,{}", valid.trim_start_matches("t=1000,"));
        assert!(verify_signature(payload, &header, SECRET, 1_000).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        assert!(verify_signature("{}", "", SECRET, 1_000).is_err());
        assert!(verify_signature("{}", "t=1000", SECRET, 1_000).is_err());
        assert!(verify_signature("{}", "v1=abcd", SECRET, 1_000).is_err());
        assert!(verify_signature("{}", "t=1000,v1=not-hex", SECRET, 1_000).is_err());
    }

    #[test]
    fn test_parse_event_envelope() {
        let event = parse_event(
            r#"{"id":"evt_1","type":"invoice.paid","created":42,"data":{"object":{"id":"in_1"}}}"#,
        )
        .unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "invoice.paid");
        assert_eq!(event.created, 42);
        assert_eq!(event.object["id"], "in_1");

        assert!(matches!(parse_event("not json"), Err(BillingError::MalformedEvent(_))));
        assert!(matches!(parse_event(r#"{"id":"evt_2"}"#), Err(BillingError::MalformedEvent(_))));
    }

    #[tokio::test]
    async fn test_verified_event_is_applied() {
        let (handler, store) = handler();
        let user = UserId::new();
        let payload = json!({
            "id": "evt_1",
            "type": "customer.subscription.created",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "metadata": { "supabase_user_id": user.to_string() },
                "items": { "data": [] }
            } }
        })
        .to_string();
        let header = sign(&payload, SECRET, OffsetDateTime::now_utc().unix_timestamp());

        let event = handler.verify_event(&payload, &header).unwrap();
        let outcome = handler.handle_event(event).await.unwrap();

        assert_eq!(outcome, EventOutcome::Applied { user_id: user });
        assert!(store.get(user).is_some());
    }

    #[tokio::test]
    async fn test_unsupported_event_is_ignored() {
        let (handler, store) = handler();
        let event = WebhookEvent {
            id: "evt_2".to_string(),
            event_type: "customer.created".to_string(),
            created: 0,
            object: json!({}),
        };
        assert_eq!(handler.handle_event(event).await.unwrap(), EventOutcome::Ignored);
        assert!(store.is_empty());
    }
}
