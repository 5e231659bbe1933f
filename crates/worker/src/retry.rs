//! Retrying subscription lookups
//!
//! Stripe calls made by the sweep go through [`RetryingSubscriptionSource`],
//! which retries transient failures with jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use retouch_billing::{BillingResult, SubscriptionPayload, SubscriptionSource};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

/// Retries after the first attempt
pub const MAX_RETRIES: usize = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

pub struct RetryingSubscriptionSource {
    inner: Arc<dyn SubscriptionSource>,
    base_delay: Duration,
    max_delay: Duration,
    max_retries: usize,
}

impl RetryingSubscriptionSource {
    pub fn new(inner: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            inner,
            base_delay: RETRY_BASE_DELAY,
            max_delay: RETRY_MAX_DELAY,
            max_retries: MAX_RETRIES,
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl SubscriptionSource for RetryingSubscriptionSource {
    async fn fetch_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionPayload>> {
        let retry_strategy = ExponentialBackoff::from_millis(self.base_delay.as_millis() as u64)
            .max_delay(self.max_delay)
            .take(self.max_retries)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.inner.fetch_subscription(subscription_id).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    debug!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Transient error - will retry"
                    );
                    Err(result)
                }
                Err(e) => {
                    warn!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Permanent error - not retrying"
                    );
                    Ok(result)
                }
            }
        })
        .await
        .unwrap_or_else(|e| e) // Extract the inner result
    }
}
