//! Outbound webhook delivery.
//!
//! Every delivery is signed with HMAC-SHA256 over `<timestamp>.<body>` and
//! carries a stable delivery id that doubles as the receiver's idempotency
//! key across retries. Retry timing follows a fixed ladder rather than
//! exponential arithmetic, capped at [`WEBHOOK_MAX_ATTEMPTS`] attempts;
//! only 5xx and 429 responses are retryable.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::constants::{
    WEBHOOK_BACKOFF_LADDER_SECS, WEBHOOK_HEADER_DELIVERY_ID, WEBHOOK_HEADER_EVENT,
    WEBHOOK_HEADER_SIGNATURE, WEBHOOK_HEADER_TIMESTAMP, WEBHOOK_MAX_ATTEMPTS,
};
use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// A registered webhook endpoint
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebhookSubscription {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub url: String,

    /// Shared secret for signing; unsigned deliveries carry no signature header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Event names this subscription wants; empty means everything
    #[serde(default)]
    pub events: Vec<String>,
}

impl WebhookSubscription {
    pub fn wants(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event)
    }
}

/// What to do after one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// Try again after the ladder delay for this attempt
    Retry { after: Duration },
    /// Terminal; no further attempts
    Failed,
}

/// Sign a payload: hex HMAC-SHA256 over `<timestamp>.<body>`.
///
/// Binding the timestamp into the MAC lets receivers reject replays
/// without a second header check.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check for receivers.
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, provided: &str) -> bool {
    let expected = sign_payload(secret, timestamp, body);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Delay before the next attempt, or `None` once attempts are exhausted.
///
/// `attempt` is the 1-based attempt that just failed.
pub fn backoff_delay(attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt >= WEBHOOK_MAX_ATTEMPTS {
        return None;
    }
    let index = (attempt as usize - 1).min(WEBHOOK_BACKOFF_LADDER_SECS.len() - 1);
    Some(Duration::from_secs(WEBHOOK_BACKOFF_LADDER_SECS[index]))
}

/// Classify an HTTP response from the receiver.
pub fn classify_response(status: u16, attempt: u32) -> Disposition {
    if (200..300).contains(&status) {
        return Disposition::Delivered;
    }
    let retryable = status >= 500 || status == 429;
    if retryable && let Some(after) = backoff_delay(attempt) {
        Disposition::Retry { after }
    } else {
        Disposition::Failed
    }
}

/// Receipt for one attempt, including the idempotency key the receiver saw
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub delivery_id: Uuid,
    pub status: u16,
    pub disposition: Disposition,
}

/// Signs and sends webhook payloads
pub struct DeliveryNotifier {
    client: reqwest::Client,
}

impl DeliveryNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// One delivery attempt. The caller owns retry scheduling; the same
    /// `delivery_id` must be reused for every attempt of one delivery.
    pub async fn attempt(
        &self,
        subscription: &WebhookSubscription,
        event: &str,
        payload: &Value,
        delivery_id: Uuid,
        attempt: u32,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| DeliveryError::Request(e.to_string()))?;
        let timestamp = chrono::Utc::now().timestamp();

        let mut request = self
            .client
            .post(&subscription.url)
            .header("content-type", "application/json")
            .header(WEBHOOK_HEADER_EVENT, event)
            .header(WEBHOOK_HEADER_TIMESTAMP, timestamp.to_string())
            .header(WEBHOOK_HEADER_DELIVERY_ID, delivery_id.to_string())
            .body(body.clone());
        if let Some(ref secret) = subscription.secret {
            request = request.header(
                WEBHOOK_HEADER_SIGNATURE,
                sign_payload(secret, timestamp, &body),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let disposition = classify_response(status, attempt);

        Ok(DeliveryReceipt {
            delivery_id,
            status,
            disposition,
        })
    }

    /// Deliver with the full retry ladder. Transport-level failures count
    /// as retryable attempts the same way 5xx responses do.
    pub async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        event: &str,
        payload: &Value,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let delivery_id = Uuid::new_v4();

        for attempt in 1..=WEBHOOK_MAX_ATTEMPTS {
            let outcome = self
                .attempt(subscription, event, payload, delivery_id, attempt)
                .await;

            let after = match outcome {
                Ok(receipt) => match receipt.disposition {
                    Disposition::Delivered => return Ok(receipt),
                    Disposition::Failed => {
                        return Err(DeliveryError::Failed {
                            status: receipt.status,
                            message: format!("receiver rejected delivery {delivery_id}"),
                        });
                    }
                    Disposition::Retry { after } => after,
                },
                Err(e) => match backoff_delay(attempt) {
                    Some(after) => {
                        tracing::warn!(
                            delivery_id = %delivery_id,
                            attempt,
                            error = %e,
                            "webhook attempt failed, will retry"
                        );
                        after
                    }
                    None => return Err(e),
                },
            };

            tracing::debug!(
                delivery_id = %delivery_id,
                attempt,
                delay_secs = after.as_secs(),
                "scheduling webhook retry"
            );
            tokio::time::sleep(after).await;
        }

        Err(DeliveryError::Exhausted {
            attempts: WEBHOOK_MAX_ATTEMPTS,
        })
    }
}

impl Default for DeliveryNotifier {
    fn default() -> Self {
        Self::new()
    }
}
