use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::db::models::WebhookSubscription;

type HmacSha256 = Hmac<Sha256>;

/// Delivers alert notifications to webhook subscribers.
///
/// Delivery is best-effort: failures are logged per subscription and never
/// propagate. Payloads are signed with the subscription secret when one is
/// configured.
#[derive(Clone)]
pub struct Notifier {
    http: Client,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { http })
    }

    /// Fan an event out to every subscription whose filter matches.
    pub async fn dispatch(
        &self,
        subscriptions: &[WebhookSubscription],
        event: &str,
        payload: &serde_json::Value,
    ) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(event = %event, error = %e, "failed to serialize webhook payload");
                return;
            }
        };

        for sub in subscriptions {
            if !matches_filter(&sub.event_filter, event) {
                continue;
            }

            let t = chrono::Utc::now().timestamp_millis().to_string();
            let mut req = self
                .http
                .post(&sub.url)
                .header("content-type", "application/json")
                .header("x-gridwatch-event", event)
                .header("x-gridwatch-timestamp", &t);
            if let Some(ref secret) = sub.secret {
                req = req.header("x-gridwatch-signature", sign_payload(secret, &t, &body));
            }

            match req.body(body.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %sub.url, event = %event, "webhook delivered");
                }
                Ok(resp) => {
                    warn!(url = %sub.url, status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(url = %sub.url, error = %e, "webhook delivery failed");
                }
            }
        }
    }
}

/// `*` matches every event; anything else is an exact event name.
pub(crate) fn matches_filter(filter: &str, event: &str) -> bool {
    filter == "*" || filter == event
}

/// HMAC-SHA256 over `{timestamp}.{body}`, uppercase hex — the timestamp in
/// the signed string pins the payload to the `x-gridwatch-timestamp` header.
pub(crate) fn sign_payload(secret: &str, timestamp_ms: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp_ms.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes()).to_uppercase()
}
