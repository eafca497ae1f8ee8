//! SMS provider: JSON POST to an HTTP messaging API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::channels::{MessageSender, OutboundMessage};
use crate::error::SendError;

const CHANNEL: &str = "sms";

/// HTTP SMS gateway configuration.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_token: SecretString,
    pub from_number: Option<String>,
}

impl SmsConfig {
    /// Returns `None` if `SMS_API_URL` is not set (SMS channel disabled).
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("SMS_API_URL").filter(|u| !u.trim().is_empty())?;
        Some(Self {
            api_url,
            api_token: SecretString::from(lookup("SMS_API_TOKEN").unwrap_or_default()),
            from_number: lookup("SMS_FROM_NUMBER").filter(|n| !n.trim().is_empty()),
        })
    }
}

pub struct HttpSmsSender {
    client: reqwest::Client,
    config: SmsConfig,
    timeout: Duration,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            timeout,
        }
    }
}

#[async_trait]
impl MessageSender for HttpSmsSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(self.config.api_token.expose_secret())
            .header("Idempotency-Key", &message.idempotency_key)
            .json(&serde_json::json!({
                "from": self.config.from_number,
                "to": message.destination,
                "body": message.body,
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SendError::transient(CHANNEL, format!("SMS request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            info!(to = %message.destination, "SMS sent");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map a non-success provider response to a retry decision.
fn classify_status(status: StatusCode, body: &str) -> SendError {
    let reason = format!("SMS API error {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SendError::transient(CHANNEL, reason)
    } else {
        SendError::permanent(CHANNEL, reason)
    }
}
