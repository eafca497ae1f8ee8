//! Email provider: SMTP via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::channels::{MessageSender, OutboundMessage};
use crate::error::{ConfigError, SendError};

const CHANNEL: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (email channel disabled).
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SMTP_HOST").filter(|h| !h.trim().is_empty())?;

        let port: u16 = lookup("SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = lookup("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default());
        let from_address = lookup("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// Sends automation emails through an SMTP relay.
pub struct EmailSender {
    transport: SmtpTransport,
    from: Mailbox,
}

impl EmailSender {
    /// `timeout` bounds each SMTP command; the blocking call cannot be cancelled
    /// once started, so it must be shorter than the dispatcher's send timeout.
    pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let from = config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_FROM_ADDRESS".into(),
                message: e.to_string(),
            })?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(timeout))
            .build();

        Ok(Self { transport, from })
    }

    fn build_message(&self, message: &OutboundMessage) -> Result<Message, SendError> {
        // A malformed lead address will never become deliverable.
        let to = message
            .destination
            .parse::<Mailbox>()
            .map_err(|e| SendError::permanent(CHANNEL, format!("Invalid to address: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone().unwrap_or_default())
            .message_id(Some(message_id(&message.idempotency_key)))
            .body(message.body.clone())
            .map_err(|e| SendError::permanent(CHANNEL, format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl MessageSender for EmailSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let email = self.build_message(message)?;
        let transport = self.transport.clone();

        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| SendError::transient(CHANNEL, format!("SMTP task failed: {e}")))?;

        match result {
            Ok(_) => {
                info!(to = %message.destination, "Email sent");
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(SendError::permanent(
                CHANNEL,
                format!("SMTP rejected message: {e}"),
            )),
            Err(e) => Err(SendError::transient(CHANNEL, format!("SMTP send failed: {e}"))),
        }
    }
}

/// Stable Message-ID so receiving servers can collapse duplicate sends.
fn message_id(idempotency_key: &str) -> String {
    format!("<{idempotency_key}@lead-relay>")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::automation::rule::Channel;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn config() -> SmtpConfig {
        SmtpConfig::from_lookup(lookup(&[
            ("SMTP_HOST", "smtp.test.com"),
            ("SMTP_USERNAME", "bot@acme.test"),
            ("SMTP_PASSWORD", "hunter2"),
        ]))
        .unwrap()
    }

    fn outbound(destination: &str) -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Email,
            destination: destination.into(),
            subject: Some("Acme Roofing".into()),
            body: "Hi Jane Doe!".into(),
            idempotency_key: "abc123".into(),
        }
    }

    #[test]
    fn config_absent_without_host() {
        assert!(SmtpConfig::from_lookup(lookup(&[])).is_none());
    }

    #[test]
    fn config_defaults() {
        let config = config();
        assert_eq!(config.port, 587);
        assert_eq!(config.from_address, "bot@acme.test");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn invalid_from_address_rejected() {
        let mut config = config();
        config.from_address = "not an address".into();
        assert!(matches!(
            EmailSender::new(&config, Duration::from_secs(5)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn message_carries_idempotency_message_id() {
        let sender = EmailSender::new(&config(), Duration::from_secs(5)).unwrap();
        let email = sender.build_message(&outbound("jane@x.com")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("<abc123@lead-relay>"));
        assert!(raw.contains("Subject: Acme Roofing"));
    }

    #[test]
    fn bad_destination_is_permanent() {
        let sender = EmailSender::new(&config(), Duration::from_secs(5)).unwrap();
        let err = sender.build_message(&outbound("nope")).unwrap_err();
        assert!(err.is_permanent());
    }
}
