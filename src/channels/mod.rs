//! Outbound channel providers: the boundary the dispatcher sends through.

pub mod email;
pub mod sms;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::automation::rule::Channel;
use crate::error::SendError;

pub use email::{EmailSender, SmtpConfig};
pub use sms::{HttpSmsSender, SmsConfig};

/// A rendered message ready for a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    /// Email address or phone number, depending on `channel`.
    pub destination: String,
    /// Email only.
    pub subject: Option<String>,
    pub body: String,
    /// Forwarded so providers can drop duplicate sends.
    pub idempotency_key: String,
}

/// External send capability.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver one message. Transient errors are retried by the caller.
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Routes each message to the provider configured for its channel.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    email: Option<Arc<dyn MessageSender>>,
    sms: Option<Arc<dyn MessageSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_email(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.email = Some(sender);
        self
    }

    pub fn with_sms(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sms = Some(sender);
        self
    }

    fn provider(&self, channel: Channel) -> Option<&Arc<dyn MessageSender>> {
        match channel {
            Channel::Email => self.email.as_ref(),
            Channel::Sms => self.sms.as_ref(),
        }
    }
}

#[async_trait]
impl MessageSender for ChannelRouter {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        match self.provider(message.channel) {
            Some(provider) => provider.send(message).await,
            // Retried until a provider is configured or attempts run out.
            None => Err(SendError::transient(
                message.channel.to_string(),
                "no provider configured for channel",
            )),
        }
    }
}

/// In-memory sender that records deliveries and replays scripted failures.
///
/// Behaves like a provider honouring idempotency keys: a key that was already
/// delivered is acknowledged without being recorded twice.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    script: Mutex<VecDeque<SendError>>,
    attempts: Mutex<usize>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SendError>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(errors);
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Calls to `send`, including failed and deduplicated ones.
    pub fn attempts(&self) -> usize {
        self.attempts.lock().map(|a| *a).unwrap_or_default()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts += 1;
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| SendError::transient(message.channel.to_string(), "recorder poisoned"))?;
        if !sent.iter().any(|m| m.idempotency_key == message.idempotency_key) {
            sent.push(message.clone());
        }
        Ok(())
    }
}
