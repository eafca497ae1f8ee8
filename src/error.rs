//! Error types for lead-relay.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Lead error: {0}")]
    Lead(#[from] LeadError),

    #[error("Automation rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors. Every Lead/ScheduledFiring write failure surfaces as one of these.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Webhook intake errors.
///
/// A duplicate delivery is not represented here: it is a successful outcome.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Unknown or disabled webhook token")]
    Authentication,

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),
}

/// Errors from the CRM-side lead operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    #[error("Lead {id} not found")]
    NotFound { id: Uuid },

    #[error("Lead {id} was modified concurrently")]
    Conflict { id: Uuid },

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),
}

/// Errors from automation rule management.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid automation rule: {0}")]
    Validation(String),

    #[error("Automation rule {id} not found")]
    NotFound { id: Uuid },

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),
}

/// Outcome of a failed call to an external channel provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Provider temporarily unavailable; the dispatcher retries with backoff.
    #[error("Transient send failure on {channel}: {reason}")]
    Transient { channel: String, reason: String },

    /// Provider rejected the message; never retried.
    #[error("Permanent send failure on {channel}: {reason}")]
    Permanent { channel: String, reason: String },
}

impl SendError {
    pub fn transient(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        SendError::Transient {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        SendError::Permanent {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent { .. })
    }
}

/// Result type alias for lead-relay.
pub type Result<T> = std::result::Result<T, Error>;
