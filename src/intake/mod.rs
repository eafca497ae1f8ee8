//! Webhook intake: payload normalization, dedup keys, and the gateway.

pub mod dedup;
pub mod gateway;
pub mod payload;

pub use gateway::{IntakeGateway, IntakeOutcome};
pub use payload::NormalizedLead;
