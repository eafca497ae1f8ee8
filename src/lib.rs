//! Lead Relay: webhook lead intake with scheduled follow-up automations.

pub mod api;
pub mod automation;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod intake;
pub mod leads;
pub mod store;
pub mod tenants;
