//! Leads: the stored record and CRM-side operations on it.

pub mod model;
pub mod service;

pub use model::{CustomFields, Lead, LeadFilter, LeadStatus, LeadSummary, LeadTag, LeadUpdate};
pub use service::LeadService;
