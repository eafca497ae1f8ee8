//! Scheduled firings: durable units of follow-up work.
//!
//! The matcher creates them; only the dispatcher changes their status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::automation::rule::{AutomationRule, TriggerKind};
use crate::leads::model::{CustomFields, Lead, LeadStatus};

/// Lifecycle of a firing. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl fmt::Display for FiringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiringStatus::Pending => write!(f, "pending"),
            FiringStatus::Sent => write!(f, "sent"),
            FiringStatus::Failed => write!(f, "failed"),
            FiringStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for FiringStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FiringStatus::Pending),
            "sent" => Ok(FiringStatus::Sent),
            "failed" => Ok(FiringStatus::Failed),
            "cancelled" => Ok(FiringStatus::Cancelled),
            other => Err(format!("unknown firing status: {other}")),
        }
    }
}

/// Copy of the lead fields as they were when the trigger happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub message: Option<String>,
    pub source: String,
    pub status: LeadStatus,
    pub custom_fields: CustomFields,
}

impl From<&Lead> for LeadSnapshot {
    fn from(lead: &Lead) -> Self {
        Self {
            name: lead.name.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            message: lead.message.clone(),
            source: lead.source.clone(),
            status: lead.status,
            custom_fields: lead.custom_fields.clone(),
        }
    }
}

/// Event time plus the payload copy used for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub trigger: TriggerKind,
    pub occurred_at: DateTime<Utc>,
    pub lead: LeadSnapshot,
}

/// A piece of scheduled follow-up work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledFiring {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub automation_id: Uuid,
    pub lead_id: Uuid,
    pub trigger_snapshot: TriggerSnapshot,
    pub fire_at: DateTime<Utc>,
    pub status: FiringStatus,
    pub attempt_count: u32,
    pub idempotency_key: String,
    pub leased_by: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledFiring {
    /// Plan a pending firing of `rule` for `lead_id`, due `delay_minutes` after the event.
    pub fn plan(rule: &AutomationRule, lead_id: Uuid, snapshot: TriggerSnapshot) -> Self {
        let fire_at = snapshot.occurred_at + ChronoDuration::minutes(i64::from(rule.delay_minutes));
        let idempotency_key = idempotency_key(rule.id, lead_id, &snapshot);
        let created_at = snapshot.occurred_at;
        Self {
            id: Uuid::new_v4(),
            tenant_id: rule.tenant_id,
            automation_id: rule.id,
            lead_id,
            trigger_snapshot: snapshot,
            fire_at,
            status: FiringStatus::Pending,
            attempt_count: 0,
            idempotency_key,
            leased_by: None,
            leased_until: None,
            last_error: None,
            sent_at: None,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Deterministic key over rule, lead, and trigger snapshot.
///
/// Redelivery of the same event produces the same key, which the store uses to
/// drop duplicate firings and which is forwarded to providers for send dedup.
pub fn idempotency_key(automation_id: Uuid, lead_id: Uuid, snapshot: &TriggerSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(automation_id.as_bytes());
    hasher.update(lead_id.as_bytes());
    // Field order is fixed by the struct and custom fields are a BTreeMap.
    hasher.update(serde_json::to_vec(snapshot).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}
