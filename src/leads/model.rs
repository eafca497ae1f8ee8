//! Lead records as stored and served to the CRM.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Open, schema-less extra fields captured from the webhook payload.
pub type CustomFields = BTreeMap<String, serde_json::Value>;

/// Sales pipeline status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadStatus {
    New,
    Contacted,
    Won,
    Lost,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 4] = [
        LeadStatus::New,
        LeadStatus::Contacted,
        LeadStatus::Won,
        LeadStatus::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "New",
            LeadStatus::Contacted => "Contacted",
            LeadStatus::Won => "Won",
            LeadStatus::Lost => "Lost",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "won" => Ok(LeadStatus::Won),
            "lost" => Ok(LeadStatus::Lost),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// CRM temperature tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadTag {
    Hot,
    Warm,
    Cold,
}

impl LeadTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadTag::Hot => "Hot",
            LeadTag::Warm => "Warm",
            LeadTag::Cold => "Cold",
        }
    }
}

impl FromStr for LeadTag {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(LeadTag::Hot),
            "warm" => Ok(LeadTag::Warm),
            "cold" => Ok(LeadTag::Cold),
            other => Err(format!("unknown lead tag: {other}")),
        }
    }
}

/// A lead captured from a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Tenant-scoped key collapsing duplicate webhook deliveries.
    #[serde(skip_serializing, default)]
    pub dedup_key: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub message: Option<String>,
    pub source: String,
    pub status: LeadStatus,
    pub tag: Option<LeadTag>,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub custom_fields: CustomFields,
    /// Set once at ingestion.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CRM edits. `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadUpdate {
    #[serde(default, with = "double_option")]
    pub tag: Option<Option<LeadTag>>,
    #[serde(default, with = "double_option")]
    pub assigned_to: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub notes: Option<Option<String>>,
    /// Keys merged into the existing map; a JSON `null` value removes the key.
    #[serde(default)]
    pub custom_fields: Option<CustomFields>,
}

impl LeadUpdate {
    pub fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.assigned_to.is_none()
            && self.notes.is_none()
            && self.custom_fields.is_none()
    }

    /// Apply the edit to a lead in place.
    pub fn apply(&self, lead: &mut Lead, now: DateTime<Utc>) {
        if let Some(tag) = self.tag {
            lead.tag = tag;
        }
        if let Some(assigned) = &self.assigned_to {
            lead.assigned_to = assigned.clone();
        }
        if let Some(notes) = &self.notes {
            lead.notes = notes.clone();
        }
        if let Some(fields) = &self.custom_fields {
            for (key, value) in fields {
                if value.is_null() {
                    lead.custom_fields.remove(key);
                } else {
                    lead.custom_fields.insert(key.clone(), value.clone());
                }
            }
        }
        lead.updated_at = now;
    }
}

/// Listing filter for the leads table.
#[derive(Debug, Clone, Deserialize)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub tag: Option<LeadTag>,
    pub source: Option<String>,
    /// Case-insensitive substring over name, email, and phone.
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for LeadFilter {
    fn default() -> Self {
        Self {
            status: None,
            tag: None,
            source: None,
            search: None,
            limit: default_limit(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

/// Dashboard overview counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadSummary {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
