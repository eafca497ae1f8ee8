//! Automation rules: "when X happens to a lead, send this message after N minutes".
//!
//! Rules are owned by the settings screen. The engine only reads them, and
//! re-reads `is_active` when a scheduled firing comes due.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleError;

/// Delivery medium for an automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Email,
    #[serde(rename = "SMS")]
    Sms,
}

impl Channel {
    /// The string tag stored in the DB channel column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Channel::Email => "Email",
            Channel::Sms => "SMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// The lead event a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    LeadReceived,
    StatusChanged,
}

impl TriggerKind {
    /// The string tag stored in the DB trigger_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            TriggerKind::LeadReceived => "lead_received",
            TriggerKind::StatusChanged => "status_changed",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

impl FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead_received" => Ok(TriggerKind::LeadReceived),
            "status_changed" => Ok(TriggerKind::StatusChanged),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// A tenant's automation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub channel: Channel,
    pub trigger: TriggerKind,
    pub template: String,
    pub delay_minutes: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the settings screen when creating or editing a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub channel: Channel,
    pub trigger: TriggerKind,
    pub template: String,
    /// Signed so a negative value reaches validation instead of failing to parse.
    #[serde(default)]
    pub delay_minutes: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleDraft {
    /// Check the draft and return the normalized name, template, and delay.
    fn validated(&self) -> Result<(String, String, u32), RuleError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(RuleError::Validation("name must not be empty".into()));
        }
        if self.template.trim().is_empty() {
            return Err(RuleError::Validation("template must not be empty".into()));
        }
        let delay = u32::try_from(self.delay_minutes).map_err(|_| {
            RuleError::Validation(format!(
                "delay_minutes must be between 0 and {}, got {}",
                u32::MAX,
                self.delay_minutes
            ))
        })?;
        Ok((name.to_string(), self.template.clone(), delay))
    }

    /// Build a new rule for `tenant_id`.
    pub fn into_rule(self, tenant_id: Uuid, now: DateTime<Utc>) -> Result<AutomationRule, RuleError> {
        let (name, template, delay_minutes) = self.validated()?;
        Ok(AutomationRule {
            id: Uuid::new_v4(),
            tenant_id,
            name,
            channel: self.channel,
            trigger: self.trigger,
            template,
            delay_minutes,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Overwrite the editable fields of an existing rule.
    pub fn apply_to(self, rule: &mut AutomationRule, now: DateTime<Utc>) -> Result<(), RuleError> {
        let (name, template, delay_minutes) = self.validated()?;
        rule.name = name;
        rule.channel = self.channel;
        rule.trigger = self.trigger;
        rule.template = template;
        rule.delay_minutes = delay_minutes;
        rule.is_active = self.is_active;
        rule.updated_at = now;
        Ok(())
    }
}
