//! Tenants: isolated accounts owning leads, rules, and a webhook token.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of an issued webhook token.
const WEBHOOK_TOKEN_LEN: usize = 40;

/// A tenant and its business profile.
///
/// `webhook_token` is a bearer secret: it is skipped when serializing so it only
/// leaves the process through [`IssuedTenant`] at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub business_name: Option<String>,
    pub email: Option<String>,
    /// Rendered as `{{business_phone}}` in automation templates.
    pub phone: Option<String>,
    #[serde(skip_serializing, default)]
    pub webhook_token: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields editable from the settings screen.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantProfile {
    pub business_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A freshly provisioned tenant, the only value that carries the token outward.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTenant {
    #[serde(flatten)]
    pub tenant: Tenant,
    pub webhook_token: String,
    pub webhook_path: String,
}

impl Tenant {
    /// Create an enabled tenant with a freshly issued webhook token.
    pub fn new(profile: TenantProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            business_name: clean(profile.business_name),
            email: clean(profile.email),
            phone: clean(profile.phone),
            webhook_token: issue_webhook_token(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_issued(self) -> IssuedTenant {
        let webhook_token = self.webhook_token.clone();
        IssuedTenant {
            webhook_path: format!("/webhook-leads/{webhook_token}"),
            webhook_token,
            tenant: self,
        }
    }

    /// Apply a profile edit, normalizing blanks to `None`.
    pub fn apply_profile(&mut self, profile: TenantProfile, now: DateTime<Utc>) {
        self.business_name = clean(profile.business_name);
        self.email = clean(profile.email);
        self.phone = clean(profile.phone);
        self.updated_at = now;
    }
}

/// Generate a webhook token from the OS RNG.
pub fn issue_webhook_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(WEBHOOK_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
