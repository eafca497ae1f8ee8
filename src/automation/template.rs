//! Template rendering for automation messages.
//!
//! Pure substitution of `{{placeholder}}` tokens. Rendering cannot fail:
//! a known placeholder with no value becomes empty, an unknown one is kept verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::automation::firing::LeadSnapshot;
use crate::tenants::Tenant;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex"));

/// Custom field consulted for `{{service}}`.
const SERVICE_FIELD: &str = "service";

/// Values available to a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub service: Option<String>,
    pub business_phone: Option<String>,
}

impl RenderContext {
    /// Build from the trigger-time lead copy and the tenant profile.
    pub fn new(lead: &LeadSnapshot, tenant: Option<&Tenant>) -> Self {
        Self {
            name: Some(lead.name.clone()),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            service: lead
                .custom_fields
                .get(SERVICE_FIELD)
                .and_then(|v| v.as_str())
                .map(String::from),
            business_phone: tenant.and_then(|t| t.phone.clone()),
        }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        let value = match key {
            "name" => &self.name,
            "email" => &self.email,
            "phone" => &self.phone,
            "service" => &self.service,
            "business_phone" => &self.business_phone,
            _ => return None,
        };
        Some(value.as_deref().unwrap_or(""))
    }
}

/// Substitute recognized placeholders in `template`.
pub fn render(template: &str, ctx: &RenderContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match ctx.lookup(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
