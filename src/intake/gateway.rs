//! Intake gateway: the single write path for new leads.
//!
//! The lead row and the firings of every matching `lead_received` rule are
//! written in one transaction, so a crash can never leave a stored lead with
//! no scheduled follow-up. The bus event is published afterwards and is only
//! a notification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automation::firing::{LeadSnapshot, TriggerSnapshot};
use crate::automation::matcher::RuleMatcher;
use crate::automation::rule::TriggerKind;
use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::events::{EventBus, LeadEvent};
use crate::intake::dedup::dedup_key;
use crate::intake::payload::NormalizedLead;
use crate::leads::model::{Lead, LeadStatus};
use crate::store::Database;

/// Successful intake result. Both variants mean "accepted" to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// First delivery: the lead was stored and its firings scheduled.
    Accepted { lead_id: Uuid, firings: usize },
    /// A lead with the same dedup key already exists; nothing was written.
    Duplicate { lead_id: Option<Uuid> },
}

impl IntakeOutcome {
    pub fn lead_id(&self) -> Option<Uuid> {
        match self {
            IntakeOutcome::Accepted { lead_id, .. } => Some(*lead_id),
            IntakeOutcome::Duplicate { lead_id } => *lead_id,
        }
    }
}

pub struct IntakeGateway {
    store: Arc<dyn Database>,
    matcher: Arc<RuleMatcher>,
    bus: Arc<EventBus>,
    config: IntakeConfig,
}

impl IntakeGateway {
    pub fn new(
        store: Arc<dyn Database>,
        matcher: Arc<RuleMatcher>,
        bus: Arc<EventBus>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            store,
            matcher,
            bus,
            config,
        }
    }

    /// Accept a raw webhook delivery for the tenant owning `token`.
    ///
    /// `header_hint` (the `Idempotency-Key` header) takes precedence over an
    /// `idempotency_key` field in the body.
    pub async fn ingest(
        &self,
        token: &str,
        body: &[u8],
        header_hint: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<IntakeOutcome, IntakeError> {
        let tenant = match self.store.get_tenant_by_token(token).await? {
            Some(tenant) if tenant.enabled => tenant,
            Some(tenant) => {
                warn!(tenant_id = %tenant.id, "Webhook delivery for disabled tenant rejected");
                return Err(IntakeError::Authentication);
            }
            None => {
                warn!("Webhook delivery with unknown token rejected");
                return Err(IntakeError::Authentication);
            }
        };

        let payload = NormalizedLead::from_slice(body)?;
        let hint = header_hint
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .or(payload.idempotency_hint.as_deref());
        let key = dedup_key(tenant.id, &payload, hint, received_at, self.config.dedup_bucket);

        let lead = Lead {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            dedup_key: key,
            name: payload.name,
            email: payload.email,
            phone: payload.phone,
            message: payload.message,
            source: payload.source,
            status: LeadStatus::New,
            tag: None,
            assigned_to: None,
            notes: None,
            custom_fields: payload.custom_fields,
            created_at: received_at,
            updated_at: received_at,
        };

        let snapshot = TriggerSnapshot {
            trigger: TriggerKind::LeadReceived,
            occurred_at: received_at,
            lead: LeadSnapshot::from(&lead),
        };
        let firings = self
            .matcher
            .firings_for(tenant.id, lead.id, &snapshot)
            .await?;

        if !self.store.insert_lead_with_firings(&lead, &firings).await? {
            let existing = self
                .store
                .get_lead_by_dedup_key(tenant.id, &lead.dedup_key)
                .await?;
            let lead_id = existing.map(|l| l.id);
            info!(
                tenant_id = %tenant.id,
                lead_id = ?lead_id,
                "Duplicate webhook delivery ignored"
            );
            return Ok(IntakeOutcome::Duplicate { lead_id });
        }

        info!(
            tenant_id = %tenant.id,
            lead_id = %lead.id,
            source = %lead.source,
            firings = firings.len(),
            "Lead accepted"
        );
        self.bus.publish(LeadEvent::LeadReceived {
            tenant_id: tenant.id,
            lead_id: lead.id,
            occurred_at: received_at,
            lead: snapshot.lead,
        });

        Ok(IntakeOutcome::Accepted {
            lead_id: lead.id,
            firings: firings.len(),
        })
    }
}
