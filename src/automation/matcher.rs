//! Rule matcher: turns lead events into scheduled firings.
//!
//! Intake and status changes call [`RuleMatcher::firings_for`] and persist the
//! result in the same transaction as the lead write. Replanning the same trigger
//! yields the same idempotency keys, so re-inserting is a no-op.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::automation::firing::{ScheduledFiring, TriggerSnapshot};
use crate::automation::rule::AutomationRule;
use crate::error::DatabaseError;
use crate::store::Database;

pub struct RuleMatcher {
    store: Arc<dyn Database>,
}

impl RuleMatcher {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Plan one firing per active rule reacting to the snapshot's trigger.
    pub fn plan(
        rules: &[AutomationRule],
        tenant_id: Uuid,
        lead_id: Uuid,
        snapshot: &TriggerSnapshot,
    ) -> Vec<ScheduledFiring> {
        rules
            .iter()
            .filter(|r| r.is_active && r.tenant_id == tenant_id && r.trigger == snapshot.trigger)
            .map(|r| ScheduledFiring::plan(r, lead_id, snapshot.clone()))
            .collect()
    }

    /// Load the tenant's matching rules and plan their firings.
    pub async fn firings_for(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        snapshot: &TriggerSnapshot,
    ) -> Result<Vec<ScheduledFiring>, DatabaseError> {
        let rules = self
            .store
            .list_active_rules(tenant_id, snapshot.trigger)
            .await?;
        let firings = Self::plan(&rules, tenant_id, lead_id, snapshot);
        debug!(
            %tenant_id,
            %lead_id,
            trigger = %snapshot.trigger,
            matched = firings.len(),
            "Rules matched"
        );
        Ok(firings)
    }
}
