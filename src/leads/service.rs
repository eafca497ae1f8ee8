//! CRM-side lead operations.
//!
//! Status changes schedule `status_changed` automations in the same transaction
//! as the status write, guarded by a compare-and-set on the previous status.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::automation::firing::{LeadSnapshot, TriggerSnapshot};
use crate::automation::matcher::RuleMatcher;
use crate::automation::rule::TriggerKind;
use crate::error::LeadError;
use crate::events::{EventBus, LeadEvent};
use crate::leads::model::{Lead, LeadFilter, LeadStatus, LeadSummary, LeadUpdate};
use crate::store::Database;

pub struct LeadService {
    store: Arc<dyn Database>,
    matcher: Arc<RuleMatcher>,
    bus: Arc<EventBus>,
}

impl LeadService {
    pub fn new(store: Arc<dyn Database>, matcher: Arc<RuleMatcher>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            matcher,
            bus,
        }
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Lead, LeadError> {
        self.store
            .get_lead(tenant_id, id)
            .await?
            .ok_or(LeadError::NotFound { id })
    }

    pub async fn list(&self, tenant_id: Uuid, filter: &LeadFilter) -> Result<Vec<Lead>, LeadError> {
        Ok(self.store.list_leads(tenant_id, filter).await?)
    }

    pub async fn summary(&self, tenant_id: Uuid) -> Result<LeadSummary, LeadError> {
        Ok(self.store.lead_summary(tenant_id).await?)
    }

    /// Move a lead to `status`, scheduling matching `status_changed` automations.
    ///
    /// Setting the current status again is a no-op that schedules nothing.
    pub async fn update_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: LeadStatus,
    ) -> Result<Lead, LeadError> {
        let mut lead = self.get(tenant_id, id).await?;
        if lead.status == status {
            return Ok(lead);
        }

        let from = lead.status;
        let now = Utc::now();
        lead.status = status;
        lead.updated_at = now;

        let snapshot = TriggerSnapshot {
            trigger: TriggerKind::StatusChanged,
            occurred_at: now,
            lead: LeadSnapshot::from(&lead),
        };
        let firings = self.matcher.firings_for(tenant_id, id, &snapshot).await?;

        if !self
            .store
            .update_lead_status_with_firings(tenant_id, id, from, status, now, &firings)
            .await?
        {
            return Err(LeadError::Conflict { id });
        }

        info!(
            %tenant_id,
            lead_id = %id,
            %from,
            to = %status,
            firings = firings.len(),
            "Lead status changed"
        );
        self.bus.publish(LeadEvent::LeadStatusChanged {
            tenant_id,
            lead_id: id,
            from,
            to: status,
            occurred_at: now,
            lead: snapshot.lead,
        });
        Ok(lead)
    }

    /// Apply CRM edits (tag, assignee, notes, custom fields).
    pub async fn update_details(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        update: &LeadUpdate,
    ) -> Result<Lead, LeadError> {
        let mut lead = self.get(tenant_id, id).await?;
        if update.is_empty() {
            return Ok(lead);
        }
        update.apply(&mut lead, Utc::now());
        if !self.store.update_lead_details(&lead).await? {
            return Err(LeadError::NotFound { id });
        }
        info!(%tenant_id, lead_id = %id, "Lead details updated");
        Ok(lead)
    }

    /// Delete a lead. Its pending firings are cancelled when they come due.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<(), LeadError> {
        if !self.store.delete_lead(tenant_id, id).await? {
            return Err(LeadError::NotFound { id });
        }
        info!(%tenant_id, lead_id = %id, "Lead deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration};

    use super::*;
    use crate::automation::firing::FiringStatus;
    use crate::automation::rule::{Channel, RuleDraft};
    use crate::leads::model::{CustomFields, LeadTag};
    use crate::store::LibSqlBackend;

    struct Fixture {
        store: Arc<dyn Database>,
        bus: Arc<EventBus>,
        service: LeadService,
        tenant_id: Uuid,
        lead: Lead,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let bus = EventBus::new(16);
        let service = LeadService::new(
            store.clone(),
            Arc::new(RuleMatcher::new(store.clone())),
            bus.clone(),
        );
        let tenant_id = Uuid::new_v4();
        let created = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let lead = Lead {
            id: Uuid::new_v4(),
            tenant_id,
            dedup_key: "k".into(),
            name: "Jane Doe".into(),
            email: Some("jane@x.com".into()),
            phone: Some("555-1111".into()),
            message: None,
            source: "website_build".into(),
            status: LeadStatus::New,
            tag: None,
            assigned_to: None,
            notes: None,
            custom_fields: CustomFields::new(),
            created_at: created,
            updated_at: created,
        };
        store.insert_lead_with_firings(&lead, &[]).await.unwrap();
        Fixture {
            store,
            bus,
            service,
            tenant_id,
            lead,
        }
    }

    async fn add_status_rule(fx: &Fixture, delay_minutes: i64) {
        let rule = RuleDraft {
            name: "Won Thank-You".into(),
            channel: Channel::Sms,
            trigger: TriggerKind::StatusChanged,
            template: "Thanks {{name}}!".into(),
            delay_minutes,
            is_active: true,
        }
        .into_rule(fx.tenant_id, Utc::now())
        .unwrap();
        fx.store.create_rule(&rule).await.unwrap();
    }

    #[tokio::test]
    async fn status_change_schedules_and_publishes() {
        let fx = fixture().await;
        add_status_rule(&fx, 60).await;
        let mut feed = fx.bus.subscribe_tenant(fx.tenant_id);

        let before = Utc::now();
        let lead = fx
            .service
            .update_status(fx.tenant_id, fx.lead.id, LeadStatus::Won)
            .await
            .unwrap();
        assert_eq!(lead.status, LeadStatus::Won);
        assert_eq!(lead.created_at, fx.lead.created_at);

        let firings = fx.store.list_firings(fx.tenant_id, None, 10).await.unwrap();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].status, FiringStatus::Pending);
        assert_eq!(firings[0].trigger_snapshot.lead.status, LeadStatus::Won);
        assert!(firings[0].fire_at >= before + Duration::minutes(60) - Duration::seconds(1));

        match feed.recv().await.unwrap() {
            LeadEvent::LeadStatusChanged { from, to, .. } => {
                assert_eq!(from, LeadStatus::New);
                assert_eq!(to, LeadStatus::Won);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_status_is_noop() {
        let fx = fixture().await;
        add_status_rule(&fx, 0).await;
        fx.service
            .update_status(fx.tenant_id, fx.lead.id, LeadStatus::New)
            .await
            .unwrap();
        assert!(fx.store.list_firings(fx.tenant_id, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_change_requires_existing_lead() {
        let fx = fixture().await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            fx.service
                .update_status(fx.tenant_id, missing, LeadStatus::Contacted)
                .await,
            Err(LeadError::NotFound { .. })
        ));
        // Another tenant's id space.
        assert!(matches!(
            fx.service
                .update_status(Uuid::new_v4(), fx.lead.id, LeadStatus::Contacted)
                .await,
            Err(LeadError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn details_update_keeps_created_at() {
        let fx = fixture().await;
        let update: LeadUpdate =
            serde_json::from_str(r#"{"tag":"Hot","assigned_to":"sam","notes":"call back"}"#)
                .unwrap();
        let lead = fx
            .service
            .update_details(fx.tenant_id, fx.lead.id, &update)
            .await
            .unwrap();
        assert_eq!(lead.tag, Some(LeadTag::Hot));

        let stored = fx.service.get(fx.tenant_id, fx.lead.id).await.unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("sam"));
        assert_eq!(stored.notes.as_deref(), Some("call back"));
        assert_eq!(stored.created_at, fx.lead.created_at);
        assert!(stored.updated_at > fx.lead.updated_at);
    }

    #[tokio::test]
    async fn delete_then_missing() {
        let fx = fixture().await;
        fx.service.delete(fx.tenant_id, fx.lead.id).await.unwrap();
        assert!(matches!(
            fx.service.delete(fx.tenant_id, fx.lead.id).await,
            Err(LeadError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn summary_and_list() {
        let fx = fixture().await;
        fx.service
            .update_status(fx.tenant_id, fx.lead.id, LeadStatus::Contacted)
            .await
            .unwrap();
        let summary = fx.service.summary(fx.tenant_id).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.by_status["Contacted"], 1);

        let filter = LeadFilter {
            status: Some(LeadStatus::Contacted),
            ..Default::default()
        };
        assert_eq!(fx.service.list(fx.tenant_id, &filter).await.unwrap().len(), 1);
    }
}
