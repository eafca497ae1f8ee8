//! Rule management for the settings screen.
//!
//! Changes are observed by the dispatcher on its next claim, not immediately.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::automation::firing::{FiringStatus, ScheduledFiring};
use crate::automation::rule::{AutomationRule, RuleDraft};
use crate::error::RuleError;
use crate::store::Database;

pub struct RuleService {
    store: Arc<dyn Database>,
}

impl RuleService {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn create(&self, tenant_id: Uuid, draft: RuleDraft) -> Result<AutomationRule, RuleError> {
        let rule = draft.into_rule(tenant_id, Utc::now())?;
        self.store.create_rule(&rule).await?;
        info!(%tenant_id, rule_id = %rule.id, name = %rule.name, trigger = %rule.trigger, "Automation rule created");
        Ok(rule)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<AutomationRule, RuleError> {
        match self.store.get_rule(id).await? {
            Some(rule) if rule.tenant_id == tenant_id => Ok(rule),
            _ => Err(RuleError::NotFound { id }),
        }
    }

    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<AutomationRule>, RuleError> {
        Ok(self.store.list_rules(tenant_id).await?)
    }

    /// Replace the editable fields of a rule.
    pub async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        draft: RuleDraft,
    ) -> Result<AutomationRule, RuleError> {
        let mut rule = self.get(tenant_id, id).await?;
        draft.apply_to(&mut rule, Utc::now())?;
        if !self.store.update_rule(&rule).await? {
            return Err(RuleError::NotFound { id });
        }
        info!(%tenant_id, rule_id = %id, is_active = rule.is_active, "Automation rule updated");
        Ok(rule)
    }

    pub async fn set_active(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        is_active: bool,
    ) -> Result<AutomationRule, RuleError> {
        if !self.store.set_rule_active(tenant_id, id, is_active).await? {
            return Err(RuleError::NotFound { id });
        }
        info!(%tenant_id, rule_id = %id, is_active, "Automation rule toggled");
        self.get(tenant_id, id).await
    }

    /// Delete a rule. Its pending firings are cancelled by the dispatcher when they come due.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<(), RuleError> {
        if !self.store.delete_rule(tenant_id, id).await? {
            return Err(RuleError::NotFound { id });
        }
        info!(%tenant_id, rule_id = %id, "Automation rule deleted");
        Ok(())
    }

    /// Recent firings for the tenant, newest first.
    pub async fn firings(
        &self,
        tenant_id: Uuid,
        status: Option<FiringStatus>,
        limit: u32,
    ) -> Result<Vec<ScheduledFiring>, RuleError> {
        Ok(self.store.list_firings(tenant_id, status, limit).await?)
    }
}
