//! Unified `Database` trait: single async interface for all persistence.
//!
//! Lead rows have exactly two write paths: webhook intake (insert) and the CRM
//! lead service (status/details/delete). Firing status transitions are all
//! compare-and-set on `(status = pending, leased_by = worker)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::firing::{FiringStatus, ScheduledFiring};
use crate::automation::rule::{AutomationRule, TriggerKind};
use crate::error::DatabaseError;
use crate::leads::model::{Lead, LeadFilter, LeadStatus, LeadSummary};
use crate::tenants::Tenant;

/// Backend-agnostic database trait covering tenants, leads, rules, and firings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError>;

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError>;

    /// Resolve a webhook token to its tenant (enabled or not).
    async fn get_tenant_by_token(&self, token: &str) -> Result<Option<Tenant>, DatabaseError>;

    /// Persist profile fields. Returns `false` if the tenant does not exist.
    async fn update_tenant_profile(&self, tenant: &Tenant) -> Result<bool, DatabaseError>;

    async fn set_tenant_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead and its initial firings in one transaction.
    ///
    /// Conflict on `(tenant_id, dedup_key)` is a no-op that returns `false`
    /// and writes no firings. Firings whose idempotency key already exists are skipped.
    async fn insert_lead_with_firings(
        &self,
        lead: &Lead,
        firings: &[ScheduledFiring],
    ) -> Result<bool, DatabaseError>;

    /// Look up the lead already stored under a dedup key.
    async fn get_lead_by_dedup_key(
        &self,
        tenant_id: Uuid,
        dedup_key: &str,
    ) -> Result<Option<Lead>, DatabaseError>;

    async fn get_lead(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Newest first.
    async fn list_leads(
        &self,
        tenant_id: Uuid,
        filter: &LeadFilter,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Move a lead from `from` to `to` and insert the resulting firings atomically.
    ///
    /// Returns `false` (writing nothing) if the lead is gone or no longer in `from`.
    async fn update_lead_status_with_firings(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: LeadStatus,
        to: LeadStatus,
        updated_at: DateTime<Utc>,
        firings: &[ScheduledFiring],
    ) -> Result<bool, DatabaseError>;

    /// Persist CRM-editable fields (tag, assignee, notes, custom fields).
    async fn update_lead_details(&self, lead: &Lead) -> Result<bool, DatabaseError>;

    async fn delete_lead(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError>;

    async fn lead_summary(&self, tenant_id: Uuid) -> Result<LeadSummary, DatabaseError>;

    // ── Automation rules ────────────────────────────────────────────

    async fn create_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError>;

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AutomationRule>, DatabaseError>;

    /// Active rules of a tenant reacting to `trigger`.
    async fn list_active_rules(
        &self,
        tenant_id: Uuid,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>, DatabaseError>;

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, DatabaseError>;

    async fn set_rule_active(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        is_active: bool,
    ) -> Result<bool, DatabaseError>;

    async fn delete_rule(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Scheduled firings ───────────────────────────────────────────

    /// Insert firings, skipping any whose idempotency key exists. Returns the number inserted.
    async fn insert_firings(&self, firings: &[ScheduledFiring]) -> Result<usize, DatabaseError>;

    async fn get_firing(&self, id: Uuid) -> Result<Option<ScheduledFiring>, DatabaseError>;

    async fn list_firings(
        &self,
        tenant_id: Uuid,
        status: Option<FiringStatus>,
        limit: u32,
    ) -> Result<Vec<ScheduledFiring>, DatabaseError>;

    /// Pending firings with `fire_at <= now` whose lease is absent or expired.
    async fn count_due_firings(&self, now: DateTime<Utc>) -> Result<i64, DatabaseError>;

    /// Lease up to `limit` due firings to `worker_id` until `lease_until`.
    ///
    /// A row is only returned if this call's compare-and-set took the lease.
    async fn claim_due_firings(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledFiring>, DatabaseError>;

    /// Pending → Sent.
    async fn mark_firing_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Pending → Cancelled.
    async fn mark_firing_cancelled(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Pending → Failed.
    async fn mark_firing_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Pending → Pending at a later `fire_at`, releasing the lease.
    async fn reschedule_firing(
        &self,
        id: Uuid,
        worker_id: &str,
        attempt_count: u32,
        next_fire_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
