//! libSQL backend: async `Database` trait implementation.
//!
//! A single connection is shared behind an async mutex, so every operation is
//! serialized and multi-statement transactions cannot interleave with other
//! callers. Lead intake and dispatch are write-light; this is not a bottleneck.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::automation::firing::{FiringStatus, ScheduledFiring, TriggerSnapshot};
use crate::automation::rule::{AutomationRule, Channel, TriggerKind};
use crate::error::DatabaseError;
use crate::leads::model::{CustomFields, Lead, LeadFilter, LeadStatus, LeadSummary, LeadTag};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tenants::Tenant;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Other processes may share the file; wait on their locks instead of failing.
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Lock the connection for the duration of one operation.
    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width, so text comparison matches time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid in {column}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn row_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

const TENANT_COLUMNS: &str =
    "id, business_name, email, phone, webhook_token, enabled, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, tenant_id, dedup_key, name, email, phone, message, source, status, tag, assigned_to, notes, custom_fields, created_at, updated_at";

const RULE_COLUMNS: &str = "id, tenant_id, name, channel, trigger_type, template, delay_minutes, is_active, created_at, updated_at";

const FIRING_COLUMNS: &str = "id, tenant_id, automation_id, lead_id, trigger_snapshot, fire_at, status, attempt_count, idempotency_key, leased_by, leased_until, last_error, sent_at, created_at, updated_at";

fn row_to_tenant(row: &libsql::Row) -> Result<Tenant, DatabaseError> {
    let err = row_err("tenant row");
    let id: String = row.get(0).map_err(&err)?;
    Ok(Tenant {
        id: parse_uuid(&id, "tenants.id")?,
        business_name: row.get(1).map_err(&err)?,
        email: row.get(2).map_err(&err)?,
        phone: row.get(3).map_err(&err)?,
        webhook_token: row.get(4).map_err(&err)?,
        enabled: row.get::<i64>(5).map_err(&err)? != 0,
        created_at: parse_datetime(&row.get::<String>(6).map_err(&err)?),
        updated_at: parse_datetime(&row.get::<String>(7).map_err(&err)?),
    })
}

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let err = row_err("lead row");
    let id: String = row.get(0).map_err(&err)?;
    let tenant_id: String = row.get(1).map_err(&err)?;
    let status: String = row.get(8).map_err(&err)?;
    let tag: Option<String> = row.get(9).map_err(&err)?;
    let custom_fields: String = row.get(12).map_err(&err)?;

    Ok(Lead {
        id: parse_uuid(&id, "leads.id")?,
        tenant_id: parse_uuid(&tenant_id, "leads.tenant_id")?,
        dedup_key: row.get(2).map_err(&err)?,
        name: row.get(3).map_err(&err)?,
        email: row.get(4).map_err(&err)?,
        phone: row.get(5).map_err(&err)?,
        message: row.get(6).map_err(&err)?,
        source: row.get(7).map_err(&err)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        tag: tag
            .map(|t| t.parse::<LeadTag>())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        assigned_to: row.get(10).map_err(&err)?,
        notes: row.get(11).map_err(&err)?,
        custom_fields: serde_json::from_str::<CustomFields>(&custom_fields)
            .map_err(|e| DatabaseError::Serialization(format!("leads.custom_fields: {e}")))?,
        created_at: parse_datetime(&row.get::<String>(13).map_err(&err)?),
        updated_at: parse_datetime(&row.get::<String>(14).map_err(&err)?),
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<AutomationRule, DatabaseError> {
    let err = row_err("automation row");
    let id: String = row.get(0).map_err(&err)?;
    let tenant_id: String = row.get(1).map_err(&err)?;
    let channel: String = row.get(3).map_err(&err)?;
    let trigger: String = row.get(4).map_err(&err)?;
    let delay: i64 = row.get(6).map_err(&err)?;

    Ok(AutomationRule {
        id: parse_uuid(&id, "automations.id")?,
        tenant_id: parse_uuid(&tenant_id, "automations.tenant_id")?,
        name: row.get(2).map_err(&err)?,
        channel: channel.parse::<Channel>().map_err(DatabaseError::Serialization)?,
        trigger: trigger
            .parse::<TriggerKind>()
            .map_err(DatabaseError::Serialization)?,
        template: row.get(5).map_err(&err)?,
        delay_minutes: u32::try_from(delay).map_err(|_| {
            DatabaseError::Serialization(format!("automations.delay_minutes out of range: {delay}"))
        })?,
        is_active: row.get::<i64>(7).map_err(&err)? != 0,
        created_at: parse_datetime(&row.get::<String>(8).map_err(&err)?),
        updated_at: parse_datetime(&row.get::<String>(9).map_err(&err)?),
    })
}

fn row_to_firing(row: &libsql::Row) -> Result<ScheduledFiring, DatabaseError> {
    let err = row_err("firing row");
    let id: String = row.get(0).map_err(&err)?;
    let tenant_id: String = row.get(1).map_err(&err)?;
    let automation_id: String = row.get(2).map_err(&err)?;
    let lead_id: String = row.get(3).map_err(&err)?;
    let snapshot: String = row.get(4).map_err(&err)?;
    let status: String = row.get(6).map_err(&err)?;
    let attempts: i64 = row.get(7).map_err(&err)?;

    Ok(ScheduledFiring {
        id: parse_uuid(&id, "scheduled_firings.id")?,
        tenant_id: parse_uuid(&tenant_id, "scheduled_firings.tenant_id")?,
        automation_id: parse_uuid(&automation_id, "scheduled_firings.automation_id")?,
        lead_id: parse_uuid(&lead_id, "scheduled_firings.lead_id")?,
        trigger_snapshot: serde_json::from_str::<TriggerSnapshot>(&snapshot).map_err(|e| {
            DatabaseError::Serialization(format!("scheduled_firings.trigger_snapshot: {e}"))
        })?,
        fire_at: parse_datetime(&row.get::<String>(5).map_err(&err)?),
        status: status
            .parse::<FiringStatus>()
            .map_err(DatabaseError::Serialization)?,
        attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        idempotency_key: row.get(8).map_err(&err)?,
        leased_by: row.get(9).map_err(&err)?,
        leased_until: parse_optional_datetime(row.get(10).map_err(&err)?),
        last_error: row.get(11).map_err(&err)?,
        sent_at: parse_optional_datetime(row.get(12).map_err(&err)?),
        created_at: parse_datetime(&row.get::<String>(13).map_err(&err)?),
        updated_at: parse_datetime(&row.get::<String>(14).map_err(&err)?),
    })
}

/// Insert one firing unless its idempotency key exists. Returns rows inserted (0 or 1).
async fn insert_firing(conn: &Connection, firing: &ScheduledFiring) -> Result<u64, DatabaseError> {
    let snapshot = serde_json::to_string(&firing.trigger_snapshot)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO scheduled_firings ({FIRING_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (idempotency_key) DO NOTHING"
        ),
        params![
            firing.id.to_string(),
            firing.tenant_id.to_string(),
            firing.automation_id.to_string(),
            firing.lead_id.to_string(),
            snapshot,
            fmt_ts(firing.fire_at),
            firing.status.to_string(),
            i64::from(firing.attempt_count),
            firing.idempotency_key.clone(),
            opt_text(firing.leased_by.as_deref()),
            opt_ts(firing.leased_until),
            opt_text(firing.last_error.as_deref()),
            opt_ts(firing.sent_at),
            fmt_ts(firing.created_at),
            fmt_ts(firing.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_firing: {e}")))
}

async fn insert_firings_on(
    conn: &Connection,
    firings: &[ScheduledFiring],
) -> Result<usize, DatabaseError> {
    let mut inserted = 0;
    for firing in firings {
        if insert_firing(conn, firing).await? > 0 {
            inserted += 1;
        } else {
            debug!(
                automation_id = %firing.automation_id,
                lead_id = %firing.lead_id,
                "Duplicate firing skipped"
            );
        }
    }
    Ok(inserted)
}

async fn query_firing(conn: &Connection, id: &str) -> Result<Option<ScheduledFiring>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {FIRING_COLUMNS} FROM scheduled_firings WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_firing: {e}")))?;
    match rows.next().await.map_err(row_err("get_firing"))? {
        Some(row) => Ok(Some(row_to_firing(&row)?)),
        None => Ok(None),
    }
}

/// Begin an immediate (write-locking) transaction.
async fn begin(conn: &Connection, context: &str) -> Result<libsql::Transaction, DatabaseError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: begin: {e}")))
}

async fn commit(tx: libsql::Transaction, context: &str) -> Result<(), DatabaseError> {
    tx.commit()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: commit: {e}")))
}

async fn rollback(tx: libsql::Transaction, context: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!("{context}: rollback failed: {e}");
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(&*self.conn().await).await
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO tenants ({TENANT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                tenant.id.to_string(),
                opt_text(tenant.business_name.as_deref()),
                opt_text(tenant.email.as_deref()),
                opt_text(tenant.phone.as_deref()),
                tenant.webhook_token.clone(),
                tenant.enabled as i64,
                fmt_ts(tenant.created_at),
                fmt_ts(tenant.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_tenant: {e}")))?;

        debug!(tenant_id = %tenant.id, "Tenant inserted into DB");
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant: {e}")))?;

        match rows.next().await.map_err(row_err("get_tenant"))? {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_tenant_by_token(&self, token: &str) -> Result<Option<Tenant>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE webhook_token = ?1"),
                params![token],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant_by_token: {e}")))?;

        match rows.next().await.map_err(row_err("get_tenant_by_token"))? {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_tenant_profile(&self, tenant: &Tenant) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE tenants SET business_name = ?1, email = ?2, phone = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    opt_text(tenant.business_name.as_deref()),
                    opt_text(tenant.email.as_deref()),
                    opt_text(tenant.phone.as_deref()),
                    fmt_ts(tenant.updated_at),
                    tenant.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_tenant_profile: {e}")))?;
        Ok(count > 0)
    }

    async fn set_tenant_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE tenants SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_tenant_enabled: {e}")))?;

        debug!(tenant_id = %id, enabled, "Tenant enabled flag updated");
        Ok(count > 0)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead_with_firings(
        &self,
        lead: &Lead,
        firings: &[ScheduledFiring],
    ) -> Result<bool, DatabaseError> {
        const CTX: &str = "insert_lead_with_firings";
        let custom_fields = serde_json::to_string(&lead.custom_fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.conn().await;
        let tx = begin(&conn, CTX).await?;

        let result = async {
            let inserted = tx
                .execute(
                    &format!(
                        "INSERT INTO leads ({LEAD_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                         ON CONFLICT (tenant_id, dedup_key) DO NOTHING"
                    ),
                    params![
                        lead.id.to_string(),
                        lead.tenant_id.to_string(),
                        lead.dedup_key.clone(),
                        lead.name.clone(),
                        opt_text(lead.email.as_deref()),
                        opt_text(lead.phone.as_deref()),
                        opt_text(lead.message.as_deref()),
                        lead.source.clone(),
                        lead.status.as_str(),
                        opt_text(lead.tag.as_ref().map(LeadTag::as_str)),
                        opt_text(lead.assigned_to.as_deref()),
                        opt_text(lead.notes.as_deref()),
                        custom_fields,
                        fmt_ts(lead.created_at),
                        fmt_ts(lead.updated_at),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("{CTX}: {e}")))?;

            if inserted == 0 {
                return Ok(false);
            }
            insert_firings_on(&tx, firings).await?;
            Ok::<_, DatabaseError>(true)
        }
        .await;

        match result {
            Ok(true) => {
                commit(tx, CTX).await?;
                debug!(lead_id = %lead.id, firings = firings.len(), "Lead inserted into DB");
                Ok(true)
            }
            Ok(false) => {
                rollback(tx, CTX).await;
                Ok(false)
            }
            Err(e) => {
                rollback(tx, CTX).await;
                Err(e)
            }
        }
    }

    async fn get_lead_by_dedup_key(
        &self,
        tenant_id: Uuid,
        dedup_key: &str,
    ) -> Result<Option<Lead>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND dedup_key = ?2"),
                params![tenant_id.to_string(), dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead_by_dedup_key: {e}")))?;

        match rows.next().await.map_err(row_err("get_lead_by_dedup_key"))? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_lead(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await.map_err(row_err("get_lead"))? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_leads(
        &self,
        tenant_id: Uuid,
        filter: &LeadFilter,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));

        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE tenant_id = ?1
                       AND (?2 IS NULL OR status = ?2)
                       AND (?3 IS NULL OR tag = ?3)
                       AND (?4 IS NULL OR source = ?4)
                       AND (?5 IS NULL
                            OR LOWER(name) LIKE ?5
                            OR LOWER(COALESCE(email, '')) LIKE ?5
                            OR COALESCE(phone, '') LIKE ?5)
                     ORDER BY created_at DESC
                     LIMIT ?6"
                ),
                params![
                    tenant_id.to_string(),
                    opt_text(filter.status.as_ref().map(LeadStatus::as_str)),
                    opt_text(filter.tag.as_ref().map(LeadTag::as_str)),
                    opt_text(filter.source.as_deref()),
                    opt_text(search.as_deref()),
                    i64::from(filter.limit),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_leads"))? {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    async fn update_lead_status_with_firings(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: LeadStatus,
        to: LeadStatus,
        updated_at: DateTime<Utc>,
        firings: &[ScheduledFiring],
    ) -> Result<bool, DatabaseError> {
        const CTX: &str = "update_lead_status_with_firings";
        let conn = self.conn().await;
        let tx = begin(&conn, CTX).await?;

        let result = async {
            let updated = tx
                .execute(
                    "UPDATE leads SET status = ?1, updated_at = ?2
                     WHERE tenant_id = ?3 AND id = ?4 AND status = ?5",
                    params![
                        to.as_str(),
                        fmt_ts(updated_at),
                        tenant_id.to_string(),
                        id.to_string(),
                        from.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("{CTX}: {e}")))?;

            if updated == 0 {
                return Ok(false);
            }
            insert_firings_on(&tx, firings).await?;
            Ok::<_, DatabaseError>(true)
        }
        .await;

        match result {
            Ok(true) => {
                commit(tx, CTX).await?;
                debug!(lead_id = %id, %from, %to, "Lead status updated in DB");
                Ok(true)
            }
            Ok(false) => {
                rollback(tx, CTX).await;
                Ok(false)
            }
            Err(e) => {
                rollback(tx, CTX).await;
                Err(e)
            }
        }
    }

    async fn update_lead_details(&self, lead: &Lead) -> Result<bool, DatabaseError> {
        let custom_fields = serde_json::to_string(&lead.custom_fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE leads SET tag = ?1, assigned_to = ?2, notes = ?3, custom_fields = ?4, updated_at = ?5
                 WHERE tenant_id = ?6 AND id = ?7",
                params![
                    opt_text(lead.tag.as_ref().map(LeadTag::as_str)),
                    opt_text(lead.assigned_to.as_deref()),
                    opt_text(lead.notes.as_deref()),
                    custom_fields,
                    fmt_ts(lead.updated_at),
                    lead.tenant_id.to_string(),
                    lead.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_lead_details: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_lead(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "DELETE FROM leads WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_lead: {e}")))?;
        Ok(count > 0)
    }

    async fn lead_summary(&self, tenant_id: Uuid) -> Result<LeadSummary, DatabaseError> {
        let conn = self.conn().await;
        let mut summary = LeadSummary::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM leads WHERE tenant_id = ?1 GROUP BY status",
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lead_summary: {e}")))?;
        while let Some(row) = rows.next().await.map_err(row_err("lead_summary"))? {
            let status: String = row.get(0).map_err(row_err("lead_summary"))?;
            let count: i64 = row.get(1).map_err(row_err("lead_summary"))?;
            summary.total += count;
            summary.by_status.insert(status, count);
        }

        let mut rows = conn
            .query(
                "SELECT source, COUNT(*) FROM leads WHERE tenant_id = ?1 GROUP BY source",
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lead_summary: {e}")))?;
        while let Some(row) = rows.next().await.map_err(row_err("lead_summary"))? {
            let source: String = row.get(0).map_err(row_err("lead_summary"))?;
            let count: i64 = row.get(1).map_err(row_err("lead_summary"))?;
            summary.by_source.insert(source, count);
        }

        Ok(summary)
    }

    // ── Automation rules ────────────────────────────────────────────

    async fn create_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO automations ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                rule.id.to_string(),
                rule.tenant_id.to_string(),
                rule.name.clone(),
                rule.channel.type_tag(),
                rule.trigger.type_tag(),
                rule.template.clone(),
                i64::from(rule.delay_minutes),
                rule.is_active as i64,
                fmt_ts(rule.created_at),
                fmt_ts(rule.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_rule: {e}")))?;

        debug!(rule_id = %rule.id, trigger = %rule.trigger, "Automation rule inserted into DB");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM automations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;

        match rows.next().await.map_err(row_err("get_rule"))? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AutomationRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automations WHERE tenant_id = ?1 ORDER BY created_at DESC"
                ),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_rules"))? {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn list_active_rules(
        &self,
        tenant_id: Uuid,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automations
                     WHERE tenant_id = ?1 AND trigger_type = ?2 AND is_active = 1
                     ORDER BY created_at ASC"
                ),
                params![tenant_id.to_string(), trigger.type_tag()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_active_rules"))? {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE automations SET name = ?1, channel = ?2, trigger_type = ?3, template = ?4,
                    delay_minutes = ?5, is_active = ?6, updated_at = ?7
                 WHERE tenant_id = ?8 AND id = ?9",
                params![
                    rule.name.clone(),
                    rule.channel.type_tag(),
                    rule.trigger.type_tag(),
                    rule.template.clone(),
                    i64::from(rule.delay_minutes),
                    rule.is_active as i64,
                    fmt_ts(rule.updated_at),
                    rule.tenant_id.to_string(),
                    rule.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_rule: {e}")))?;
        Ok(count > 0)
    }

    async fn set_rule_active(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        is_active: bool,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE automations SET is_active = ?1, updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
                params![
                    is_active as i64,
                    fmt_ts(Utc::now()),
                    tenant_id.to_string(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rule_active: {e}")))?;

        debug!(rule_id = %id, is_active, "Automation rule active flag updated");
        Ok(count > 0)
    }

    async fn delete_rule(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "DELETE FROM automations WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(count > 0)
    }

    // ── Scheduled firings ───────────────────────────────────────────

    async fn insert_firings(&self, firings: &[ScheduledFiring]) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        insert_firings_on(&conn, firings).await
    }

    async fn get_firing(&self, id: Uuid) -> Result<Option<ScheduledFiring>, DatabaseError> {
        let conn = self.conn().await;
        query_firing(&conn, &id.to_string()).await
    }

    async fn list_firings(
        &self,
        tenant_id: Uuid,
        status: Option<FiringStatus>,
        limit: u32,
    ) -> Result<Vec<ScheduledFiring>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {FIRING_COLUMNS} FROM scheduled_firings
                     WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
                     ORDER BY fire_at DESC
                     LIMIT ?3"
                ),
                params![
                    tenant_id.to_string(),
                    opt_text(status.map(|s| s.to_string()).as_deref()),
                    i64::from(limit),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_firings: {e}")))?;

        let mut firings = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_firings"))? {
            firings.push(row_to_firing(&row)?);
        }
        Ok(firings)
    }

    async fn count_due_firings(&self, now: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let conn = self.conn().await;
        let now = fmt_ts(now);
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM scheduled_firings
                 WHERE status = 'pending' AND fire_at <= ?1
                   AND (leased_until IS NULL OR leased_until <= ?1)",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_due_firings: {e}")))?;

        match rows.next().await.map_err(row_err("count_due_firings"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(row_err("count_due_firings"))?),
            None => Ok(0),
        }
    }

    async fn claim_due_firings(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledFiring>, DatabaseError> {
        const CTX: &str = "claim_due_firings";
        let now = fmt_ts(now);
        let lease_until = fmt_ts(lease_until);

        let conn = self.conn().await;
        let tx = begin(&conn, CTX).await?;

        let result = async {
            let mut candidates = Vec::new();
            {
                let mut rows = tx
                    .query(
                        "SELECT id FROM scheduled_firings
                         WHERE status = 'pending' AND fire_at <= ?1
                           AND (leased_until IS NULL OR leased_until <= ?1)
                         ORDER BY fire_at ASC
                         LIMIT ?2",
                        params![now.clone(), limit as i64],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("{CTX}: {e}")))?;
                while let Some(row) = rows.next().await.map_err(row_err(CTX))? {
                    candidates.push(row.get::<String>(0).map_err(row_err(CTX))?);
                }
            }

            let mut claimed = Vec::new();
            for id in candidates {
                let taken = tx
                    .execute(
                        "UPDATE scheduled_firings SET leased_by = ?1, leased_until = ?2, updated_at = ?3
                         WHERE id = ?4 AND status = 'pending'
                           AND (leased_until IS NULL OR leased_until <= ?3)",
                        params![worker_id, lease_until.clone(), now.clone(), id.clone()],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("{CTX}: {e}")))?;
                if taken == 1 {
                    if let Some(firing) = query_firing(&tx, &id).await? {
                        claimed.push(firing);
                    }
                }
            }
            Ok::<_, DatabaseError>(claimed)
        }
        .await;

        match result {
            Ok(claimed) => {
                commit(tx, CTX).await?;
                if !claimed.is_empty() {
                    debug!(worker_id, count = claimed.len(), "Firings claimed");
                }
                Ok(claimed)
            }
            Err(e) => {
                rollback(tx, CTX).await;
                Err(e)
            }
        }
    }

    async fn mark_firing_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE scheduled_firings
                 SET status = 'sent', sent_at = ?1, last_error = NULL,
                     leased_by = NULL, leased_until = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending' AND leased_by = ?3",
                params![fmt_ts(sent_at), id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_firing_sent: {e}")))?;
        Ok(count > 0)
    }

    async fn mark_firing_cancelled(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE scheduled_firings
                 SET status = 'cancelled', last_error = ?1,
                     leased_by = NULL, leased_until = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending' AND leased_by = ?4",
                params![reason, fmt_ts(now), id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_firing_cancelled: {e}")))?;
        Ok(count > 0)
    }

    async fn mark_firing_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE scheduled_firings
                 SET status = 'failed', attempt_count = ?1, last_error = ?2,
                     leased_by = NULL, leased_until = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending' AND leased_by = ?5",
                params![
                    i64::from(attempt_count),
                    error,
                    fmt_ts(now),
                    id.to_string(),
                    worker_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_firing_failed: {e}")))?;
        Ok(count > 0)
    }

    async fn reschedule_firing(
        &self,
        id: Uuid,
        worker_id: &str,
        attempt_count: u32,
        next_fire_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE scheduled_firings
                 SET attempt_count = ?1, fire_at = ?2, last_error = ?3,
                     leased_by = NULL, leased_until = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = 'pending' AND leased_by = ?6",
                params![
                    i64::from(attempt_count),
                    fmt_ts(next_fire_at),
                    error,
                    fmt_ts(now),
                    id.to_string(),
                    worker_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_firing: {e}")))?;
        Ok(count > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::automation::firing::LeadSnapshot;
    use crate::automation::rule::RuleDraft;
    use crate::tenants::TenantProfile;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn seed_tenant(db: &LibSqlBackend) -> Tenant {
        let tenant = Tenant::new(
            TenantProfile {
                business_name: Some("Acme Roofing".into()),
                phone: Some("555-0000".into()),
                ..Default::default()
            },
            t0(),
        );
        db.create_tenant(&tenant).await.unwrap();
        tenant
    }

    fn make_lead(tenant_id: Uuid, dedup_key: &str) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            tenant_id,
            dedup_key: dedup_key.into(),
            name: "Jane Doe".into(),
            email: Some("jane@x.com".into()),
            phone: Some("555-1111".into()),
            message: Some("need quote".into()),
            source: "website_build".into(),
            status: LeadStatus::New,
            tag: None,
            assigned_to: None,
            notes: None,
            custom_fields: CustomFields::new(),
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn make_rule(tenant_id: Uuid, delay_minutes: i64) -> AutomationRule {
        RuleDraft {
            name: "Initial Reply".into(),
            channel: Channel::Email,
            trigger: TriggerKind::LeadReceived,
            template: "Hi {{name}}!".into(),
            delay_minutes,
            is_active: true,
        }
        .into_rule(tenant_id, t0())
        .unwrap()
    }

    fn make_firing(rule: &AutomationRule, lead: &Lead, at: DateTime<Utc>) -> ScheduledFiring {
        ScheduledFiring::plan(
            rule,
            lead.id,
            TriggerSnapshot {
                trigger: rule.trigger,
                occurred_at: at,
                lead: LeadSnapshot::from(lead),
            },
        )
    }

    // ── Tenant tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn tenant_lookup_by_token() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;

        let found = db
            .get_tenant_by_token(&tenant.webhook_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, tenant.id);
        assert_eq!(found.phone.as_deref(), Some("555-0000"));
        assert!(db.get_tenant_by_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_disable() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        assert!(db.set_tenant_enabled(tenant.id, false).await.unwrap());
        assert!(!db.get_tenant(tenant.id).await.unwrap().unwrap().enabled);
        assert!(!db.set_tenant_enabled(Uuid::new_v4(), false).await.unwrap());
    }

    // ── Lead tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_lead() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let mut lead = make_lead(tenant.id, "k1");
        lead.custom_fields
            .insert("service".into(), serde_json::json!("roofing"));

        assert!(db.insert_lead_with_firings(&lead, &[]).await.unwrap());
        let fetched = db.get_lead(tenant.id, lead.id).await.unwrap().unwrap();
        assert_eq!(fetched, lead);
    }

    #[tokio::test]
    async fn duplicate_dedup_key_is_noop() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let rule = make_rule(tenant.id, 0);
        db.create_rule(&rule).await.unwrap();

        let first = make_lead(tenant.id, "same");
        let second = make_lead(tenant.id, "same");
        let firing = make_firing(&rule, &second, t0());

        assert!(db.insert_lead_with_firings(&first, &[]).await.unwrap());
        assert!(!db.insert_lead_with_firings(&second, &[firing.clone()]).await.unwrap());

        let leads = db.list_leads(tenant.id, &LeadFilter::default()).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, first.id);
        // The losing insert's firing was rolled back with it.
        assert!(db.get_firing(firing.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_dedup_key_different_tenants() {
        let db = test_db().await;
        let a = seed_tenant(&db).await;
        let b = seed_tenant(&db).await;
        assert!(db.insert_lead_with_firings(&make_lead(a.id, "k"), &[]).await.unwrap());
        assert!(db.insert_lead_with_firings(&make_lead(b.id, "k"), &[]).await.unwrap());
    }

    #[tokio::test]
    async fn get_lead_is_tenant_scoped() {
        let db = test_db().await;
        let a = seed_tenant(&db).await;
        let lead = make_lead(a.id, "k");
        db.insert_lead_with_firings(&lead, &[]).await.unwrap();
        assert!(db.get_lead(Uuid::new_v4(), lead.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_leads_filters() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;

        let mut hot = make_lead(tenant.id, "a");
        hot.tag = Some(LeadTag::Hot);
        hot.name = "Bob Builder".into();
        hot.email = None;
        let mut referral = make_lead(tenant.id, "b");
        referral.source = "referral".into();
        referral.created_at = t0() + Duration::minutes(1);
        for lead in [&hot, &referral] {
            db.insert_lead_with_firings(lead, &[]).await.unwrap();
        }

        let all = db.list_leads(tenant.id, &LeadFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, referral.id, "newest first");

        let by_tag = LeadFilter {
            tag: Some(LeadTag::Hot),
            ..Default::default()
        };
        assert_eq!(db.list_leads(tenant.id, &by_tag).await.unwrap().len(), 1);

        let by_source = LeadFilter {
            source: Some("referral".into()),
            ..Default::default()
        };
        assert_eq!(db.list_leads(tenant.id, &by_source).await.unwrap()[0].id, referral.id);

        let by_search = LeadFilter {
            search: Some("bob".into()),
            ..Default::default()
        };
        assert_eq!(db.list_leads(tenant.id, &by_search).await.unwrap()[0].id, hot.id);
    }

    #[tokio::test]
    async fn status_update_is_compare_and_set() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        db.insert_lead_with_firings(&lead, &[]).await.unwrap();

        let later = t0() + Duration::minutes(5);
        assert!(db
            .update_lead_status_with_firings(tenant.id, lead.id, LeadStatus::New, LeadStatus::Contacted, later, &[])
            .await
            .unwrap());
        // Stale expectation loses.
        assert!(!db
            .update_lead_status_with_firings(tenant.id, lead.id, LeadStatus::New, LeadStatus::Won, later, &[])
            .await
            .unwrap());

        let fetched = db.get_lead(tenant.id, lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LeadStatus::Contacted);
        assert_eq!(fetched.created_at, t0());
        assert_eq!(fetched.updated_at, later);
    }

    #[tokio::test]
    async fn summary_counts() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let mut won = make_lead(tenant.id, "a");
        won.status = LeadStatus::Won;
        db.insert_lead_with_firings(&won, &[]).await.unwrap();
        db.insert_lead_with_firings(&make_lead(tenant.id, "b"), &[]).await.unwrap();

        let summary = db.lead_summary(tenant.id).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_status["Won"], 1);
        assert_eq!(summary.by_status["New"], 1);
        assert_eq!(summary.by_source["website_build"], 2);
    }

    #[tokio::test]
    async fn delete_lead() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        db.insert_lead_with_firings(&lead, &[]).await.unwrap();
        assert!(db.delete_lead(tenant.id, lead.id).await.unwrap());
        assert!(!db.delete_lead(tenant.id, lead.id).await.unwrap());
        assert!(db.get_lead(tenant.id, lead.id).await.unwrap().is_none());
    }

    // ── Rule tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn active_rules_by_trigger() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let active = make_rule(tenant.id, 0);
        let mut inactive = make_rule(tenant.id, 0);
        inactive.is_active = false;
        let mut status_rule = make_rule(tenant.id, 10);
        status_rule.trigger = TriggerKind::StatusChanged;
        for rule in [&active, &inactive, &status_rule] {
            db.create_rule(rule).await.unwrap();
        }

        let matched = db
            .list_active_rules(tenant.id, TriggerKind::LeadReceived)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, active.id);
        assert_eq!(db.list_rules(tenant.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rule_update_and_toggle() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let mut rule = make_rule(tenant.id, 0);
        db.create_rule(&rule).await.unwrap();

        rule.channel = Channel::Sms;
        rule.delay_minutes = 1440;
        assert!(db.update_rule(&rule).await.unwrap());
        assert!(db.set_rule_active(tenant.id, rule.id, false).await.unwrap());

        let fetched = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(fetched.channel, Channel::Sms);
        assert_eq!(fetched.delay_minutes, 1440);
        assert!(!fetched.is_active);

        assert!(!db.set_rule_active(Uuid::new_v4(), rule.id, true).await.unwrap());
        assert!(db.delete_rule(tenant.id, rule.id).await.unwrap());
        assert!(db.get_rule(rule.id).await.unwrap().is_none());
    }

    // ── Firing tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_idempotency_key_skipped() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let rule = make_rule(tenant.id, 0);
        let lead = make_lead(tenant.id, "k");

        let a = make_firing(&rule, &lead, t0());
        let b = make_firing(&rule, &lead, t0());
        assert_eq!(db.insert_firings(&[a.clone()]).await.unwrap(), 1);
        assert_eq!(db.insert_firings(&[b]).await.unwrap(), 0);

        let stored = db.get_firing(a.id).await.unwrap().unwrap();
        assert_eq!(stored, a);
    }

    #[tokio::test]
    async fn claim_respects_fire_at_and_lease() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        let due = make_firing(&make_rule(tenant.id, 0), &lead, t0());
        let later = make_firing(&make_rule(tenant.id, 30), &lead, t0());
        db.insert_firings(&[due.clone(), later.clone()]).await.unwrap();

        let lease = t0() + Duration::seconds(60);
        let claimed = db.claim_due_firings("w1", t0(), lease, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].leased_by.as_deref(), Some("w1"));
        assert_eq!(claimed[0].leased_until, Some(lease));

        // Held lease blocks a second worker.
        let second = db
            .claim_due_firings("w2", t0() + Duration::seconds(30), lease, 10)
            .await
            .unwrap();
        assert!(second.is_empty());

        // Expired lease is reclaimable.
        let after = t0() + Duration::seconds(61);
        let reclaimed = db
            .claim_due_firings("w2", after, after + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].leased_by.as_deref(), Some("w2"));
        assert_eq!(db.count_due_firings(after).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_honours_batch_limit() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        let firings: Vec<_> = (0..5)
            .map(|_| make_firing(&make_rule(tenant.id, 0), &lead, t0()))
            .collect();
        db.insert_firings(&firings).await.unwrap();

        let claimed = db
            .claim_due_firings("w1", t0(), t0() + Duration::seconds(60), 2)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(db.count_due_firings(t0()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn transitions_require_lease_holder() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        let firing = make_firing(&make_rule(tenant.id, 0), &lead, t0());
        db.insert_firings(&[firing.clone()]).await.unwrap();
        db.claim_due_firings("w1", t0(), t0() + Duration::seconds(60), 10)
            .await
            .unwrap();

        assert!(!db.mark_firing_sent(firing.id, "w2", t0()).await.unwrap());
        assert!(db.mark_firing_sent(firing.id, "w1", t0()).await.unwrap());
        // Terminal: no further transitions.
        assert!(!db
            .mark_firing_cancelled(firing.id, "w1", "late", t0())
            .await
            .unwrap());

        let stored = db.get_firing(firing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FiringStatus::Sent);
        assert_eq!(stored.sent_at, Some(t0()));
        assert!(stored.leased_by.is_none());
    }

    #[tokio::test]
    async fn reschedule_releases_lease() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        let firing = make_firing(&make_rule(tenant.id, 0), &lead, t0());
        db.insert_firings(&[firing.clone()]).await.unwrap();
        db.claim_due_firings("w1", t0(), t0() + Duration::seconds(60), 10)
            .await
            .unwrap();

        let next = t0() + Duration::seconds(30);
        assert!(db
            .reschedule_firing(firing.id, "w1", 1, next, "smtp timeout", t0())
            .await
            .unwrap());

        let stored = db.get_firing(firing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FiringStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.fire_at, next);
        assert_eq!(stored.last_error.as_deref(), Some("smtp timeout"));
        assert!(stored.leased_by.is_none());

        assert!(db.claim_due_firings("w2", t0(), next, 10).await.unwrap().is_empty());
        assert_eq!(db.claim_due_firings("w2", next, next + Duration::seconds(60), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_failed_firings() {
        let db = test_db().await;
        let tenant = seed_tenant(&db).await;
        let lead = make_lead(tenant.id, "k");
        let firing = make_firing(&make_rule(tenant.id, 0), &lead, t0());
        db.insert_firings(&[firing.clone()]).await.unwrap();
        db.claim_due_firings("w1", t0(), t0() + Duration::seconds(60), 10)
            .await
            .unwrap();
        db.mark_firing_failed(firing.id, "w1", 5, "bounced", t0())
            .await
            .unwrap();

        let failed = db
            .list_firings(tenant.id, Some(FiringStatus::Failed), 50)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt_count, 5);
        assert_eq!(failed[0].last_error.as_deref(), Some("bounced"));
        assert!(db
            .list_firings(tenant.id, Some(FiringStatus::Pending), 50)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("leads.db");
        let tenant_id;
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            tenant_id = seed_tenant(&db).await.id;
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_tenant(tenant_id).await.unwrap().is_some());
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let a = fmt_ts(t0());
        let b = fmt_ts(t0() + Duration::milliseconds(500));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b), t0() + Duration::milliseconds(500));
    }
}
