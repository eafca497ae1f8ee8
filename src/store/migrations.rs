//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `init_schema()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tenants_and_leads",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                business_name TEXT,
                email TEXT,
                phone TEXT,
                webhook_token TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                message TEXT,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'New',
                tag TEXT,
                assigned_to TEXT,
                notes TEXT,
                custom_fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, dedup_key)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_tenant_created ON leads(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_leads_tenant_status ON leads(tenant_id, status);
        "#,
    },
    Migration {
        version: 2,
        name: "automations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                template TEXT NOT NULL,
                delay_minutes INTEGER NOT NULL DEFAULT 0 CHECK (delay_minutes >= 0),
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automations_tenant_trigger
                ON automations(tenant_id, trigger_type, is_active);

            CREATE TABLE IF NOT EXISTS scheduled_firings (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                automation_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                trigger_snapshot TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT NOT NULL UNIQUE,
                leased_by TEXT,
                leased_until TEXT,
                last_error TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_firings_due ON scheduled_firings(status, fire_at);
            CREATE INDEX IF NOT EXISTS idx_firings_tenant_status
                ON scheduled_firings(tenant_id, status);
        "#,
    },
];

/// Run all pending migrations against `conn`.
///
/// Each version's DDL and its `_migrations` record commit together, so a
/// failed step leaves the schema at the previous version.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > current);

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!(
            "V{} ({}): {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(fail)?;
    let result = async {
        tx.execute_batch(migration.sql).await?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await?;
        Ok::<_, libsql::Error>(())
    }
    .await;

    match result {
        Ok(()) => tx.commit().await.map_err(fail),
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, "Migration rollback failed");
            }
            Err(fail(e))
        }
    }
}

/// Highest applied version, or 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parse schema version: {e}"))),
        None => Ok(0),
    }
}
