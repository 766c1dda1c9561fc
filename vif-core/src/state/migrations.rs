//! Database migrations.

use crate::error::{Result, VifError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| VifError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| VifError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    Ok(())
}

async fn execute(pool: &SqlitePool, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| VifError::MigrationFailed { reason: e.to_string() })?;
    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    execute(pool, "DELETE FROM schema_version").await?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| VifError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version {} complete", version);
    Ok(())
}

/// Service instances and their virtual interfaces.
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS service_instances (
            id TEXT PRIMARY KEY,
            router_id TEXT NOT NULL,
            feature_id TEXT NOT NULL,
            instance_name TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            vlan_id INTEGER,
            bind_ip TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS virtual_interfaces (
            id TEXT PRIMARY KEY,
            instance_id TEXT UNIQUE NOT NULL,
            interface_name TEXT UNIQUE NOT NULL,
            vlan_id INTEGER NOT NULL,
            ip_address TEXT NOT NULL,
            gateway_type TEXT NOT NULL DEFAULT 'none',
            gateway_status TEXT NOT NULL DEFAULT 'stopped',
            routing_mark TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_instances_router ON service_instances(router_id)",
    )
    .await?;

    set_version(pool, 1).await
}

/// Device routings with kill-switch columns.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS device_routings (
            id TEXT PRIMARY KEY,
            router_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            mac_address TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            interface_id TEXT NOT NULL,
            routing_mark TEXT NOT NULL,
            mangle_rule_id TEXT,
            kill_switch_enabled INTEGER NOT NULL DEFAULT 0,
            kill_switch_mode TEXT NOT NULL DEFAULT 'block_all',
            kill_switch_rule_id TEXT,
            kill_switch_active INTEGER NOT NULL DEFAULT 0,
            kill_switch_activated_at INTEGER,
            kill_switch_fallback_interface_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_routings_instance ON device_routings(instance_id)",
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_routings_interface ON device_routings(interface_id)",
    )
    .await?;

    execute(pool, "CREATE INDEX IF NOT EXISTS idx_routings_router ON device_routings(router_id)")
        .await?;

    set_version(pool, 2).await
}

/// Per-router VLAN allocation ledger.
#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS vlan_allocations (
            router_id TEXT NOT NULL,
            vlan_id INTEGER NOT NULL,
            instance_id TEXT NOT NULL,
            service_type TEXT NOT NULL,
            subnet TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'allocated',
            allocated_at INTEGER NOT NULL,
            released_at INTEGER,
            PRIMARY KEY (router_id, vlan_id)
        )
        "#,
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_vlan_allocations_status ON vlan_allocations(router_id, status)",
    )
    .await?;

    set_version(pool, 3).await
}
