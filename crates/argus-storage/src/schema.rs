//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        if current_version < 2 {
            migrate_v2(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: rules, settings and the traffic log.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1");

    conn.execute_batch(
        r#"
        -- Block rules, unique per kind
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('domain', 'keyword')),
            value TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (kind, value)
        );

        -- Key/value settings, values stored as JSON
        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per completed transaction
        CREATE TABLE IF NOT EXISTS traffic_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            client_ip TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            host TEXT NOT NULL,
            status_code INTEGER,
            content_type TEXT,
            is_blocked INTEGER NOT NULL DEFAULT 0,
            block_reason TEXT,
            error TEXT,
            request_headers TEXT NOT NULL DEFAULT '{}',
            request_body TEXT,
            response_headers TEXT,
            response_body TEXT,
            response_size INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_traffic_log_timestamp ON traffic_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_traffic_log_host ON traffic_log(host);
        "#,
    )?;

    Ok(())
}

/// Migration to version 2: hourly aggregation table.
fn migrate_v2(conn: &Connection) -> Result<()> {
    info!("Applying migration v2");

    conn.execute_batch(
        r#"
        -- Counters keyed by UTC date and hour
        CREATE TABLE IF NOT EXISTS hourly_stats (
            date TEXT NOT NULL,
            hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
            total_requests INTEGER NOT NULL DEFAULT 0,
            blocked_requests INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (date, hour)
        );
        "#,
    )?;

    Ok(())
}
