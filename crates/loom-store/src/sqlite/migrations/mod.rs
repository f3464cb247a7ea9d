//! Embedded schema migrations.
//!
//! Each step is applied in its own transaction together with its
//! `schema_version` row, so the recorded version never runs ahead of the
//! schema. Steps at or below the recorded version are skipped.

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::errors::{Result, StoreError};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Conversations, event logs, log backups, blobs",
        sql: include_str!("v001_schema.sql"),
    },
    Migration {
        version: 2,
        description: "Collaborators and invites",
        sql: include_str!("v002_collaboration.sql"),
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT    NOT NULL,
    description TEXT
)";

/// Bring the schema up to [`latest_version`]. Returns how many steps ran.
///
/// # Errors
///
/// [`StoreError::Migration`] naming the step that failed.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(VERSION_TABLE)
        .map_err(|e| failed("create schema_version", &e))?;
    let from = current_version(conn)?;

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        debug!(version = from, "schema up to date");
        return Ok(0);
    }
    for migration in &pending {
        info!(version = migration.version, description = migration.description, "applying migration");
        apply(conn, migration)?;
    }
    let applied = u32::try_from(pending.len()).unwrap_or(u32::MAX);
    info!(from, to = latest_version(), applied, "schema migrated");
    Ok(applied)
}

/// Highest recorded version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| failed("read schema_version", &e))
}

/// Version of the last embedded migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn failed(step: &str, e: &rusqlite::Error) -> StoreError {
    StoreError::Migration {
        message: format!("{step}: {e}"),
    }
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let step = format!("v{:03} ({})", migration.version, migration.description);
    let tx = conn.unchecked_transaction().map_err(|e| failed(&step, &e))?;
    tx.execute_batch(migration.sql).map_err(|e| failed(&step, &e))?;
    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, datetime('now'), ?2)",
            params![migration.version, migration.description],
        )
        .map_err(|e| failed(&step, &e))?;
    tx.commit().map_err(|e| failed(&step, &e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
