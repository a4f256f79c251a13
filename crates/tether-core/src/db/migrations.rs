//! Database migrations

use crate::error::Result;
use crate::models::BOOKMARKS_ROOT_ID;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|flag| flag != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Bookmark tree, stored as a flat id-keyed table; the structure
        -- lives in parent_id/position so re-parenting is a column rewrite
        CREATE TABLE IF NOT EXISTS bookmarks (
            id TEXT PRIMARY KEY,
            title TEXT,
            url TEXT,
            is_folder INTEGER NOT NULL DEFAULT 0,
            parent_id TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            modified_at INTEGER,
            pending_deletion INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_bookmarks_parent
            ON bookmarks(parent_id, position);
        CREATE INDEX IF NOT EXISTS idx_bookmarks_modified
            ON bookmarks(modified_at);
        CREATE INDEX IF NOT EXISTS idx_bookmarks_pending
            ON bookmarks(pending_deletion);

        -- Ordered favorites membership, one list per form factor
        CREATE TABLE IF NOT EXISTS favorites (
            form_factor TEXT NOT NULL,
            bookmark_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (form_factor, bookmark_id)
        );
        CREATE INDEX IF NOT EXISTS idx_favorites_order
            ON favorites(form_factor, position);

        CREATE TABLE IF NOT EXISTS favorites_state (
            form_factor TEXT PRIMARY KEY,
            modified_at INTEGER
        );

        -- Flat synced settings
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        -- Per-key sync bookkeeping; rows are cleared, never deleted
        CREATE TABLE IF NOT EXISTS settings_metadata (
            key TEXT PRIMARY KEY,
            last_modified INTEGER
        );

        -- Per-feature server cursor, persisted outside reconciliation
        CREATE TABLE IF NOT EXISTS sync_state (
            feature TEXT PRIMARY KEY,
            last_sync_timestamp TEXT
        );

        INSERT OR IGNORE INTO bookmarks (id, title, is_folder, parent_id, position)
            VALUES ('{BOOKMARKS_ROOT_ID}', 'Bookmarks', 1, NULL, 0);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;"
    ))?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
