//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current client schema version
const CURRENT_VERSION: i32 = 3;

/// Current authority schema version
const AUTHORITY_VERSION: i32 = 1;

/// Run all pending client migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Run all pending authority migrations
pub async fn run_authority(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, &AUTHORITY_V1).await?;
        tracing::info!("Migrated authority database to version {AUTHORITY_VERSION}");
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run a migration's statements inside one transaction.
///
/// libsql doesn't have `execute_batch`, so each statement runs separately.
async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: entity table, outbox and key-value sync state
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // One table for every kind; index columns are extracted from `data`.
        "CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            company_id TEXT,
            project_id TEXT,
            status TEXT,
            created_at INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            remote_version INTEGER,
            PRIMARY KEY (kind, id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_entities_company ON entities(kind, company_id)",
        "CREATE INDEX IF NOT EXISTS idx_entities_project ON entities(kind, project_id)",
        "CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(kind, status)",
        "CREATE INDEX IF NOT EXISTS idx_entities_sync_status ON entities(kind, sync_status)",
        "CREATE TABLE IF NOT EXISTS outbox (
            id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(entity, entity_id)",
        "CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict log, id map and applied data migrations
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_data TEXT,
            server_data TEXT,
            timestamp INTEGER NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution TEXT,
            resolved_at INTEGER
        )",
        // At most one open conflict per record.
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_conflicts_open
            ON sync_conflicts(entity, entity_id) WHERE resolved = 0",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved, resolved_at)",
        "CREATE TABLE IF NOT EXISTS id_map (
            entity TEXT NOT NULL,
            local_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            mapped_at INTEGER NOT NULL,
            PRIMARY KEY (entity, local_id)
        )",
        "CREATE TABLE IF NOT EXISTS data_migrations (
            name TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: server row version on conflicts, tombstones included
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_conflicts ADD COLUMN server_version INTEGER",
        "INSERT INTO schema_version (version) VALUES (3)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

const AUTHORITY_V1: [&str; 9] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        version INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_modified INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        last_client_id TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    )",
    "CREATE TABLE IF NOT EXISTS changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        change_type TEXT NOT NULL,
        data TEXT,
        version INTEGER NOT NULL,
        changed_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_changes_changed_at ON changes(changed_at, seq)",
    "CREATE TABLE IF NOT EXISTS applied_operations (
        operation_id TEXT PRIMARY KEY,
        result TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS id_aliases (
        kind TEXT NOT NULL,
        client_id TEXT NOT NULL,
        server_id TEXT NOT NULL,
        PRIMARY KEY (kind, client_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_live ON records(kind, deleted)",
    "CREATE INDEX IF NOT EXISTS idx_id_aliases_server ON id_aliases(kind, server_id)",
    "INSERT INTO schema_version (version) VALUES (1)",
];
