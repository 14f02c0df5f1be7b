//! Local SQLite database layer for Recordbook.
//!
//! Uses rusqlite with WAL mode. Provides the mirror tables, the sync queue
//! table, versioned schema migrations and the `local_settings` helpers.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::entities::EntityKind;
use crate::error::StoreError;

/// Shared handle to the local database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "recordbook.db";

/// Initialize the database at `{data_dir}/recordbook.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once. The mirror is a cache of server
/// state plus the queue, so a wiped file only loses unsynced changes.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Open(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path).and_then(|c| run_migrations(&c).map(|_| c)) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), deleting and retrying once");
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            let conn = open_and_configure(&db_path)
                .map_err(|e| StoreError::Open(format!("after retry: {e}")))?;
            run_migrations(&conn)?;
            conn
        }
    };

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a migrated in-memory database.
pub fn open_in_memory() -> Result<DbState, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: settings store and one mirror table per entity kind.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    let mut sql = String::from(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );
        ",
    );
    for kind in EntityKind::ALL {
        let table = kind.table();
        sql.push_str(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                _id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                sort_key TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_sort_key ON {table}(sort_key);
            CREATE INDEX IF NOT EXISTS idx_{table}_sync_status ON {table}(sync_status);
            "
        ));
    }
    sql.push_str(
        "
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;
        ",
    );

    conn.execute_batch(&sql).map_err(|e| {
        error!("Migration v1 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        StoreError::from(e)
    })?;

    info!("Applied migration v1 (settings + mirror tables)");
    Ok(())
}

/// Migration v2: durable sync queue.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('create', 'update', 'delete')),
            payload TEXT NOT NULL DEFAULT '{}',
            temp_id TEXT,
            idempotency_key TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            attempts INTEGER DEFAULT 0,
            next_attempt_at TEXT,
            last_error TEXT,
            failed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity, entity_id);

        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        StoreError::from(e)
    })?;

    info!("Applied migration v2 (sync queue)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(names.iter().any(|name| name == column))
}

/// Migration v3: backfill step.
///
/// - `sync_queue.updated_at` for last-touched tracking
/// - `attempts` NULLs from early builds become 0
/// - mirror `sort_key` backfilled from the document's sort field
/// - `(failed, next_attempt_at)` index for the drain query
fn migrate_v3(conn: &Connection) -> Result<(), StoreError> {
    if !column_exists(conn, "sync_queue", "updated_at")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN updated_at TEXT;")?;
    }

    let mut sql = String::from(
        "
        BEGIN;
        UPDATE sync_queue SET updated_at = created_at WHERE updated_at IS NULL;
        UPDATE sync_queue SET attempts = 0 WHERE attempts IS NULL;
        CREATE INDEX IF NOT EXISTS idx_sync_queue_failed_next
            ON sync_queue(failed, next_attempt_at);
        ",
    );
    for kind in EntityKind::ALL {
        sql.push_str(&format!(
            "UPDATE {table} SET sort_key = json_extract(data, '$.{field}')
             WHERE sort_key IS NULL AND json_valid(data);
             UPDATE {table} SET sync_status = 'pending'
             WHERE sync_status IS NULL OR sync_status NOT IN ('pending', 'synced');
            ",
            table = kind.table(),
            field = kind.sort_field(),
        ));
    }
    sql.push_str(
        "
        INSERT INTO schema_version (version) VALUES (3);
        COMMIT;
        ",
    );

    conn.execute_batch(&sql).map_err(|e| {
        error!("Migration v3 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        StoreError::from(e)
    })?;

    info!("Applied migration v3 (queue/mirror backfill)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

pub fn get_settings_in_category(
    conn: &Connection,
    category: &str,
) -> Result<Vec<(String, String)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT setting_key, setting_value FROM local_settings
         WHERE setting_category = ?1 ORDER BY setting_key",
    )?;
    let rows = stmt
        .query_map(params![category], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ===========================================================================
// Tests
// ===========================================================================
