//! Durable local SQLite store.
//!
//! Uses rusqlite with WAL mode and foreign keys enabled. Owns the schema for
//! every business entity plus the `sync_queue` outbox, applies migrations, and
//! provides the JSON-valued execute/query primitives the serializer wraps.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Number, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// A result row keyed by column name.
pub type Row = Map<String, Value>;

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Open (or create) the database file, configure it and run migrations.
///
/// A file SQLite reports as corrupt or not a database is moved aside to a
/// quarantine path and a fresh store is created once. Every other failure is
/// returned and the file is left alone.
pub fn init(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    info!("Opening local store at {}", db_path.display());

    let conn = match open_and_migrate(db_path, busy_timeout) {
        Ok(c) => c,
        Err(first_err) if is_corrupt(&first_err) => {
            let moved_to = quarantine(db_path)?;
            warn!(
                "Local store is corrupt ({}), moved to {} and starting fresh",
                first_err,
                moved_to.display()
            );
            open_and_migrate(db_path, busy_timeout)?
        }
        Err(e) => {
            error!("Local store open failed: {e}");
            return Err(e);
        }
    };

    info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");
    Ok(conn)
}

fn open_and_migrate(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = open_and_configure(db_path, busy_timeout)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn is_corrupt(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Store(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the database file and its WAL/SHM companions to
/// `<name>.corrupt-<timestamp>`. Returns the new path of the main file.
fn quarantine(db_path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let moved_to = with_suffix(db_path, &suffix);
    fs::rename(db_path, &moved_to)?;
    for companion in ["-wal", "-shm"] {
        let path = with_suffix(db_path, companion);
        if path.exists() {
            fs::rename(&path, with_suffix(&moved_to, companion))?;
        }
    }
    Ok(moved_to)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    if !suffix.starts_with('-') {
        name.push(".");
    }
    name.push(suffix);
    PathBuf::from(name)
}

/// Open the database file and apply pragmas.
pub fn open_and_configure(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

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

/// Migration v1: entity tables, outbox and settings.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY(setting_category, setting_key)
        );

        -- shared reference data
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS suppliers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            address TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT,
            barcode TEXT,
            category_id TEXT,
            supplier_id TEXT,
            price REAL NOT NULL DEFAULT 0,
            cost_price REAL DEFAULT 0,
            stock INTEGER NOT NULL DEFAULT 0,
            min_stock INTEGER DEFAULT 0,
            unit TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- people
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            address TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            role TEXT NOT NULL DEFAULT 'staff',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- transactional data
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            customer_id TEXT,
            user_id TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            discount REAL DEFAULT 0,
            payment_method TEXT,
            status TEXT NOT NULL DEFAULT 'completed',
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sale_items (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL DEFAULT 0,
            subtotal REAL NOT NULL DEFAULT 0,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS debts (
            id TEXT PRIMARY KEY,
            sale_id TEXT,
            customer_id TEXT,
            amount REAL NOT NULL,
            paid_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'unpaid',
            due_date TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS returns (
            id TEXT PRIMARY KEY,
            sale_id TEXT,
            sale_item_id TEXT,
            product_id TEXT,
            quantity INTEGER NOT NULL,
            refund_amount REAL NOT NULL DEFAULT 0,
            reason TEXT,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE SET NULL,
            FOREIGN KEY(sale_item_id) REFERENCES sale_items(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS purchase_orders (
            id TEXT PRIMARY KEY,
            supplier_id TEXT,
            user_id TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            expected_date TEXT,
            created_at TEXT,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS purchase_items (
            id TEXT PRIMARY KEY,
            purchase_order_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_cost REAL NOT NULL DEFAULT 0,
            subtotal REAL NOT NULL DEFAULT 0,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(purchase_order_id) REFERENCES purchase_orders(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            title TEXT NOT NULL,
            message TEXT,
            type TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS inventory_audits (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            user_id TEXT,
            expected_stock INTEGER NOT NULL DEFAULT 0,
            counted_stock INTEGER NOT NULL DEFAULT 0,
            difference INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS feedback (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            rating INTEGER,
            message TEXT NOT NULL,
            created_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- sync_queue (outbox for irregular mutations)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
            record_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: outbox retry pacing and notification read timestamps.
fn migrate_v2(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "sync_queue", "attempts", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "sync_queue", "last_error", "TEXT")?;
    add_column_if_missing(conn, "sync_queue", "next_retry_at", "TEXT")?;
    add_column_if_missing(conn, "notifications", "read_at", "TEXT")?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    info!("Applied migration v2 (outbox retry pacing)");
    Ok(())
}

/// Migration v3: indexes on the synced markers and foreign keys.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_sales_synced ON sales(synced);
        CREATE INDEX IF NOT EXISTS idx_sale_items_sale_id ON sale_items(sale_id);
        CREATE INDEX IF NOT EXISTS idx_sale_items_synced ON sale_items(synced);
        CREATE INDEX IF NOT EXISTS idx_debts_synced ON debts(synced);
        CREATE INDEX IF NOT EXISTS idx_returns_synced ON returns(synced);
        CREATE INDEX IF NOT EXISTS idx_purchase_items_order_id ON purchase_items(purchase_order_id);
        CREATE INDEX IF NOT EXISTS idx_purchase_items_synced ON purchase_items(synced);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_pending ON sync_queue(synced, created_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (sync indexes)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Additive column migration. A concurrent "duplicate column" failure counts
/// as success.
fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    match conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};")) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().to_lowercase().contains("duplicate column") => {
            warn!(table, column, "column already present, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
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

// ---------------------------------------------------------------------------
// JSON <-> SQLite value mapping
// ---------------------------------------------------------------------------

/// Convert a JSON argument into a SQLite value. Booleans become 0/1, nested
/// arrays and objects are stored as JSON text.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64_STANDARD.encode(b)),
    }
}

/// Execute a statement, returning the number of changed rows.
pub fn execute(conn: &Connection, sql: &str, args: &[Value]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    let changed = stmt.execute(params_from_iter(args.iter().map(to_sql)))?;
    Ok(changed)
}

/// Run a query and collect every row as a JSON map.
pub fn query_all(conn: &Connection, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(args.iter().map(to_sql)))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            map.insert(name.clone(), from_sql(row.get_ref(idx)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// Run a query and return its first row, if any.
pub fn query_one(conn: &Connection, sql: &str, args: &[Value]) -> Result<Option<Row>> {
    Ok(query_all(conn, sql, args)?.into_iter().next())
}

// ===========================================================================
// Tests
// ===========================================================================
