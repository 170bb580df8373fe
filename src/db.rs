//! Local SQLite store for the offline POS.
//!
//! Uses rusqlite with WAL mode. Six keyed collections (invoices, line items,
//! customers, products, payments, sync queue) each live in their own table:
//! the record is stored as JSON in `data` and the values a collection is
//! indexed by are mirrored into dedicated columns with SQL indices. A
//! `metadata` key-value table holds process-wide state (device id, last sync
//! time).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{PosError, Result};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

const DB_FILE_NAME: &str = "pos-offline.db";

pub const META_DEVICE_ID: &str = "deviceId";
pub const META_LAST_SYNC_TIME: &str = "lastSyncTime";

// ---------------------------------------------------------------------------
// Collections and indices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Invoices,
    LineItems,
    Customers,
    Products,
    Payments,
    SyncQueue,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Invoices,
        Collection::LineItems,
        Collection::Customers,
        Collection::Products,
        Collection::Payments,
        Collection::SyncQueue,
    ];

    /// Logical collection name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoices => "invoices",
            Self::LineItems => "lineItems",
            Self::Customers => "customers",
            Self::Products => "products",
            Self::Payments => "payments",
            Self::SyncQueue => "syncQueue",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Self::Invoices => "invoices",
            Self::LineItems => "line_items",
            Self::Customers => "customers",
            Self::Products => "products",
            Self::Payments => "payments",
            Self::SyncQueue => "sync_queue",
        }
    }

    /// Indices declared on this collection. Must match `migrate_v1`.
    pub fn indexes(&self) -> &'static [IndexName] {
        match self {
            Self::Invoices => &[IndexName::TenantId, IndexName::Status, IndexName::CreatedAt],
            Self::LineItems => &[IndexName::TenantId, IndexName::Barcode, IndexName::InvoiceId],
            Self::Customers => &[IndexName::TenantId],
            Self::Products => &[IndexName::TenantId, IndexName::Barcode],
            Self::Payments => &[
                IndexName::TenantId,
                IndexName::CreatedAt,
                IndexName::InvoiceId,
            ],
            Self::SyncQueue => &[
                IndexName::TenantId,
                IndexName::Status,
                IndexName::CreatedAt,
                IndexName::EntityKey,
            ],
        }
    }

    pub fn has_index(&self, index: IndexName) -> bool {
        self.indexes().contains(&index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    TenantId,
    Status,
    CreatedAt,
    Barcode,
    InvoiceId,
    EntityKey,
}

impl IndexName {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TenantId => "tenantId",
            Self::Status => "status",
            Self::CreatedAt => "createdAt",
            Self::Barcode => "barcode",
            Self::InvoiceId => "invoiceId",
            Self::EntityKey => "entityKey",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::TenantId => "tenant_id",
            Self::Status => "status",
            Self::CreatedAt => "created_at",
            Self::Barcode => "barcode",
            Self::InvoiceId => "invoice_id",
            Self::EntityKey => "entity_key",
        }
    }
}

/// A value that can live in one of the store's collections.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    /// Value for `index`, or `None` when the record has no value for it.
    fn index_value(&self, index: IndexName) -> Option<String>;
}

/// Sortable string form of a timestamp for index columns.
pub fn timestamp_key(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The local store: one SQLite connection guarded by a mutex.
pub struct LocalStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl LocalStore {
    /// Open (or create) the store at `{data_dir}/pos-offline.db`.
    ///
    /// Creates the directory if needed, sets pragmas and runs pending
    /// migrations. On corruption or open failure, deletes the file and
    /// retries once.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening local store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Local store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)?
            }
        };

        run_migrations(&conn)?;
        info!("Local store ready (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` inside one IMMEDIATE transaction spanning any collections.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls everything back so no
    /// partial write is ever observable.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<R>,
    {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = {
            let scoped = StoreTx { conn: &tx };
            f(&scoped)?
        };
        tx.commit()?;
        Ok(out)
    }

    /// Upsert one record by primary key.
    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        let conn = self.conn.lock()?;
        put_row(&conn, record)
    }

    /// Upsert many records in a single transaction: all land or none do.
    pub fn batch_put<T: Record>(&self, records: &[T]) -> Result<()> {
        self.transaction(|tx| tx.batch_put(records))
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let conn = self.conn.lock()?;
        get_row(&conn, id)
    }

    pub fn get_all<T: Record>(&self) -> Result<Vec<T>> {
        let conn = self.conn.lock()?;
        get_all_rows(&conn)
    }

    pub fn query_by_index<T: Record>(&self, index: IndexName, value: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock()?;
        query_rows(&conn, index, value)
    }

    pub fn count_by_index(&self, collection: Collection, index: IndexName, value: &str) -> Result<i64> {
        let conn = self.conn.lock()?;
        count_rows(&conn, collection, index, value)
    }

    /// Delete by id. Returns whether a record was removed.
    pub fn delete<T: Record>(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock()?;
        delete_row(&conn, T::COLLECTION, id)
    }

    /// Wipe every collection (logout). The device id survives because it
    /// identifies the installation, not the session.
    pub fn clear_all(&self) -> Result<()> {
        self.transaction(|tx| {
            for collection in Collection::ALL {
                tx.conn
                    .execute(&format!("DELETE FROM {}", collection.table()), [])?;
            }
            tx.conn.execute(
                "DELETE FROM metadata WHERE key != ?1",
                params![META_DEVICE_ID],
            )?;
            Ok(())
        })?;
        info!("Local store cleared");
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock()?;
        get_meta(&conn, key)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        set_meta(&conn, key, value)
    }

    /// The installation's device id, created on first call.
    pub fn device_id(&self) -> Result<String> {
        self.transaction(|tx| {
            if let Some(existing) = tx.get_metadata(META_DEVICE_ID)? {
                return Ok(existing);
            }
            let id = uuid::Uuid::new_v4().to_string();
            tx.set_metadata(META_DEVICE_ID, &id)?;
            info!(device_id = %id, "Generated device id");
            Ok(id)
        })
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_metadata(META_LAST_SYNC_TIME)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc)))
    }

    pub fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_metadata(META_LAST_SYNC_TIME, &timestamp_key(&at))
    }
}

/// Handle passed to [`LocalStore::transaction`] closures.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        put_row(self.conn, record)
    }

    pub fn batch_put<T: Record>(&self, records: &[T]) -> Result<()> {
        for record in records {
            put_row(self.conn, record)?;
        }
        Ok(())
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        get_row(self.conn, id)
    }

    pub fn get_all<T: Record>(&self) -> Result<Vec<T>> {
        get_all_rows(self.conn)
    }

    pub fn query_by_index<T: Record>(&self, index: IndexName, value: &str) -> Result<Vec<T>> {
        query_rows(self.conn, index, value)
    }

    pub fn delete<T: Record>(&self, id: &str) -> Result<bool> {
        delete_row(self.conn, T::COLLECTION, id)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        get_meta(self.conn, key)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_meta(self.conn, key, value)
    }
}

// ---------------------------------------------------------------------------
// Row helpers (shared by the store and transactions)
// ---------------------------------------------------------------------------

fn put_row<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let collection = T::COLLECTION;
    let indexes = collection.indexes();
    let data = serde_json::to_string(record)?;

    let mut columns = vec!["id", "data"];
    let mut values: Vec<Option<String>> = vec![Some(record.id().to_string()), Some(data)];
    for index in indexes {
        columns.push(index.column());
        values.push(record.index_value(*index));
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})
         ON CONFLICT(id) DO UPDATE SET {}, updated_at = datetime('now')",
        collection.table(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", "),
    );

    conn.execute(&sql, params_from_iter(values.iter()))?;
    debug!(collection = collection.name(), id = record.id(), "put");
    Ok(())
}

fn get_row<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let sql = format!("SELECT data FROM {} WHERE id = ?1", T::COLLECTION.table());
    let data: Option<String> = conn
        .query_row(&sql, params![id], |row| row.get(0))
        .optional()?;
    match data {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn collect_rows<T: Record>(conn: &Connection, sql: &str, value: Option<&str>) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let raw_rows: Vec<String> = match value {
        Some(v) => stmt
            .query_map(params![v], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?,
        None => stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?,
    };
    raw_rows
        .iter()
        .map(|raw| serde_json::from_str(raw).map_err(PosError::from))
        .collect()
}

fn get_all_rows<T: Record>(conn: &Connection) -> Result<Vec<T>> {
    let sql = format!("SELECT data FROM {} ORDER BY rowid", T::COLLECTION.table());
    collect_rows(conn, &sql, None)
}

fn require_index(collection: Collection, index: IndexName) -> Result<()> {
    if collection.has_index(index) {
        Ok(())
    } else {
        Err(PosError::UnknownIndex {
            collection: collection.name(),
            index: index.name(),
        })
    }
}

fn query_rows<T: Record>(conn: &Connection, index: IndexName, value: &str) -> Result<Vec<T>> {
    let collection = T::COLLECTION;
    require_index(collection, index)?;
    let sql = format!(
        "SELECT data FROM {} WHERE {} = ?1 ORDER BY rowid",
        collection.table(),
        index.column()
    );
    collect_rows(conn, &sql, Some(value))
}

fn count_rows(conn: &Connection, collection: Collection, index: IndexName, value: &str) -> Result<i64> {
    require_index(collection, index)?;
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?1",
        collection.table(),
        index.column()
    );
    Ok(conn.query_row(&sql, params![value], |row| row.get(0))?)
}

fn delete_row(conn: &Connection, collection: Collection, id: &str) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", collection.table());
    let removed = conn.execute(&sql, params![id])?;
    Ok(removed > 0)
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Connection setup and migrations
// ---------------------------------------------------------------------------

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
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
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: collections, indices and metadata.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            status TEXT,
            created_at TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_invoices_tenant_id ON invoices(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status);
        CREATE INDEX IF NOT EXISTS idx_invoices_created_at ON invoices(created_at);

        CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            barcode TEXT,
            invoice_id TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_line_items_tenant_id ON line_items(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_barcode ON line_items(barcode);
        CREATE INDEX IF NOT EXISTS idx_line_items_invoice_id ON line_items(invoice_id);

        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_customers_tenant_id ON customers(tenant_id);

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            barcode TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_products_tenant_id ON products(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode);

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            created_at TEXT,
            invoice_id TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_payments_tenant_id ON payments(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_payments_created_at ON payments(created_at);
        CREATE INDEX IF NOT EXISTS idx_payments_invoice_id ON payments(invoice_id);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            tenant_id TEXT,
            status TEXT,
            created_at TEXT,
            entity_key TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_tenant_id ON sync_queue(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue(created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_key ON sync_queue(entity_key);

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        PosError::from(e)
    })?;

    info!("Applied migration v1 (collections, indices, metadata)");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
