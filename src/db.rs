//! Durable local cache backed by SQLite.
//!
//! Uses rusqlite with WAL mode. One typed table each for orders and order
//! items (the hot path for the kitchen display), one JSON-document table
//! per registered reference table (customers, menu items, …), plus the
//! offline action queue, per-table sync metadata, and a category/key/value
//! settings store for sync cursors.
//!
//! All writes are idempotent upserts keyed by identifier and become visible
//! to subsequent reads immediately. Multi-table updates that must move
//! together go through [`CacheDb::with_transaction`]; a failure inside the
//! closure rolls the whole transaction back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::models::{
    parse_ts, DeliveryInfo, ItemStatus, Order, OrderItem, OrderKind, OrderStatus, RecordOrigin,
    SyncMeta,
};

/// Reference tables stored as JSON documents. Writes to any other generic
/// table name are rejected, which doubles as SQL-injection protection for
/// the interpolated table names below.
pub const REFERENCE_TABLES: &[&str] = &["customers", "menu_items", "employees", "discounts"];

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Broadcast payload emitted after every successful write, keyed by table
/// name. Derived views subscribe and recompute; nothing hand-patches a
/// materialized list.
#[derive(Debug, Clone)]
pub struct TableChanged {
    pub table: String,
}

/// Shared handle to the local cache.
pub struct CacheDb {
    conn: Mutex<Connection>,
    pub db_path: Option<PathBuf>,
    changes: broadcast::Sender<TableChanged>,
}

impl CacheDb {
    /// Open (or create) the cache at `{data_dir}/ordersync.db`.
    ///
    /// Creates the directory if needed, applies pragmas, and runs pending
    /// migrations. On corruption or open failure, deletes the file and
    /// retries once.
    pub fn open(data_dir: &Path) -> Result<Self, SyncError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| SyncError::Database(format!("create data dir: {e}")))?;

        let db_path = data_dir.join("ordersync.db");
        info!("Opening cache database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!("Cache open failed ({first_err}), deleting and retrying once");
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)
                    .map_err(|e| SyncError::Database(format!("cache open after retry: {e}")))?
            }
        };

        run_migrations(&conn)?;
        info!("Cache database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        let (changes, _) = broadcast::channel(128);
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
            changes,
        })
    }

    /// In-memory cache, used by tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        let (changes, _) = broadcast::channel(128);
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            changes,
        })
    }

    /// Subscribe to write notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TableChanged> {
        self.changes.subscribe()
    }

    fn notify(&self, table: &str) {
        let _ = self.changes.send(TableChanged {
            table: table.to_string(),
        });
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Internal("cache mutex poisoned".into()))
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// Atomic multi-table read-modify-write. The closure runs inside a
    /// single `BEGIN IMMEDIATE` transaction; an `Err` rolls everything
    /// back and no change notification is emitted. `tables` names the
    /// tables whose subscribers should recompute after commit.
    pub fn with_transaction<T>(
        &self,
        tables: &[&str],
        f: impl FnOnce(&Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                drop(conn);
                for table in tables {
                    self.notify(table);
                }
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------

    pub fn get_order(&self, id: &str) -> Result<Option<Order>, SyncError> {
        get_order(&*self.conn()?, id)
    }

    pub fn put_order(&self, order: &Order) -> Result<(), SyncError> {
        put_order(&*self.conn()?, order)?;
        self.notify("orders");
        Ok(())
    }

    pub fn put_orders(&self, orders: &[Order]) -> Result<(), SyncError> {
        if orders.is_empty() {
            return Ok(());
        }
        self.with_transaction(&["orders"], |conn| {
            for order in orders {
                put_order(conn, order)?;
            }
            Ok(())
        })
    }

    /// Delete one order; items cascade via the foreign key.
    pub fn delete_order(&self, id: &str) -> Result<bool, SyncError> {
        let deleted = delete_order(&*self.conn()?, id)?;
        if deleted {
            self.notify("orders");
            self.notify("order_items");
        }
        Ok(deleted)
    }

    /// Orders created at or after `cutoff`, oldest first.
    pub fn orders_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, SyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE created_at >= ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_orders(&self) -> Result<Vec<Order>, SyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map([], order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------
    // Order items
    // -----------------------------------------------------------------

    pub fn get_item(&self, id: &str) -> Result<Option<OrderItem>, SyncError> {
        get_item(&*self.conn()?, id)
    }

    pub fn put_item(&self, item: &OrderItem) -> Result<(), SyncError> {
        put_item(&*self.conn()?, item)?;
        self.notify("order_items");
        Ok(())
    }

    pub fn put_items(&self, items: &[OrderItem]) -> Result<(), SyncError> {
        if items.is_empty() {
            return Ok(());
        }
        self.with_transaction(&["order_items"], |conn| {
            for item in items {
                put_item(conn, item)?;
            }
            Ok(())
        })
    }

    pub fn items_for_order(&self, order_id: &str) -> Result<Vec<OrderItem>, SyncError> {
        items_for_order(&*self.conn()?, order_id)
    }

    pub fn delete_item(&self, id: &str) -> Result<bool, SyncError> {
        let n = self
            .conn()?
            .execute("DELETE FROM order_items WHERE id = ?1", params![id])?;
        if n > 0 {
            self.notify("order_items");
        }
        Ok(n > 0)
    }

    // -----------------------------------------------------------------
    // Reference documents
    // -----------------------------------------------------------------

    pub fn get_record(&self, table: &str, id: &str) -> Result<Option<Value>, SyncError> {
        check_reference_table(table)?;
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_record(&self, table: &str, id: &str, data: &Value) -> Result<(), SyncError> {
        check_reference_table(table)?;
        put_record(&*self.conn()?, table, id, data)?;
        self.notify(table);
        Ok(())
    }

    pub fn bulk_put_records(&self, table: &str, rows: &[(String, Value)]) -> Result<(), SyncError> {
        check_reference_table(table)?;
        if rows.is_empty() {
            return Ok(());
        }
        self.with_transaction(&[table], |conn| {
            for (id, data) in rows {
                put_record(conn, table, id, data)?;
            }
            Ok(())
        })
    }

    pub fn delete_record(&self, table: &str, id: &str) -> Result<bool, SyncError> {
        check_reference_table(table)?;
        let n = self
            .conn()?
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        if n > 0 {
            self.notify(table);
        }
        Ok(n > 0)
    }

    pub fn record_ids(&self, table: &str) -> Result<Vec<String>, SyncError> {
        check_reference_table(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT id FROM {table}"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Load and filter the documents of one reference table.
    pub fn query_records(
        &self,
        table: &str,
        predicate: impl Fn(&Value) -> bool,
    ) -> Result<Vec<Value>, SyncError> {
        check_reference_table(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT data FROM {table}"))?;
        let raw_rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;
        let mut out = Vec::new();
        for raw in raw_rows {
            let value: Value = serde_json::from_str(&raw)?;
            if predicate(&value) {
                out.push(value);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Sync metadata + settings
    // -----------------------------------------------------------------

    pub fn set_sync_meta(&self, table: &str, record_count: i64) -> Result<(), SyncError> {
        self.conn()?.execute(
            "INSERT INTO sync_meta (table_name, last_synced_at, record_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                record_count = excluded.record_count",
            params![table, Utc::now().to_rfc3339(), record_count],
        )?;
        Ok(())
    }

    pub fn get_sync_meta(&self, table: &str) -> Result<Option<SyncMeta>, SyncError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT table_name, last_synced_at, record_count
                 FROM sync_meta WHERE table_name = ?1",
                params![table],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(table, at, count)| SyncMeta {
            table,
            last_synced_at: parse_ts(&at).unwrap_or(DateTime::UNIX_EPOCH),
            record_count: count,
        }))
    }

    pub fn setting_get(&self, category: &str, key: &str) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn setting_set(&self, category: &str, key: &str, value: &str) -> Result<(), SyncError> {
        self.conn()?.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
            params![category, key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shared connection access
    // -----------------------------------------------------------------

    /// Run `f` against the raw connection. Used by the queue and retention
    /// modules, which own their SQL but share the connection and mutex.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        f(&*self.conn()?)
    }

    pub(crate) fn notify_table(&self, table: &str) {
        self.notify(table);
    }
}

fn check_reference_table(table: &str) -> Result<(), SyncError> {
    if REFERENCE_TABLES.contains(&table) {
        Ok(())
    } else {
        Err(SyncError::Internal(format!(
            "unknown reference table: {table}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Connection setup + migrations
// ---------------------------------------------------------------------------

fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
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
        return Ok(());
    }

    info!("Migrating cache schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

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

/// Migration v1: orders, order items, offline queue, settings.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL DEFAULT '',
            order_number TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            customer_id TEXT,
            customer_name TEXT,
            customer_phone TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            is_paid INTEGER NOT NULL DEFAULT 0,
            order_type TEXT NOT NULL DEFAULT 'dine_in',
            delivery_address TEXT,
            delivery_fee REAL NOT NULL DEFAULT 0,
            delivery_notes TEXT,
            driver_id TEXT,
            driver_name TEXT,
            driver_phone TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            ready_at TEXT,
            seen_at TEXT,
            pending_sync INTEGER NOT NULL DEFAULT 0,
            server_updated_at TEXT,
            origin TEXT NOT NULL DEFAULT 'remote'
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            menu_item_id TEXT,
            name TEXT,
            quantity INTEGER NOT NULL DEFAULT 1,
            price REAL NOT NULL DEFAULT 0,
            modifiers TEXT NOT NULL DEFAULT '[]',
            note TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            course_stage INTEGER NOT NULL DEFAULT 1,
            early_delivered INTEGER NOT NULL DEFAULT 0,
            fired_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_table TEXT NOT NULL,
            record_id TEXT NOT NULL,
            action TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: reference document tables + sync metadata.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    for table in REFERENCE_TABLES {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT
            );"
        ))?;
    }
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_meta (
            table_name TEXT PRIMARY KEY,
            last_synced_at TEXT NOT NULL,
            record_count INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    Ok(())
}

/// Migration v3: indexes for the hot queries.
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_pending_sync ON orders(pending_sync);
        CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, created_at);
        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row-level operations (shared with transactions)
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, business_id, order_number, status, customer_id, customer_name, \
     customer_phone, total_amount, paid_amount, is_paid, order_type, delivery_address, \
     delivery_fee, delivery_notes, driver_id, driver_name, driver_phone, created_at, \
     updated_at, ready_at, seen_at, pending_sync, server_updated_at, origin";

const ITEM_COLUMNS: &str = "id, order_id, menu_item_id, name, quantity, price, modifiers, note, \
     status, course_stage, early_delivered, fired_at, updated_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let delivery = DeliveryInfo {
        address: row.get(11)?,
        fee: row.get::<_, Option<f64>>(12)?.unwrap_or(0.0),
        notes: row.get(13)?,
        driver_id: row.get(14)?,
        driver_name: row.get(15)?,
        driver_phone: row.get(16)?,
    };
    Ok(Order {
        id: row.get(0)?,
        business_id: row.get(1)?,
        order_number: row.get(2)?,
        status: OrderStatus::parse(&row.get::<_, String>(3)?).unwrap_or_default(),
        customer_id: row.get(4)?,
        customer_name: row.get(5)?,
        customer_phone: row.get(6)?,
        total_amount: row.get(7)?,
        paid_amount: row.get(8)?,
        is_paid: row.get::<_, i64>(9)? != 0,
        kind: OrderKind::parse(&row.get::<_, String>(10)?),
        delivery: if delivery.is_empty() {
            None
        } else {
            Some(delivery)
        },
        created_at: parse_ts(&row.get::<_, String>(17)?).unwrap_or(DateTime::UNIX_EPOCH),
        updated_at: parse_ts(&row.get::<_, String>(18)?).unwrap_or(DateTime::UNIX_EPOCH),
        ready_at: row.get::<_, Option<String>>(19)?.and_then(|s| parse_ts(&s)),
        seen_at: row.get::<_, Option<String>>(20)?.and_then(|s| parse_ts(&s)),
        pending_sync: row.get::<_, i64>(21)? != 0,
        server_updated_at: row.get::<_, Option<String>>(22)?.and_then(|s| parse_ts(&s)),
        origin: RecordOrigin::parse(&row.get::<_, String>(23)?),
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    let modifiers: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default();
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        menu_item_id: row.get(2)?,
        name: row.get(3)?,
        quantity: row.get(4)?,
        price: row.get(5)?,
        modifiers,
        note: row.get(7)?,
        status: ItemStatus::parse(&row.get::<_, String>(8)?).unwrap_or_default(),
        course_stage: row.get::<_, i64>(9)?.max(1) as u32,
        early_delivered: row.get::<_, i64>(10)? != 0,
        fired_at: row.get::<_, Option<String>>(11)?.and_then(|s| parse_ts(&s)),
        updated_at: parse_ts(&row.get::<_, String>(12)?).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

/// Idempotent order upsert. `created_at` is written on insert only — it is
/// the immutable queue-position key.
pub(crate) fn put_order(conn: &Connection, order: &Order) -> Result<(), SyncError> {
    let delivery = order.delivery.clone().unwrap_or_default();
    conn.execute(
        "INSERT INTO orders (
            id, business_id, order_number, status, customer_id, customer_name,
            customer_phone, total_amount, paid_amount, is_paid, order_type,
            delivery_address, delivery_fee, delivery_notes, driver_id,
            driver_name, driver_phone, created_at, updated_at, ready_at,
            seen_at, pending_sync, server_updated_at, origin
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24
        )
        ON CONFLICT(id) DO UPDATE SET
            business_id = excluded.business_id,
            order_number = excluded.order_number,
            status = excluded.status,
            customer_id = excluded.customer_id,
            customer_name = excluded.customer_name,
            customer_phone = excluded.customer_phone,
            total_amount = excluded.total_amount,
            paid_amount = excluded.paid_amount,
            is_paid = excluded.is_paid,
            order_type = excluded.order_type,
            delivery_address = excluded.delivery_address,
            delivery_fee = excluded.delivery_fee,
            delivery_notes = excluded.delivery_notes,
            driver_id = excluded.driver_id,
            driver_name = excluded.driver_name,
            driver_phone = excluded.driver_phone,
            updated_at = excluded.updated_at,
            ready_at = excluded.ready_at,
            seen_at = excluded.seen_at,
            pending_sync = excluded.pending_sync,
            server_updated_at = excluded.server_updated_at,
            origin = excluded.origin",
        params![
            order.id,
            order.business_id,
            order.order_number,
            order.status.as_str(),
            order.customer_id,
            order.customer_name,
            order.customer_phone,
            order.total_amount,
            order.paid_amount,
            order.is_paid as i64,
            order.kind.as_str(),
            delivery.address,
            delivery.fee,
            delivery.notes,
            delivery.driver_id,
            delivery.driver_name,
            delivery.driver_phone,
            order.created_at.to_rfc3339(),
            order.updated_at.to_rfc3339(),
            order.ready_at.map(|t| t.to_rfc3339()),
            order.seen_at.map(|t| t.to_rfc3339()),
            order.pending_sync as i64,
            order.server_updated_at.map(|t| t.to_rfc3339()),
            order.origin.as_str(),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_order(conn: &Connection, id: &str) -> Result<Option<Order>, SyncError> {
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

pub(crate) fn delete_order(conn: &Connection, id: &str) -> Result<bool, SyncError> {
    let n = conn.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

pub(crate) fn put_item(conn: &Connection, item: &OrderItem) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO order_items (
            id, order_id, menu_item_id, name, quantity, price, modifiers,
            note, status, course_stage, early_delivered, fired_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
            order_id = excluded.order_id,
            menu_item_id = excluded.menu_item_id,
            name = excluded.name,
            quantity = excluded.quantity,
            price = excluded.price,
            modifiers = excluded.modifiers,
            note = excluded.note,
            status = excluded.status,
            course_stage = excluded.course_stage,
            early_delivered = excluded.early_delivered,
            fired_at = excluded.fired_at,
            updated_at = excluded.updated_at",
        params![
            item.id,
            item.order_id,
            item.menu_item_id,
            item.name,
            item.quantity,
            item.price,
            serde_json::to_string(&item.modifiers)?,
            item.note,
            item.status.as_str(),
            item.course_stage as i64,
            item.early_delivered as i64,
            item.fired_at.map(|t| t.to_rfc3339()),
            item.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_item(conn: &Connection, id: &str) -> Result<Option<OrderItem>, SyncError> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE id = ?1"),
            params![id],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

pub(crate) fn items_for_order(
    conn: &Connection,
    order_id: &str,
) -> Result<Vec<OrderItem>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ?1 ORDER BY course_stage ASC, id ASC"
    ))?;
    let items = stmt
        .query_map(params![order_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn put_record(conn: &Connection, table: &str, id: &str, data: &Value) -> Result<(), SyncError> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at"
        ),
        params![id, serde_json::to_string(data)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
