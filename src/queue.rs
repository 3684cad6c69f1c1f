//! Durable offline action queue.
//!
//! Every local mutation that cannot be confirmed remotely at the moment it
//! happens becomes a row in `sync_queue`. Rows are replayed in creation
//! order by [`OfflineQueue::drain`]; entries for the same record are never
//! reordered. A transient failure aborts the remainder of the drain so
//! ordering is preserved; a permanent (authorization/validation) failure
//! removes the entry and surfaces the error instead of replaying a
//! rejected mutation forever.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, warn};

use crate::conflict::AntiJumpGuard;
use crate::config::SyncConfig;
use crate::db::CacheDb;
use crate::error::SyncError;
use crate::models::{parse_ts, QueueAction, QueueEntry};
use crate::remote::RemoteStore;

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries confirmed and removed.
    pub synced: usize,
    /// Entries left in place for retry.
    pub deferred: usize,
    /// Permanently-failed entries: `(record_id, error)`.
    pub surfaced: Vec<(String, String)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.deferred == 0 && self.surfaced.is_empty()
    }
}

/// Handle to the durable queue. Owned by the sync orchestrator — other
/// components enqueue through it but never drain directly.
pub struct OfflineQueue {
    db: Arc<CacheDb>,
    cfg: SyncConfig,
}

impl OfflineQueue {
    pub fn new(db: Arc<CacheDb>, cfg: SyncConfig) -> Self {
        Self { db, cfg }
    }

    /// Append a mutation intent. Returns the queue row id.
    pub fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        action: &QueueAction,
    ) -> Result<i64, SyncError> {
        let id = self.db.with_conn(|conn| {
            enqueue(conn, table, record_id, action, self.cfg.max_queue_retries)
        })?;
        info!(table, record_id, queue_id = id, "Queued offline mutation");
        Ok(id)
    }

    /// Pending entries in FIFO creation order.
    pub fn list_pending(&self) -> Result<Vec<QueueEntry>, SyncError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_table, record_id, action, created_at,
                        retry_count, last_error, next_retry_at
                 FROM sync_queue
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC",
            )?;
            let entries = stmt
                .query_map([], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Whether `record_id` has an unconfirmed outbound mutation. Consulted
    /// by the conflict resolver and by pull's skip logic.
    pub fn has_pending(&self, table: &str, record_id: &str) -> Result<bool, SyncError> {
        self.db.with_conn(|conn| has_pending(conn, table, record_id))
    }

    pub fn pending_count(&self) -> Result<i64, SyncError> {
        self.db.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Replay due entries against the remote, oldest first.
    ///
    /// Success removes the entry, clears the record's `pending_sync` flag,
    /// and arms the anti-jump guard so the echo of the write coming back
    /// through the live feed is suppressed. A transient failure schedules a
    /// retry and aborts the pass; a permanent failure removes the entry and
    /// is reported in [`DrainReport::surfaced`].
    pub async fn drain(
        &self,
        remote: &dyn RemoteStore,
        guard: &AntiJumpGuard,
    ) -> Result<DrainReport, SyncError> {
        let due = self.due_entries()?;
        let mut report = DrainReport::default();

        for entry in due {
            match self.dispatch(remote, &entry).await {
                Ok(()) => {
                    self.confirm(&entry)?;
                    guard.arm(&entry.record_id);
                    report.synced += 1;
                }
                Err(e) if e.is_permanent() => {
                    warn!(
                        queue_id = entry.id,
                        record_id = %entry.record_id,
                        error = %e,
                        "Dropping non-retryable queue entry"
                    );
                    self.discard(&entry)?;
                    report.surfaced.push((entry.record_id.clone(), e.to_string()));
                }
                Err(e) => {
                    self.defer(&entry, &e)?;
                    report.deferred += 1;
                    // Stop here: replaying later entries ahead of this one
                    // could reorder mutations on the same record.
                    break;
                }
            }
        }

        if report.synced > 0 {
            self.db.notify_table("orders");
            self.db.notify_table("order_items");
        }
        Ok(report)
    }

    /// Map a queue entry onto the corresponding remote call.
    async fn dispatch(
        &self,
        remote: &dyn RemoteStore,
        entry: &QueueEntry,
    ) -> Result<(), SyncError> {
        send_action(remote, &entry.table, &entry.record_id, &entry.action).await
    }

    fn due_entries(&self) -> Result<Vec<QueueEntry>, SyncError> {
        let limit = self.cfg.drain_batch as i64;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_table, record_id, action, created_at,
                        retry_count, last_error, next_retry_at
                 FROM sync_queue
                 WHERE status = 'pending'
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![Utc::now().to_rfc3339(), limit], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Remove a confirmed entry and clear the record's pending flag when no
    /// other entry for the same record remains.
    fn confirm(&self, entry: &QueueEntry) -> Result<(), SyncError> {
        self.db.with_transaction(&[], |conn| {
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry.id])?;
            clear_pending_flag(conn, &entry.table, &entry.record_id)
        })
    }

    /// Remove a permanently-failed entry. The pending flag is cleared so
    /// the next pull restores the last confirmed remote state.
    fn discard(&self, entry: &QueueEntry) -> Result<(), SyncError> {
        self.db.with_transaction(&[], |conn| {
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry.id])?;
            clear_pending_flag(conn, &entry.table, &entry.record_id)
        })
    }

    /// Keep a transiently-failed entry for a later retry, or park it as
    /// `failed` once the retry budget is exhausted.
    fn defer(&self, entry: &QueueEntry, error: &SyncError) -> Result<(), SyncError> {
        let attempts = entry.retry_count + 1;
        let exhausted = attempts >= self.cfg.max_queue_retries;
        let delay_ms = retry_delay_ms(
            self.cfg.base_retry_delay_ms,
            self.cfg.max_retry_delay_ms,
            entry.retry_count,
        );
        let next_retry = schedule_next_retry(delay_ms, entry.id);

        if exhausted {
            warn!(
                queue_id = entry.id,
                record_id = %entry.record_id,
                attempts,
                "Queue entry exhausted its retry budget, parking as failed"
            );
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue
                 SET status = ?1, retry_count = ?2, last_error = ?3,
                     next_retry_at = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    if exhausted { "failed" } else { "pending" },
                    attempts,
                    error.to_string(),
                    next_retry,
                    Utc::now().to_rfc3339(),
                    entry.id,
                ],
            )?;
            Ok(())
        })
    }
}

/// Perform the remote call for one mutation intent. Shared by the drain
/// loop and the direct (online) mutation path so both speak the same
/// idempotent calls.
pub(crate) async fn send_action(
    remote: &dyn RemoteStore,
    table: &str,
    record_id: &str,
    action: &QueueAction,
) -> Result<(), SyncError> {
    match action {
        QueueAction::SubmitOrder { order, items } => remote.submit_order(order, items).await,
        QueueAction::SetOrderStatus { status } => {
            remote.set_order_status(record_id, *status).await
        }
        QueueAction::FireItems { item_ids } => remote.fire_items(record_id, item_ids).await,
        QueueAction::MarkItemsReady { item_ids } => {
            remote.mark_items_ready(record_id, item_ids).await
        }
        QueueAction::CompleteOrderPart {
            item_ids,
            keep_order_open,
        } => {
            remote
                .complete_order_part(record_id, item_ids, *keep_order_open)
                .await
        }
        QueueAction::UpsertRecord { record } => remote.upsert(table, record_id, record).await,
        QueueAction::DeleteRecord => remote.delete(table, record_id).await,
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers
// ---------------------------------------------------------------------------

pub(crate) fn enqueue(
    conn: &Connection,
    table: &str,
    record_id: &str,
    action: &QueueAction,
    max_retries: i64,
) -> Result<i64, SyncError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_queue (target_table, record_id, action, status,
                                 max_retries, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
        params![
            table,
            record_id,
            serde_json::to_string(action)?,
            max_retries,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn has_pending(
    conn: &Connection,
    table: &str,
    record_id: &str,
) -> Result<bool, SyncError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE status = 'pending' AND target_table = ?1 AND record_id = ?2",
        params![table, record_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Clear the `pending_sync` flag on the order a confirmed entry belongs
/// to. Item-level entries resolve to their owning order; the flag stays
/// set while any other entry for that order (or its items) is in flight.
fn clear_pending_flag(conn: &Connection, table: &str, record_id: &str) -> Result<(), SyncError> {
    let order_id = match table {
        "orders" => Some(record_id.to_string()),
        "order_items" => conn
            .query_row(
                "SELECT order_id FROM order_items WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?,
        _ => None,
    };
    let Some(order_id) = order_id else {
        return Ok(());
    };

    if !order_has_inflight(conn, &order_id)? {
        conn.execute(
            "UPDATE orders SET pending_sync = 0 WHERE id = ?1",
            params![order_id],
        )?;
    }
    Ok(())
}

/// Any pending queue entry targeting the order or one of its items.
fn order_has_inflight(conn: &Connection, order_id: &str) -> Result<bool, SyncError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE status = 'pending'
           AND (record_id = ?1
                OR record_id IN (SELECT id FROM order_items WHERE order_id = ?1))",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let action_raw: String = row.get(3)?;
    let action: QueueAction = serde_json::from_str(&action_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueueEntry {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        action,
        created_at: parse_ts(&row.get::<_, String>(4)?).unwrap_or(DateTime::UNIX_EPOCH),
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
        next_retry_at: row.get::<_, Option<String>>(7)?.and_then(|s| parse_ts(&s)),
    })
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

fn retry_delay_ms(base_ms: i64, max_ms: i64, retry_count: i64) -> i64 {
    let shift = retry_count.clamp(0, 16) as u32;
    base_ms.saturating_mul(1_i64 << shift).clamp(base_ms, max_ms)
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(delay_ms + jitter)).to_rfc3339()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderKind, OrderStatus};
    use crate::remote::testing::MockRemote;
    use std::time::Duration;

    fn setup() -> (Arc<CacheDb>, OfflineQueue, AntiJumpGuard) {
        let db = Arc::new(CacheDb::open_in_memory().unwrap());
        let queue = OfflineQueue::new(db.clone(), SyncConfig::default());
        let guard = AntiJumpGuard::new(Duration::from_secs(5));
        (db, queue, guard)
    }

    fn pending_order(db: &CacheDb, id: &str) -> Order {
        let mut order = Order::new_local("biz-1", OrderKind::DineIn);
        order.id = id.to_string();
        order.status = OrderStatus::Ready;
        db.put_order(&order).unwrap();
        order
    }

    #[test]
    fn test_enqueue_and_list_fifo() {
        let (_db, queue, _guard) = setup();
        queue
            .enqueue(
                "orders",
                "ord-1",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();
        queue
            .enqueue(
                "orders",
                "ord-2",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::InProgress,
                },
            )
            .unwrap();

        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record_id, "ord-1");
        assert_eq!(pending[1].record_id, "ord-2");
        assert!(queue.has_pending("orders", "ord-1").unwrap());
        assert!(!queue.has_pending("orders", "ord-9").unwrap());
    }

    #[tokio::test]
    async fn test_drain_success_clears_pending_and_arms_guard() {
        let (db, queue, guard) = setup();
        pending_order(&db, "ord-1");
        queue
            .enqueue(
                "orders",
                "ord-1",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();

        let remote = MockRemote::default();
        let report = queue.drain(&remote, &guard).await.unwrap();

        assert_eq!(report.synced, 1);
        assert!(report.is_clean());
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(
            !db.get_order("ord-1").unwrap().unwrap().pending_sync,
            "pending flag cleared after confirmed replay"
        );
        assert!(guard.is_active("ord-1"), "anti-jump guard armed");
        assert_eq!(
            remote.statuses.lock().unwrap().get("ord-1"),
            Some(&OrderStatus::Ready)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_entry_and_aborts_drain() {
        let (db, queue, guard) = setup();
        pending_order(&db, "ord-1");
        pending_order(&db, "ord-2");
        queue
            .enqueue(
                "orders",
                "ord-1",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();
        queue
            .enqueue(
                "orders",
                "ord-2",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();

        let remote = MockRemote::default();
        remote.fail(|| SyncError::Network("connection refused".into()));

        let report = queue.drain(&remote, &guard).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.deferred, 1);
        // Second entry untouched: drain aborted to preserve ordering.
        assert_eq!(queue.pending_count().unwrap(), 2);

        let pending = queue.list_pending().unwrap();
        let first = pending.iter().find(|e| e.record_id == "ord-1").unwrap();
        assert_eq!(first.retry_count, 1);
        assert!(first.next_retry_at.is_some(), "retry scheduled with backoff");
        assert!(first.last_error.as_deref().unwrap().contains("network"));
        // Record still flagged pending locally.
        assert!(db.get_order("ord-1").unwrap().unwrap().pending_sync);
    }

    #[tokio::test]
    async fn test_permanent_failure_discards_and_surfaces() {
        let (db, queue, guard) = setup();
        pending_order(&db, "ord-1");
        queue
            .enqueue(
                "orders",
                "ord-1",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();

        let remote = MockRemote::default();
        remote.fail(|| SyncError::Validation("total mismatch".into()));

        let report = queue.drain(&remote, &guard).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.surfaced.len(), 1);
        assert_eq!(report.surfaced[0].0, "ord-1");
        assert_eq!(queue.pending_count().unwrap(), 0, "rejected entry removed");
        assert!(
            !db.get_order("ord-1").unwrap().unwrap().pending_sync,
            "flag cleared so the next pull restores confirmed state"
        );
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (db, queue, guard) = setup();
        pending_order(&db, "ord-1");
        let action = QueueAction::SetOrderStatus {
            status: OrderStatus::Ready,
        };
        queue.enqueue("orders", "ord-1", &action).unwrap();

        let remote = MockRemote::default();
        queue.drain(&remote, &guard).await.unwrap();
        let after_once = remote.statuses.lock().unwrap().clone();

        // Crash between remote success and local dequeue: the same action
        // is replayed. A status-set is absolute, so remote state is equal.
        queue.enqueue("orders", "ord-1", &action).unwrap();
        queue.drain(&remote, &guard).await.unwrap();
        let after_twice = remote.statuses.lock().unwrap().clone();

        assert_eq!(after_once, after_twice);
    }

    #[tokio::test]
    async fn test_retry_budget_parks_entry_as_failed() {
        let (db, _ignored, guard) = setup();
        let cfg = SyncConfig {
            max_queue_retries: 1,
            ..SyncConfig::default()
        };
        let queue = OfflineQueue::new(db.clone(), cfg);
        pending_order(&db, "ord-1");
        queue
            .enqueue(
                "orders",
                "ord-1",
                &QueueAction::SetOrderStatus {
                    status: OrderStatus::Ready,
                },
            )
            .unwrap();

        let remote = MockRemote::default();
        remote.fail(|| SyncError::Timeout("10s elapsed".into()));
        queue.drain(&remote, &guard).await.unwrap();

        // Budget of one attempt: entry is parked and no longer pending.
        assert_eq!(queue.pending_count().unwrap(), 0);
        remote.succeed();
        let report = queue.drain(&remote, &guard).await.unwrap();
        assert_eq!(report.synced, 0, "failed entries are not replayed");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(retry_delay_ms(5_000, 300_000, 0), 5_000);
        assert_eq!(retry_delay_ms(5_000, 300_000, 1), 10_000);
        assert_eq!(retry_delay_ms(5_000, 300_000, 3), 40_000);
        assert_eq!(retry_delay_ms(5_000, 300_000, 10), 300_000);
    }

    #[test]
    fn test_jitter_is_bounded_and_deterministic() {
        for seed in [0, 1, -5, 9_999] {
            let jitter = deterministic_jitter_ms(seed);
            assert!((50..750).contains(&jitter));
            assert_eq!(jitter, deterministic_jitter_ms(seed));
        }
    }
}
