//! Rolling-window retention for orders and order items.
//!
//! Pull replaces the local window wholesale (clear-then-bulk-insert),
//! because incremental patching cannot express server-side hard deletes.
//! The pruning half of that replacement lives here so it can run inside
//! the same cache transaction as the inserts. A second, larger horizon
//! deletes anything older outright, independent of sync, to bound local
//! storage growth.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::CacheDb;
use crate::error::SyncError;

/// Start of the rolling sync window.
pub fn window_start(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - Duration::days(window_days)
}

/// Remove window-resident orders the remote no longer returned
/// (tombstone-by-absence). Exemptions, checked per row:
/// - orders created before the window (they were never in the response),
/// - orders flagged `pending_sync`,
/// - orders with an outstanding offline-queue entry.
///
/// Runs inside the pull transaction; items cascade via the foreign key.
/// Returns the ids pruned.
pub(crate) fn prune_absent_orders(
    conn: &Connection,
    window_start: DateTime<Utc>,
    remote_ids: &HashSet<String>,
) -> Result<Vec<String>, SyncError> {
    let mut stmt = conn.prepare(
        "SELECT o.id FROM orders o
         WHERE o.created_at >= ?1
           AND o.pending_sync = 0
           AND NOT EXISTS (
                SELECT 1 FROM sync_queue q
                WHERE q.status = 'pending' AND q.record_id = o.id
           )",
    )?;
    let candidates = stmt
        .query_map(params![window_start.to_rfc3339()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<String>, _>>()?;

    let mut pruned = Vec::new();
    for id in candidates {
        if !remote_ids.contains(&id) {
            conn.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
            pruned.push(id);
        }
    }

    if !pruned.is_empty() {
        warn!(count = pruned.len(), "Pruned orders absent from remote window");
    }
    Ok(pruned)
}

/// Hard purge: delete every order older than the horizon, along with its
/// items (cascade) and any queue rows that reference it. Bounds storage
/// growth no matter what the sync state is.
pub fn purge_expired(db: &Arc<CacheDb>, horizon_days: i64) -> Result<usize, SyncError> {
    let cutoff = (Utc::now() - Duration::days(horizon_days)).to_rfc3339();
    let purged = db.with_transaction(&["orders", "order_items"], |conn| {
        conn.execute(
            "DELETE FROM sync_queue WHERE record_id IN
                (SELECT id FROM orders WHERE created_at < ?1)",
            params![cutoff],
        )?;
        let purged = conn.execute("DELETE FROM orders WHERE created_at < ?1", params![cutoff])?;
        Ok(purged)
    })?;

    if purged > 0 {
        info!(purged, horizon_days, "Purged orders past retention horizon");
    }
    Ok(purged)
}
