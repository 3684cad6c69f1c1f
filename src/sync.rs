//! Sync orchestrator: pull, push, and live merge.
//!
//! Coordinates the three data paths into the local cache:
//! - **pull** — paginated bulk reads of remote state, filtered through the
//!   conflict resolver, with rolling-window replacement for orders;
//! - **push** — draining the offline action queue;
//! - **live merge** — a dedicated task consuming the remote change feed.
//!
//! All paths may be in flight at once and race to write the same record;
//! the conflict resolver adjudicates, per record, which writer wins. The
//! background loop is gated on the connectivity signal and the
//! offline→online transition triggers a drain followed by a pull to close
//! the gap the feed may have missed.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cards;
use crate::config::SyncConfig;
use crate::conflict::{should_accept, AntiJumpGuard, ConflictSnapshot};
use crate::db::{self, CacheDb, REFERENCE_TABLES};
use crate::error::SyncError;
use crate::models::{
    str_any, ts_any, ChangeEvent, ChangeKind, ItemStatus, Order, OrderItem,
};
use crate::queue::{DrainReport, OfflineQueue};
use crate::remote::{ChangeFeed, ConnectivitySignal, FetchFilter, RemoteStore};
use crate::retention;

/// Snapshot of sync health published on a watch channel for the UI's
/// degraded-sync indicator.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub pending_actions: i64,
    pub sync_error: Option<String>,
}

/// The last item-set mutation, captured for targeted undo. Undo reverses
/// exactly the item ids recorded here — items added to the same stage
/// afterwards are never touched.
#[derive(Debug, Clone)]
pub(crate) struct LastAction {
    pub order_id: String,
    pub item_ids: Vec<String>,
    pub from: ItemStatus,
    pub to: ItemStatus,
}

pub struct SyncOrchestrator {
    pub(crate) db: Arc<CacheDb>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) cfg: SyncConfig,
    pub(crate) guard: Arc<AntiJumpGuard>,
    pub(crate) queue: OfflineQueue,
    pub(crate) connectivity: ConnectivitySignal,
    status_tx: watch::Sender<SyncStatus>,
    shutdown: CancellationToken,
    /// Fires with the order id when every item of an order reaches ready;
    /// the customer-notification collaborator subscribes to this.
    ready_events: broadcast::Sender<String>,
    pub(crate) last_action: Mutex<Option<LastAction>>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<CacheDb>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivitySignal,
        cfg: SyncConfig,
    ) -> Arc<Self> {
        let guard = Arc::new(AntiJumpGuard::new(cfg.anti_jump_window));
        let queue = OfflineQueue::new(db.clone(), cfg.clone());
        let initial = SyncStatus {
            online: *connectivity.borrow(),
            ..SyncStatus::default()
        };
        let (status_tx, _) = watch::channel(initial);
        let (ready_events, _) = broadcast::channel(32);
        Arc::new(Self {
            db,
            remote,
            cfg,
            guard,
            queue,
            connectivity,
            status_tx,
            shutdown: CancellationToken::new(),
            ready_events,
            last_action: Mutex::new(None),
        })
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_ready_events(&self) -> broadcast::Receiver<String> {
        self.ready_events.subscribe()
    }

    pub fn cache(&self) -> &Arc<CacheDb> {
        &self.db
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Stop the background loop and the live-merge worker.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn set_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status_tx.send_modify(f);
    }

    pub(crate) fn notify_ready(&self, order_id: &str) {
        let _ = self.ready_events.send(order_id.to_string());
    }

    // -----------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------

    /// Hydrate every registered table, then the order window.
    pub async fn initial_load(&self) -> Result<(), SyncError> {
        if !self.is_online() {
            info!("Offline — initial load skipped, serving cached data");
            return Ok(());
        }
        for table in REFERENCE_TABLES {
            let count = self.sync_table(table).await?;
            debug!(table, count, "Reference table synced");
        }
        self.sync_orders(&self.shutdown).await?;
        Ok(())
    }

    /// Pull one reference table: paginated fetch, conflict-resolve each
    /// row, bulk upsert the accepted subset, prune rows the remote no
    /// longer has, update sync metadata.
    pub async fn sync_table(&self, table: &str) -> Result<usize, SyncError> {
        let filter = FetchFilter::default();
        let rows = self.fetch_all_pages(table, &filter, &self.shutdown).await?;

        let mut remote_ids = HashSet::new();
        let mut accepted: Vec<(String, Value)> = Vec::new();
        for row in &rows {
            let Some(id) = str_any(row, &["id"]) else {
                continue;
            };
            remote_ids.insert(id.clone());

            let snapshot = ConflictSnapshot {
                pending_sync: false,
                updated_at: DateTime::UNIX_EPOCH,
            };
            let queued = self.queue.has_pending(table, &id)?;
            let guard_active = self.guard.is_active(&id);
            if should_accept(
                Some(&snapshot),
                ts_any(row, &["server_updated_at", "updated_at"]),
                queued,
                guard_active,
            ) {
                accepted.push((id, row.clone()));
            }
        }

        let accepted_count = accepted.len();
        self.db.bulk_put_records(table, &accepted)?;

        // Tombstone-by-absence, except rows with in-flight mutations.
        for id in self.db.record_ids(table)? {
            if !remote_ids.contains(&id) && !self.queue.has_pending(table, &id)? {
                self.db.delete_record(table, &id)?;
            }
        }

        self.db.set_sync_meta(table, remote_ids.len() as i64)?;
        Ok(accepted_count)
    }

    /// Windowed pull of orders and their items.
    ///
    /// The whole window is replaced in one cache transaction
    /// (clear-then-bulk-insert plus absence pruning) because incremental
    /// patching cannot express server-side hard deletes. Rows that lose
    /// conflict resolution are left untouched; so are orders with queued
    /// mutations. A cancelled pull applies nothing — the fetch completes
    /// or aborts before the transaction starts.
    pub async fn sync_orders(&self, cancel: &CancellationToken) -> Result<usize, SyncError> {
        let now = Utc::now();
        let since = retention::window_start(now, self.cfg.sync_window_days);
        let filter = FetchFilter {
            since: Some(since),
            ..FetchFilter::default()
        };

        let rows = self.fetch_all_pages("orders", &filter, cancel).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted);
        }

        let mut remote_ids = HashSet::new();
        let mut accepted: Vec<(Order, Vec<OrderItem>)> = Vec::new();
        let mut skipped = 0usize;

        for row in &rows {
            let Some(order) = Order::from_remote(row) else {
                continue;
            };
            remote_ids.insert(order.id.clone());

            let local = self.db.get_order(&order.id)?;
            let snapshot = local.as_ref().map(ConflictSnapshot::of_order);
            let queued = self.queue.has_pending("orders", &order.id)?;
            let guard_active = self.guard.is_active(&order.id);

            if !should_accept(
                snapshot.as_ref(),
                order.server_updated_at,
                queued,
                guard_active,
            ) {
                skipped += 1;
                continue;
            }

            let items = nested_items(row, &order.id);
            accepted.push((order, items));
        }

        let accepted_count = accepted.len();
        let pruned = self
            .db
            .with_transaction(&["orders", "order_items"], |conn| {
                for (order, items) in &accepted {
                    db::put_order(conn, order)?;
                    // Replace the item set wholesale: a missing item means
                    // the server deleted it.
                    conn.execute(
                        "DELETE FROM order_items WHERE order_id = ?1",
                        params![order.id],
                    )?;
                    for item in items {
                        db::put_item(conn, item)?;
                    }
                }
                retention::prune_absent_orders(conn, since, &remote_ids)
            })?;

        self.db.set_sync_meta("orders", remote_ids.len() as i64)?;
        self.set_status(|s| {
            s.last_pull_at = Some(Utc::now());
        });
        info!(
            accepted = accepted_count,
            skipped,
            pruned = pruned.len(),
            "Order window synced"
        );
        Ok(accepted_count)
    }

    async fn fetch_all_pages(
        &self,
        table: &str,
        filter: &FetchFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, SyncError> {
        let mut rows = Vec::new();
        let mut offset = 0;
        for _page in 0..self.cfg.max_pull_pages {
            if cancel.is_cancelled() {
                return Err(SyncError::Aborted);
            }
            let page = self
                .remote
                .fetch(table, filter, offset, self.cfg.batch_size)
                .await?;
            let n = page.len();
            rows.extend(page);
            if n < self.cfg.batch_size {
                break;
            }
            offset += n;
        }
        Ok(rows)
    }

    /// Pull the order window with bounded, jittered exponential backoff.
    /// Authorization failures are surfaced immediately — retrying cannot
    /// fix a revoked key and would mask a real misconfiguration.
    pub async fn pull_with_retry(&self, cancel: &CancellationToken) -> Result<usize, SyncError> {
        let mut last_err = SyncError::Internal("pull never attempted".into());
        for attempt in 0..self.cfg.max_pull_attempts {
            match self.sync_orders(cancel).await {
                Ok(count) => {
                    self.set_status(|s| s.sync_error = None);
                    return Ok(count);
                }
                Err(SyncError::Aborted) => return Err(SyncError::Aborted),
                Err(e) if e.is_auth() => {
                    self.set_status(|s| s.sync_error = Some(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Pull failed, backing off");
                    last_err = e;
                    let delay = retry_backoff_ms(self.cfg.base_retry_delay_ms, attempt)
                        .min(self.cfg.max_retry_delay_ms);
                    tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
                }
            }
        }
        self.set_status(|s| s.sync_error = Some(last_err.to_string()));
        Err(last_err)
    }

    // -----------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------

    /// Drain the offline queue. No-op while offline.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        if !self.is_online() {
            return Ok(DrainReport::default());
        }
        let report = self.queue.drain(self.remote.as_ref(), &self.guard).await?;
        let pending = self.queue.pending_count()?;
        self.set_status(|s| {
            s.pending_actions = pending;
            if let Some((record_id, error)) = report.surfaced.first() {
                s.sync_error = Some(format!("{record_id}: {error}"));
            }
        });
        Ok(report)
    }

    // -----------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------

    async fn run_cycle(&self) -> Result<(), SyncError> {
        self.guard.sweep();
        self.drain().await?;
        self.pull_with_retry(&self.shutdown).await?;
        retention::purge_expired(&self.db, self.cfg.purge_horizon_days)?;
        Ok(())
    }

    /// Start the periodic sync loop. Runs until [`SyncOrchestrator::stop`].
    pub fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = this.cfg.pull_interval.as_secs(),
                "Sync loop started"
            );
            let mut interval = tokio::time::interval(this.cfg.pull_interval);
            interval.tick().await; // skip immediate tick
            let mut connectivity = this.connectivity.clone();
            let mut previous_online = *connectivity.borrow();

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => {
                        info!("Sync loop stopped");
                        break;
                    }

                    _ = interval.tick() => {
                        let online = *connectivity.borrow();
                        this.set_status(|s| s.online = online);
                        if !online {
                            debug!("Offline; deferring sync and keeping queue pending");
                            continue;
                        }
                        if let Err(e) = this.run_cycle().await {
                            warn!(error = %e, "Sync cycle failed");
                        }
                    }

                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            info!("Connectivity signal dropped, sync loop stopping");
                            break;
                        }
                        let online = *connectivity.borrow();
                        this.set_status(|s| s.online = online);
                        if online && !previous_online {
                            info!("Network restored; draining queue and re-pulling");
                            if let Err(e) = this.run_cycle().await {
                                warn!(error = %e, "Reconnect sync failed");
                            }
                        }
                        previous_online = online;
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // Live merge
    // -----------------------------------------------------------------

    /// Start the live-merge worker on a change feed subscription. On lag
    /// the worker re-pulls to close the gap; on feed close it stops (the
    /// transport layer is expected to resubscribe and re-pull).
    pub fn spawn_live_merge(self: &Arc<Self>, feed: &dyn ChangeFeed) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = feed.subscribe();
        tokio::spawn(async move {
            info!("Live merge worker started");
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => {
                        info!("Live merge worker stopped");
                        break;
                    }

                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                if let Err(e) = this.apply_change(event).await {
                                    warn!(error = %e, "Failed to apply change event");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(lagged = n, "Change feed lagged, re-pulling to close gap");
                                if let Err(e) = this.pull_with_retry(&this.shutdown).await {
                                    warn!(error = %e, "Recovery pull failed");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Change feed closed, live merge worker stopping");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Merge one change event. Returns whether the event was applied.
    ///
    /// Arrival order is not trusted — acceptance is decided by the
    /// conflict resolver, so an out-of-order stale update loses to the
    /// timestamp check rather than clobbering newer state.
    pub async fn apply_change(&self, event: ChangeEvent) -> Result<bool, SyncError> {
        match event.table.as_str() {
            "orders" => self.merge_order_event(&event),
            "order_items" => self.merge_item_event(&event),
            table if REFERENCE_TABLES.contains(&table) => self.merge_record_event(&event),
            other => {
                debug!(table = other, "Ignoring change event for unknown table");
                Ok(false)
            }
        }
    }

    fn merge_order_event(&self, event: &ChangeEvent) -> Result<bool, SyncError> {
        let Some(id) = str_any(&event.record, &["id"]) else {
            return Ok(false);
        };

        if event.kind == ChangeKind::Delete {
            return self.db.delete_order(&id);
        }

        let Some(order) = Order::from_remote(&event.record) else {
            return Ok(false);
        };
        let local = self.db.get_order(&order.id)?;
        let snapshot = local.as_ref().map(ConflictSnapshot::of_order);
        let queued = self.queue.has_pending("orders", &order.id)?;
        let guard_active = self.guard.is_active(&order.id);

        if !should_accept(
            snapshot.as_ref(),
            order.server_updated_at,
            queued,
            guard_active,
        ) {
            debug!(order_id = %order.id, "Live update dropped by conflict resolver");
            return Ok(false);
        }

        let items = nested_items(&event.record, &order.id);
        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                db::put_order(conn, &order)?;
                for item in &items {
                    db::put_item(conn, item)?;
                }
                Ok(())
            })?;
        Ok(true)
    }

    fn merge_item_event(&self, event: &ChangeEvent) -> Result<bool, SyncError> {
        let Some(id) = str_any(&event.record, &["id"]) else {
            return Ok(false);
        };

        if event.kind == ChangeKind::Delete {
            return self.db.delete_item(&id);
        }

        let Some(item) = OrderItem::from_remote(&event.record, "") else {
            return Ok(false);
        };
        if item.order_id.is_empty() {
            return Ok(false);
        }
        // The owning order carries the pending flag and the guard key.
        let Some(order) = self.db.get_order(&item.order_id)? else {
            debug!(item_id = %item.id, "Item event for unknown order, ignoring");
            return Ok(false);
        };
        let snapshot = ConflictSnapshot::of_order(&order);
        let queued = self.queue.has_pending("orders", &order.id)?;
        let guard_active = self.guard.is_active(&order.id) || self.guard.is_active(&item.id);

        if !should_accept(
            Some(&snapshot),
            ts_any(&event.record, &["server_updated_at", "updated_at"]),
            queued,
            guard_active,
        ) {
            debug!(item_id = %item.id, "Live item update dropped by conflict resolver");
            return Ok(false);
        }

        self.db.put_item(&item)?;
        Ok(true)
    }

    fn merge_record_event(&self, event: &ChangeEvent) -> Result<bool, SyncError> {
        let Some(id) = str_any(&event.record, &["id"]) else {
            return Ok(false);
        };

        if event.kind == ChangeKind::Delete {
            return self.db.delete_record(&event.table, &id);
        }

        let queued = self.queue.has_pending(&event.table, &id)?;
        if queued || self.guard.is_active(&id) {
            return Ok(false);
        }
        self.db.put_record(&event.table, &id, &event.record)?;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------

    /// Active + delayed cards, fairness-sorted. See [`crate::views`].
    pub fn current_orders(&self) -> Result<Vec<cards::Card>, SyncError> {
        crate::views::current_orders(&self.db, &self.cfg)
    }

    /// Ready cards, most-recent-ready-first.
    pub fn completed_orders(&self) -> Result<Vec<cards::Card>, SyncError> {
        crate::views::completed_orders(&self.db, &self.cfg)
    }
}

fn nested_items(row: &Value, order_id: &str) -> Vec<OrderItem> {
    row.get("order_items")
        .or_else(|| row.get("items_detail"))
        .or_else(|| row.get("items"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|r| OrderItem::from_remote(r, order_id))
                .collect()
        })
        .unwrap_or_default()
}

fn retry_backoff_ms(base_ms: i64, attempt: u32) -> i64 {
    let shift = attempt.min(16);
    let delay = base_ms.saturating_mul(1_i64 << shift);
    // Deterministic jitter keeps replays spread out without a RNG dep.
    delay + (delay % 700) + 50
}

// ===========================================================================
// Tests
// ===========================================================================
