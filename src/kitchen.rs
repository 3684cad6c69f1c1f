//! Imperative mutation entry points for the kitchen display and kanban.
//!
//! Every mutation follows the same sequence: optimistic write to the local
//! cache (flagged `pending_sync`), then the remote call — direct when
//! online, queued otherwise. A confirmed call clears the flag and arms the
//! anti-jump guard; a transient failure falls back to the queue with the
//! optimistic state kept; a permanent (validation/authorization) failure
//! reverts the cache to the exact pre-mutation state and surfaces the
//! error. `created_at` is never touched by any of these paths.

use chrono::Utc;
use rusqlite::params;
use tracing::{info, warn};

use crate::db;
use crate::error::SyncError;
use crate::models::{ItemStatus, Order, OrderItem, OrderStatus, QueueAction};
use crate::queue::send_action;
use crate::sync::{LastAction, SyncOrchestrator};

impl SyncOrchestrator {
    // -----------------------------------------------------------------
    // Order creation
    // -----------------------------------------------------------------

    /// Insert a locally-created order and submit it.
    ///
    /// Stage-1 items fire automatically on creation; later course stages
    /// start `held` until fired by staff.
    pub async fn create_order(
        &self,
        mut order: Order,
        mut items: Vec<OrderItem>,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        order.pending_sync = true;
        order.updated_at = now;
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::InProgress;
        }
        for item in items.iter_mut() {
            item.order_id = order.id.clone();
            if item.status == ItemStatus::Pending {
                if item.course_stage <= 1 {
                    item.status = ItemStatus::InProgress;
                    item.fired_at = Some(now);
                } else {
                    item.status = ItemStatus::Held;
                }
            }
            item.updated_at = now;
        }

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                db::put_order(conn, &order)?;
                for item in &items {
                    db::put_item(conn, item)?;
                }
                Ok(())
            })?;
        info!(order_id = %order.id, items = items.len(), "Order created locally");

        let action = QueueAction::SubmitOrder {
            order: order.clone(),
            items: items.clone(),
        };

        if !self.is_online() {
            self.enqueue_action(&order.id, action)?;
            return Ok(());
        }

        match send_action(self.remote.as_ref(), "orders", &order.id, &action).await {
            Ok(()) => self.confirm_order(&order.id),
            Err(e) if e.is_permanent() => {
                // Pre-mutation state for a create is "absent".
                warn!(order_id = %order.id, error = %e, "Order submit rejected, removing local copy");
                self.db.delete_order(&order.id)?;
                Err(e)
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Order submit deferred to queue");
                self.enqueue_action(&order.id, action)?;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------
    // Coarse order status (kanban)
    // -----------------------------------------------------------------

    /// Set the coarse order status and cascade a matching item status.
    pub async fn update_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
    ) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let now = Utc::now();

        let item_status = cascade_item_status(new_status);
        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                let mut order = before_order.clone();
                order.status = new_status;
                order.updated_at = now;
                order.pending_sync = true;
                if new_status == OrderStatus::Ready && order.ready_at.is_none() {
                    order.ready_at = Some(now);
                }
                db::put_order(conn, &order)?;

                for item in &before_items {
                    if item.status == ItemStatus::Cancelled || item.status == item_status {
                        continue;
                    }
                    let mut item = item.clone();
                    item.status = item_status;
                    item.updated_at = now;
                    db::put_item(conn, &item)?;
                }
                Ok(())
            })?;

        self.finish_mutation(
            order_id,
            QueueAction::SetOrderStatus { status: new_status },
            &before_order,
            &before_items,
        )
        .await
    }

    // -----------------------------------------------------------------
    // Item-level transitions
    // -----------------------------------------------------------------

    /// Fire held/pending items into the active work queue.
    pub async fn fire_items(&self, order_id: &str, item_ids: &[String]) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let now = Utc::now();

        let targets = transition_targets(&before_items, item_ids, ItemStatus::InProgress);
        if targets.is_empty() {
            return Ok(());
        }

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                for mut item in targets.iter().cloned() {
                    item.status = ItemStatus::InProgress;
                    item.fired_at = Some(now);
                    item.updated_at = now;
                    db::put_item(conn, &item)?;
                }
                let mut order = before_order.clone();
                if matches!(order.status, OrderStatus::Pending | OrderStatus::New) {
                    order.status = OrderStatus::InProgress;
                }
                order.pending_sync = true;
                order.updated_at = now;
                db::put_order(conn, &order)?;
                Ok(())
            })?;

        let ids: Vec<String> = targets.iter().map(|i| i.id.clone()).collect();
        self.finish_mutation(
            order_id,
            QueueAction::FireItems { item_ids: ids },
            &before_order,
            &before_items,
        )
        .await
    }

    /// Move in-progress items to ready. When every non-cancelled item of
    /// the order is done, stamps `ready_at` and fires the ready event for
    /// the customer-notification collaborator.
    pub async fn mark_items_ready(
        &self,
        order_id: &str,
        item_ids: &[String],
    ) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let now = Utc::now();

        let targets = transition_targets(&before_items, item_ids, ItemStatus::Ready);
        if targets.is_empty() {
            return Ok(());
        }
        let target_ids: Vec<String> = targets.iter().map(|i| i.id.clone()).collect();

        let all_done = before_items
            .iter()
            .filter(|i| i.status != ItemStatus::Cancelled)
            .all(|i| i.status.is_done() || target_ids.contains(&i.id));

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                for mut item in targets.iter().cloned() {
                    item.status = ItemStatus::Ready;
                    item.early_delivered = false;
                    item.updated_at = now;
                    db::put_item(conn, &item)?;
                }
                let mut order = before_order.clone();
                if all_done {
                    order.status = OrderStatus::Ready;
                    order.ready_at = Some(now);
                }
                order.pending_sync = true;
                order.updated_at = now;
                db::put_order(conn, &order)?;
                Ok(())
            })?;

        if all_done {
            self.notify_ready(order_id);
        }
        self.record_last_action(order_id, &target_ids, ItemStatus::InProgress, ItemStatus::Ready);

        self.finish_mutation(
            order_id,
            QueueAction::MarkItemsReady {
                item_ids: target_ids,
            },
            &before_order,
            &before_items,
        )
        .await
    }

    /// Complete a ready item set. `keep_order_open` says whether the
    /// parent order stays open because other course stages are still
    /// running; the server performs the same bookkeeping on its side.
    pub async fn complete_items(
        &self,
        order_id: &str,
        item_ids: &[String],
        keep_order_open: bool,
    ) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let now = Utc::now();

        let targets = transition_targets(&before_items, item_ids, ItemStatus::Completed);
        if targets.is_empty() {
            return Ok(());
        }
        let target_ids: Vec<String> = targets.iter().map(|i| i.id.clone()).collect();

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                for mut item in targets.iter().cloned() {
                    item.status = ItemStatus::Completed;
                    item.updated_at = now;
                    db::put_item(conn, &item)?;
                }
                let mut order = before_order.clone();
                if !keep_order_open {
                    order.status = OrderStatus::Delivered;
                }
                order.pending_sync = true;
                order.updated_at = now;
                db::put_order(conn, &order)?;
                Ok(())
            })?;

        self.record_last_action(order_id, &target_ids, ItemStatus::Ready, ItemStatus::Completed);

        self.finish_mutation(
            order_id,
            QueueAction::CompleteOrderPart {
                item_ids: target_ids,
                keep_order_open,
            },
            &before_order,
            &before_items,
        )
        .await
    }

    /// Cancel one item. Terminal: the item disappears from every card and
    /// from monetary totals.
    pub async fn cancel_item(&self, order_id: &str, item_id: &str) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let Some(item) = before_items.iter().find(|i| i.id == item_id) else {
            return Ok(());
        };
        if !item.status.can_transition(ItemStatus::Cancelled) {
            return Err(SyncError::Validation(format!(
                "cannot cancel item in state {}",
                item.status.as_str()
            )));
        }

        let now = Utc::now();
        let mut cancelled = item.clone();
        cancelled.status = ItemStatus::Cancelled;
        cancelled.updated_at = now;

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                db::put_item(conn, &cancelled)?;
                let mut order = before_order.clone();
                order.pending_sync = true;
                order.updated_at = now;
                db::put_order(conn, &order)?;
                Ok(())
            })?;

        let record = serde_json::to_value(&cancelled)?;
        self.finish_mutation_on_table(
            "order_items",
            order_id,
            item_id,
            QueueAction::UpsertRecord { record },
            &before_order,
            &before_items,
        )
        .await
    }

    /// Reverse the last ready/complete action, touching only the item-id
    /// set captured when that action ran. Items added to the same stage
    /// afterwards are deliberately unaffected. Returns whether anything
    /// was undone.
    pub async fn undo_last_action(&self) -> Result<bool, SyncError> {
        let action = self
            .last_action
            .lock()
            .map_err(|_| SyncError::Internal("last action mutex poisoned".into()))?
            .take();
        let Some(action) = action else {
            return Ok(false);
        };

        match (action.from, action.to) {
            (ItemStatus::InProgress, ItemStatus::Ready) => {
                self.revert_items(&action.order_id, &action.item_ids, ItemStatus::InProgress)
                    .await?;
            }
            (ItemStatus::Ready, ItemStatus::Completed) => {
                self.revert_items(&action.order_id, &action.item_ids, ItemStatus::Ready)
                    .await?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Targeted reversal (ready → in_progress, or completed → ready) of an
    /// exact item-id set — never the whole order, so unrelated staged
    /// items are not resurrected.
    async fn revert_items(
        &self,
        order_id: &str,
        item_ids: &[String],
        to: ItemStatus,
    ) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        let now = Utc::now();

        let targets = transition_targets(&before_items, item_ids, to);
        if targets.is_empty() {
            return Ok(());
        }
        let target_ids: Vec<String> = targets.iter().map(|i| i.id.clone()).collect();

        self.db
            .with_transaction(&["orders", "order_items"], |conn| {
                for mut item in targets.iter().cloned() {
                    item.status = to;
                    item.updated_at = now;
                    db::put_item(conn, &item)?;
                }
                let mut order = before_order.clone();
                order.status = match to {
                    ItemStatus::InProgress => OrderStatus::InProgress,
                    _ => OrderStatus::Ready,
                };
                order.pending_sync = true;
                order.updated_at = now;
                db::put_order(conn, &order)?;
                Ok(())
            })?;

        // The reversal maps onto the same explicit status-set procedures
        // as the forward path, so replay stays idempotent.
        let action = match to {
            ItemStatus::InProgress => QueueAction::FireItems {
                item_ids: target_ids,
            },
            _ => QueueAction::MarkItemsReady {
                item_ids: target_ids,
            },
        };
        self.finish_mutation(order_id, action, &before_order, &before_items)
            .await
    }

    /// Record staff acknowledgment of a new order.
    pub async fn mark_seen(&self, order_id: &str) -> Result<(), SyncError> {
        let (before_order, before_items) = self.load_order(order_id)?;
        if before_order.seen_at.is_some() {
            return Ok(());
        }
        let now = Utc::now();
        let mut order = before_order.clone();
        order.seen_at = Some(now);
        order.updated_at = now;
        order.pending_sync = true;
        self.db.put_order(&order)?;

        let record = serde_json::to_value(&order)?;
        self.finish_mutation_on_table(
            "orders",
            order_id,
            order_id,
            QueueAction::UpsertRecord { record },
            &before_order,
            &before_items,
        )
        .await
    }

    // -----------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------

    fn load_order(&self, order_id: &str) -> Result<(Order, Vec<OrderItem>), SyncError> {
        let Some(order) = self.db.get_order(order_id)? else {
            return Err(SyncError::Internal(format!("unknown order: {order_id}")));
        };
        let items = self.db.items_for_order(order_id)?;
        Ok((order, items))
    }

    fn record_last_action(
        &self,
        order_id: &str,
        item_ids: &[String],
        from: ItemStatus,
        to: ItemStatus,
    ) {
        if let Ok(mut slot) = self.last_action.lock() {
            *slot = Some(LastAction {
                order_id: order_id.to_string(),
                item_ids: item_ids.to_vec(),
                from,
                to,
            });
        }
    }

    fn enqueue_action(&self, record_id: &str, action: QueueAction) -> Result<(), SyncError> {
        self.enqueue_action_on_table("orders", record_id, action)
    }

    fn enqueue_action_on_table(
        &self,
        table: &str,
        record_id: &str,
        action: QueueAction,
    ) -> Result<(), SyncError> {
        self.queue.enqueue(table, record_id, &action)?;
        let pending = self.queue.pending_count()?;
        self.set_status(|s| s.pending_actions = pending);
        Ok(())
    }

    async fn finish_mutation(
        &self,
        order_id: &str,
        action: QueueAction,
        before_order: &Order,
        before_items: &[OrderItem],
    ) -> Result<(), SyncError> {
        self.finish_mutation_on_table(
            "orders",
            order_id,
            order_id,
            action,
            before_order,
            before_items,
        )
        .await
    }

    /// Remote half of a mutation: direct call when online, queue entry
    /// otherwise; revert to `before_*` on a permanent rejection.
    async fn finish_mutation_on_table(
        &self,
        table: &str,
        order_id: &str,
        record_id: &str,
        action: QueueAction,
        before_order: &Order,
        before_items: &[OrderItem],
    ) -> Result<(), SyncError> {
        if !self.is_online() {
            return self.enqueue_action_on_table(table, record_id, action);
        }

        match send_action(self.remote.as_ref(), table, record_id, &action).await {
            Ok(()) => self.confirm_order(order_id),
            Err(e) if e.is_permanent() => {
                warn!(order_id, error = %e, "Mutation rejected, reverting optimistic state");
                self.db
                    .with_transaction(&["orders", "order_items"], |conn| {
                        db::put_order(conn, before_order)?;
                        for item in before_items {
                            db::put_item(conn, item)?;
                        }
                        Ok(())
                    })?;
                Err(e)
            }
            Err(e) => {
                warn!(order_id, error = %e, "Mutation deferred to offline queue");
                self.enqueue_action_on_table(table, record_id, action)?;
                Ok(())
            }
        }
    }

    /// Clear the pending flag and arm the anti-jump guard after a
    /// confirmed remote write.
    fn confirm_order(&self, order_id: &str) -> Result<(), SyncError> {
        self.db.with_transaction(&["orders"], |conn| {
            conn.execute(
                "UPDATE orders SET pending_sync = 0 WHERE id = ?1",
                params![order_id],
            )?;
            Ok(())
        })?;
        self.guard.arm(order_id);
        Ok(())
    }
}

/// Items from `item_ids` whose current state allows the transition.
fn transition_targets(
    items: &[OrderItem],
    item_ids: &[String],
    to: ItemStatus,
) -> Vec<OrderItem> {
    items
        .iter()
        .filter(|i| item_ids.contains(&i.id) && i.status.can_transition(to))
        .cloned()
        .collect()
}

/// Item status cascaded by a coarse order-status write.
fn cascade_item_status(status: OrderStatus) -> ItemStatus {
    match status {
        OrderStatus::Pending => ItemStatus::Pending,
        OrderStatus::New => ItemStatus::New,
        OrderStatus::Ready => ItemStatus::Ready,
        OrderStatus::Delivered => ItemStatus::Completed,
        OrderStatus::Cancelled => ItemStatus::Cancelled,
        OrderStatus::InProgress | OrderStatus::Shipped => ItemStatus::InProgress,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{build_cards, CardType};
    use crate::config::SyncConfig;
    use crate::db::CacheDb;
    use crate::models::OrderKind;
    use crate::remote::testing::MockRemote;
    use crate::sync::SyncOrchestrator;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn orchestrator(
        remote: Arc<MockRemote>,
        online: bool,
    ) -> (Arc<SyncOrchestrator>, watch::Sender<bool>) {
        let db = Arc::new(CacheDb::open_in_memory().unwrap());
        let (tx, rx) = watch::channel(online);
        let orch = SyncOrchestrator::new(db, remote, rx, SyncConfig::default());
        (orch, tx)
    }

    fn three_item_order(id: &str) -> (Order, Vec<OrderItem>) {
        let mut order = Order::new_local("biz-1", OrderKind::DineIn);
        order.id = id.to_string();
        let items = (1..=3)
            .map(|n| {
                let mut item = OrderItem::new_local(id);
                item.id = format!("{id}-i{n}");
                item.price = 10.0;
                item
            })
            .collect();
        (order, items)
    }

    fn card_types(orch: &SyncOrchestrator, order_id: &str) -> Vec<CardType> {
        let order = orch.cache().get_order(order_id).unwrap().unwrap();
        let items = orch.cache().items_for_order(order_id).unwrap();
        build_cards(&order, &items)
            .into_iter()
            .map(|c| c.card_type)
            .collect()
    }

    #[tokio::test]
    async fn test_create_order_fires_stage_one_and_holds_later_stages() {
        // An order with pending items: stage 1 fires on creation, the
        // derived card is active.
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote.clone(), true);
        let (order, mut items) = three_item_order("ord-1");
        items[2].course_stage = 2;

        orch.create_order(order, items).await.unwrap();

        let loaded = orch.cache().items_for_order("ord-1").unwrap();
        assert_eq!(loaded[0].status, ItemStatus::InProgress);
        assert!(loaded[0].fired_at.is_some());
        assert_eq!(loaded[1].status, ItemStatus::InProgress);
        assert_eq!(loaded[2].status, ItemStatus::Held, "stage 2 starts held");

        let types = card_types(&orch, "ord-1");
        assert!(types.contains(&CardType::Active));
        assert!(types.contains(&CardType::Delayed));

        // Confirmed submit: flag cleared, guard armed.
        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert!(!order.pending_sync);
        assert!(orch.guard.is_active("ord-1"));
    }

    #[tokio::test]
    async fn test_fire_all_items_yields_single_active_card() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        let types = card_types(&orch, "ord-1");
        assert_eq!(types, vec![CardType::Active]);
    }

    #[tokio::test]
    async fn test_partial_ready_splits_cards() {
        // Two of three items marked ready: remaining active card plus a
        // ready card holding the two.
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        orch.mark_items_ready("ord-1", &["ord-1-i1".into(), "ord-1-i2".into()])
            .await
            .unwrap();

        let items = orch.cache().items_for_order("ord-1").unwrap();
        assert_eq!(items[0].status, ItemStatus::Ready);
        assert_eq!(items[1].status, ItemStatus::Ready);
        assert_eq!(items[2].status, ItemStatus::InProgress);

        let types = card_types(&orch, "ord-1");
        assert_eq!(types.len(), 2);
        assert!(types.contains(&CardType::Ready));
        assert!(types.contains(&CardType::Active));

        // Not all items done: no ready_at on the order yet.
        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert!(order.ready_at.is_none());
    }

    #[tokio::test]
    async fn test_all_ready_stamps_order_and_notifies() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let mut ready_rx = orch.subscribe_ready_events();
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        let ids: Vec<String> = (1..=3).map(|n| format!("ord-1-i{n}")).collect();
        orch.mark_items_ready("ord-1", &ids).await.unwrap();

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert!(order.ready_at.is_some());
        assert_eq!(ready_rx.try_recv().unwrap(), "ord-1");
    }

    #[tokio::test]
    async fn test_offline_mutation_queues_and_drains_on_reconnect() {
        // Offline status change queues one entry; on reconnect the drain
        // pushes it, clears the flag, and arms the guard.
        let remote = Arc::new(MockRemote::default());
        let (orch, net) = orchestrator(remote.clone(), false);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();
        assert_eq!(orch.queue().pending_count().unwrap(), 1, "submit queued");

        orch.update_status("ord-1", OrderStatus::Ready).await.unwrap();
        assert_eq!(orch.queue().pending_count().unwrap(), 2);
        assert!(orch.cache().get_order("ord-1").unwrap().unwrap().pending_sync);
        assert!(remote.calls().is_empty(), "nothing sent while offline");

        net.send(true).unwrap();
        let report = orch.drain().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(
            remote.statuses.lock().unwrap().get("ord-1"),
            Some(&OrderStatus::Ready)
        );
        assert!(!orch.cache().get_order("ord-1").unwrap().unwrap().pending_sync);
        assert!(orch.guard.is_active("ord-1"));
    }

    #[tokio::test]
    async fn test_permanent_rejection_reverts_optimistic_state() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote.clone(), true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        remote.fail(|| SyncError::Validation("branch access denied".into()));
        let result = orch.update_status("ord-1", OrderStatus::Ready).await;
        assert!(result.is_err());

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::InProgress, "status reverted");
        assert!(!order.pending_sync, "no ambiguous pending state left behind");
        let items = orch.cache().items_for_order("ord-1").unwrap();
        assert!(items.iter().all(|i| i.status == ItemStatus::InProgress));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_optimistic_state_and_queues() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote.clone(), true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        remote.fail(|| SyncError::Network("connection refused".into()));
        orch.update_status("ord-1", OrderStatus::Ready).await.unwrap();

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Ready, "optimistic state kept");
        assert!(order.pending_sync, "clearly flagged for later replay");
        assert_eq!(orch.queue().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undo_reverts_only_captured_item_set() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        // Mark two items ready, capturing that set for undo.
        orch.mark_items_ready("ord-1", &["ord-1-i1".into(), "ord-1-i2".into()])
            .await
            .unwrap();
        // A third item reaches ready afterwards, outside the captured set.
        orch.mark_items_ready("ord-1", &["ord-1-i3".into()])
            .await
            .unwrap();

        // Undo the latest action: only i3 goes back to in_progress.
        assert!(orch.undo_last_action().await.unwrap());
        let items = orch.cache().items_for_order("ord-1").unwrap();
        let status_of = |id: &str| {
            items
                .iter()
                .find(|i| i.id == id)
                .map(|i| i.status)
                .unwrap()
        };
        assert_eq!(status_of("ord-1-i1"), ItemStatus::Ready);
        assert_eq!(status_of("ord-1-i2"), ItemStatus::Ready);
        assert_eq!(status_of("ord-1-i3"), ItemStatus::InProgress);

        // Nothing left to undo.
        assert!(!orch.undo_last_action().await.unwrap());
    }

    #[tokio::test]
    async fn test_undo_completed_returns_items_to_ready() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        let ids: Vec<String> = (1..=3).map(|n| format!("ord-1-i{n}")).collect();
        orch.mark_items_ready("ord-1", &ids).await.unwrap();
        orch.complete_items("ord-1", &ids, false).await.unwrap();

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);

        assert!(orch.undo_last_action().await.unwrap());
        let items = orch.cache().items_for_order("ord-1").unwrap();
        assert!(items.iter().all(|i| i.status == ItemStatus::Ready));
        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
    }

    #[tokio::test]
    async fn test_complete_with_keep_open_leaves_order_open() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote.clone(), true);
        let (order, mut items) = three_item_order("ord-1");
        items[2].course_stage = 2;
        orch.create_order(order, items).await.unwrap();

        orch.mark_items_ready("ord-1", &["ord-1-i1".into(), "ord-1-i2".into()])
            .await
            .unwrap();
        orch.complete_items(
            "ord-1",
            &["ord-1-i1".into(), "ord-1-i2".into()],
            true, // stage 2 still held
        )
        .await
        .unwrap();

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        assert_ne!(order.status, OrderStatus::Delivered, "order stays open");
        assert!(remote
            .calls()
            .iter()
            .any(|c| c.starts_with("complete:ord-1:") && c.ends_with(":true")));
    }

    #[tokio::test]
    async fn test_cancelled_item_leaves_cards_and_totals() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote, true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();

        orch.cancel_item("ord-1", "ord-1-i1").await.unwrap();

        let order = orch.cache().get_order("ord-1").unwrap().unwrap();
        let items = orch.cache().items_for_order("ord-1").unwrap();
        let cards = build_cards(&order, &items);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].items.len(), 2);
        assert_eq!(cards[0].total(), 20.0);
    }

    #[tokio::test]
    async fn test_fire_skips_invalid_transitions() {
        let remote = Arc::new(MockRemote::default());
        let (orch, _net) = orchestrator(remote.clone(), true);
        let (order, items) = three_item_order("ord-1");
        orch.create_order(order, items).await.unwrap();
        let ids: Vec<String> = (1..=3).map(|n| format!("ord-1-i{n}")).collect();
        orch.mark_items_ready("ord-1", &ids).await.unwrap();
        orch.complete_items("ord-1", &ids, false).await.unwrap();

        // Completed items cannot be fired; the call is a no-op.
        let calls_before = remote.calls().len();
        orch.fire_items("ord-1", &ids).await.unwrap();
        assert_eq!(remote.calls().len(), calls_before);
    }
}
