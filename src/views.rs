//! Read-only derived views over the local cache.
//!
//! Everything here is a pure projection recomputed from cache contents on
//! each call — triggered by the cache's change broadcast, never
//! hand-patched. The kitchen display consumes [`current_orders`] and
//! [`completed_orders`]; the kanban board consumes [`orders_by_status`].

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cards::{self, Card, CardType};
use crate::config::SyncConfig;
use crate::db::CacheDb;
use crate::error::SyncError;
use crate::models::{Order, OrderStatus};
use crate::retention;

/// Active and delayed cards across the rolling window, fairness-sorted:
/// oldest `created_at` first, delayed cards after all active ones.
pub fn current_orders(db: &Arc<CacheDb>, cfg: &SyncConfig) -> Result<Vec<Card>, SyncError> {
    let mut current = Vec::new();
    for (order, cards) in window_cards(db, cfg)? {
        if !order.status.is_open() && !order.pending_sync {
            continue;
        }
        current.extend(
            cards
                .into_iter()
                .filter(|c| matches!(c.card_type, CardType::Active | CardType::Delayed)),
        );
    }
    cards::sort_queue(&mut current);
    Ok(current)
}

/// Ready cards across the rolling window, most-recent-ready-first.
pub fn completed_orders(db: &Arc<CacheDb>, cfg: &SyncConfig) -> Result<Vec<Card>, SyncError> {
    let mut ready = Vec::new();
    for (_, cards) in window_cards(db, cfg)? {
        ready.extend(cards.into_iter().filter(|c| c.card_type == CardType::Ready));
    }
    cards::sort_ready(&mut ready);
    Ok(ready)
}

/// Orders of the rolling window grouped by coarse status, each group in
/// creation order (kanban columns).
pub fn orders_by_status(
    db: &Arc<CacheDb>,
    cfg: &SyncConfig,
) -> Result<HashMap<OrderStatus, Vec<Order>>, SyncError> {
    let cutoff = retention::window_start(Utc::now(), cfg.sync_window_days);
    let mut grouped: HashMap<OrderStatus, Vec<Order>> = HashMap::new();
    for order in db.orders_since(cutoff)? {
        grouped.entry(order.status).or_default().push(order);
    }
    Ok(grouped)
}

fn window_cards(
    db: &Arc<CacheDb>,
    cfg: &SyncConfig,
) -> Result<Vec<(Order, Vec<Card>)>, SyncError> {
    let cutoff = retention::window_start(Utc::now(), cfg.sync_window_days);
    let mut out = Vec::new();
    for order in db.orders_since(cutoff)? {
        let items = db.items_for_order(&order.id)?;
        let cards = cards::build_cards(&order, &items);
        if !cards.is_empty() {
            out.push((order, cards));
        }
    }
    Ok(out)
}
