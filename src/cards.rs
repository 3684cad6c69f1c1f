//! Card derivation for the kitchen display and kanban board.
//!
//! A card is a UI-level aggregate of one order's items within one course
//! stage, typed active / delayed / ready. Cards are recomputed from cache
//! contents on every read — they are never stored, so there is no
//! materialized list to drift out of sync.
//!
//! Grouping rules:
//! - ready/completed items (any stage) collapse into one historical
//!   *ready* card per order;
//! - held items form a *delayed* card per course stage, excluded from the
//!   active work queue until fired;
//! - everything else still cooking forms an *active* card per stage.
//! Cancelled items never appear and never count toward totals.

use chrono::{DateTime, Utc};

use crate::models::{ItemStatus, Order, OrderItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Active,
    Delayed,
    Ready,
}

/// One displayable card.
#[derive(Debug, Clone)]
pub struct Card {
    /// Stable display id: the order id for the stage-1 active card,
    /// suffixed variants for the rest.
    pub id: String,
    pub order_id: String,
    pub order_number: Option<String>,
    pub card_type: CardType,
    /// Course stage for active/delayed cards; 0 for the ready aggregate.
    pub stage: u32,
    pub items: Vec<OrderItem>,
    /// Immutable order creation time — the queue-fairness sort key.
    pub created_at: DateTime<Utc>,
    /// Sort key for ready cards: most recent transition into ready.
    pub ready_at: Option<DateTime<Utc>>,
}

impl Card {
    /// Monetary total of the card's items. Cancelled items are filtered
    /// out before cards are built, so a plain sum is correct.
    pub fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|i| i.price * i.quantity as f64)
            .sum()
    }
}

/// Derive the cards for one order. An order may produce several cards at
/// once: one active card per stage still cooking, one delayed card per
/// held stage, and one ready aggregate.
pub fn build_cards(order: &Order, items: &[OrderItem]) -> Vec<Card> {
    let visible: Vec<&OrderItem> = items
        .iter()
        .filter(|i| i.status != ItemStatus::Cancelled)
        .collect();
    if visible.is_empty() {
        return Vec::new();
    }

    let mut cards = Vec::new();

    // Historical aggregate: everything already ready or completed.
    let done: Vec<OrderItem> = visible
        .iter()
        .filter(|i| i.status.is_done())
        .map(|i| (*i).clone())
        .collect();
    if !done.is_empty() {
        let ready_at = order.ready_at.or_else(|| {
            done.iter()
                .map(|i| i.updated_at)
                .max()
        });
        cards.push(Card {
            id: format!("{}-ready", order.id),
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            card_type: CardType::Ready,
            stage: 0,
            items: done,
            created_at: order.created_at,
            ready_at,
        });
    }

    // Stage groups for everything still in play.
    let mut stages: Vec<u32> = visible
        .iter()
        .filter(|i| !i.status.is_done())
        .map(|i| i.course_stage)
        .collect();
    stages.sort_unstable();
    stages.dedup();

    for stage in stages {
        let group: Vec<OrderItem> = visible
            .iter()
            .filter(|i| i.course_stage == stage && !i.status.is_done())
            .map(|i| (*i).clone())
            .collect();

        let has_active = group.iter().any(|i| i.status.is_active());
        let has_held = group.iter().any(|i| i.status == ItemStatus::Held);

        let card_type = if has_held && !has_active {
            CardType::Delayed
        } else {
            CardType::Active
        };

        let id = match card_type {
            CardType::Active if stage == 1 => order.id.clone(),
            CardType::Active => format!("{}-stage-{stage}", order.id),
            CardType::Delayed => format!("{}-delayed-{stage}", order.id),
            CardType::Ready => unreachable!(),
        };

        cards.push(Card {
            id,
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            card_type,
            stage,
            items: group,
            created_at: order.created_at,
            ready_at: None,
        });
    }

    cards
}

/// Sort the active work queue: delayed cards always after active ones
/// regardless of age, and within each class by the order's immutable
/// creation time — never by `updated_at` (queue fairness).
pub fn sort_queue(cards: &mut [Card]) {
    cards.sort_by(|a, b| {
        let a_delayed = a.card_type == CardType::Delayed;
        let b_delayed = b.card_type == CardType::Delayed;
        a_delayed
            .cmp(&b_delayed)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Sort ready cards most-recent-ready-first.
pub fn sort_ready(cards: &mut [Card]) {
    cards.sort_by(|a, b| {
        let a_key = a.ready_at.unwrap_or(a.created_at);
        let b_key = b.ready_at.unwrap_or(b.created_at);
        b_key.cmp(&a_key).then_with(|| a.id.cmp(&b.id))
    });
}
