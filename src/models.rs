//! Canonical order and order-item representations.
//!
//! The remote store and the change feed both deliver loosely-shaped JSON
//! rows (snake_case and camelCase keys coexist in the wild). Everything
//! past this module works on the typed structs below; the `from_remote`
//! adapters are the only place ad hoc field access is allowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Coarse order lifecycle used by the kanban board.
///
/// Item-level state (below) is authoritative for the kitchen display; this
/// label is a one-way derivation written by the caller of
/// [`crate::sync::SyncOrchestrator::update_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    New,
    InProgress,
    Ready,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::New => "new",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Ready => "ready",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "new" => Some(OrderStatus::New),
            "in_progress" | "preparing" => Some(OrderStatus::InProgress),
            "ready" => Some(OrderStatus::Ready),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" | "completed" => Some(OrderStatus::Delivered),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// States that still belong on the active kanban/kitchen surfaces.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::New
                | OrderStatus::InProgress
                | OrderStatus::Ready
                | OrderStatus::Shipped
        )
    }
}

/// Fine-grained line-item lifecycle. This is the state machine the kitchen
/// display operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    New,
    /// Parked for a later course stage; excluded from the active work queue
    /// until explicitly fired.
    Held,
    InProgress,
    Ready,
    Completed,
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::New => "new",
            ItemStatus::Held => "held",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Ready => "ready",
            ItemStatus::Completed => "completed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ItemStatus::Pending),
            "new" => Some(ItemStatus::New),
            "held" => Some(ItemStatus::Held),
            "in_progress" | "prep_started" => Some(ItemStatus::InProgress),
            "ready" => Some(ItemStatus::Ready),
            "completed" => Some(ItemStatus::Completed),
            "cancelled" | "canceled" => Some(ItemStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Cancelled)
    }

    /// Item is on the kitchen's plate right now.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ItemStatus::Pending | ItemStatus::New | ItemStatus::InProgress
        )
    }

    /// Item is finished from the kitchen's point of view.
    pub fn is_done(&self) -> bool {
        matches!(self, ItemStatus::Ready | ItemStatus::Completed)
    }

    /// Valid transitions. `cancel` is representable from any non-terminal
    /// state; `undo` is the two targeted reversals and nothing else.
    pub fn can_transition(self, to: ItemStatus) -> bool {
        use ItemStatus::*;
        match (self, to) {
            // fire
            (Pending | New | Held, InProgress) => true,
            // acknowledge
            (Pending, New) => true,
            // hold for a later course
            (Pending | New, Held) => true,
            // mark ready
            (InProgress, Ready) => true,
            // complete
            (Ready, Completed) => true,
            // undo
            (Ready, InProgress) => true,
            (Completed, Ready) => true,
            // cancel from any non-terminal state
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Where a record was first created. Offline-created orders carry
/// `Local` until the submit drains; the identifier format itself carries no
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Local,
    #[default]
    Remote,
}

impl RecordOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOrigin::Local => "local",
            RecordOrigin::Remote => "remote",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("local") {
            RecordOrigin::Local
        } else {
            RecordOrigin::Remote
        }
    }
}

/// Dine-in / delivery / pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    #[default]
    DineIn,
    Delivery,
    Pickup,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::DineIn => "dine_in",
            OrderKind::Delivery => "delivery",
            OrderKind::Pickup => "pickup",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "delivery" => OrderKind::Delivery,
            "pickup" | "takeaway" => OrderKind::Pickup,
            _ => OrderKind::DineIn,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Delivery/driver sub-fields, present only for delivery orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeliveryInfo {
    pub address: Option<String>,
    pub fee: f64,
    pub notes: Option<String>,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
}

impl DeliveryInfo {
    pub fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.notes.is_none()
            && self.driver_id.is_none()
            && self.driver_name.is_none()
            && self.driver_phone.is_none()
            && self.fee == 0.0
    }
}

/// One customer transaction.
///
/// `created_at` is immutable once set and is the single source of truth
/// for queue-fairness ordering. `updated_at` is touched by every local
/// write; `server_updated_at` is assigned by the remote and used only for
/// conflict comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub business_id: String,
    pub order_number: Option<String>,
    pub status: OrderStatus,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub total_amount: f64,
    pub paid_amount: f64,
    pub is_paid: bool,
    pub kind: OrderKind,
    pub delivery: Option<DeliveryInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    /// Staff acknowledgment timestamp.
    pub seen_at: Option<DateTime<Utc>>,
    /// Unconfirmed outbound mutation exists for this record.
    pub pending_sync: bool,
    pub server_updated_at: Option<DateTime<Utc>>,
    pub origin: RecordOrigin,
}

impl Order {
    /// New locally-created order with a client-generated identifier.
    pub fn new_local(business_id: impl Into<String>, kind: OrderKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_id: business_id.into(),
            order_number: None,
            status: OrderStatus::Pending,
            customer_id: None,
            customer_name: None,
            customer_phone: None,
            total_amount: 0.0,
            paid_amount: 0.0,
            is_paid: false,
            kind,
            delivery: None,
            created_at: now,
            updated_at: now,
            ready_at: None,
            seen_at: None,
            pending_sync: true,
            server_updated_at: None,
            origin: RecordOrigin::Local,
        }
    }

    /// Build an [`Order`] from a loosely-shaped remote row. Returns `None`
    /// when the row has no usable identifier.
    pub fn from_remote(row: &Value) -> Option<Self> {
        let id = str_any(row, &["id"])?;
        let created_at = ts_any(row, &["created_at", "createdAt"]).unwrap_or_else(Utc::now);
        let updated_at = ts_any(row, &["updated_at", "updatedAt"]).unwrap_or(created_at);

        let fee = num_any(row, &["delivery_fee", "deliveryFee"]).unwrap_or(0.0);
        let delivery = DeliveryInfo {
            address: str_any(row, &["delivery_address", "deliveryAddress"]),
            fee,
            notes: str_any(row, &["delivery_notes", "deliveryNotes"]),
            driver_id: str_any(row, &["driver_id", "driverId"]),
            driver_name: str_any(row, &["driver_name", "driverName", "courier_name"]),
            driver_phone: str_any(row, &["driver_phone", "driverPhone"]),
        };

        Some(Self {
            id,
            business_id: str_any(row, &["business_id", "businessId"]).unwrap_or_default(),
            order_number: str_any(row, &["order_number", "orderNumber"]),
            status: str_any(row, &["order_status", "orderStatus", "status"])
                .and_then(|s| OrderStatus::parse(&s))
                .unwrap_or_default(),
            customer_id: str_any(row, &["customer_id", "customerId"]),
            customer_name: str_any(row, &["customer_name", "customerName"]),
            customer_phone: str_any(row, &["customer_phone", "customerPhone"]),
            total_amount: num_any(row, &["total_amount", "totalAmount"]).unwrap_or(0.0),
            paid_amount: num_any(row, &["paid_amount", "paidAmount"]).unwrap_or(0.0),
            is_paid: bool_any(row, &["is_paid", "isPaid"]).unwrap_or(false),
            kind: str_any(row, &["order_type", "orderType"])
                .map(|s| OrderKind::parse(&s))
                .unwrap_or_default(),
            delivery: if delivery.is_empty() {
                None
            } else {
                Some(delivery)
            },
            created_at,
            updated_at,
            ready_at: ts_any(row, &["ready_at", "readyAt"]),
            seen_at: ts_any(row, &["seen_at", "seenAt"]),
            // Remote rows are confirmed state by definition.
            pending_sync: false,
            server_updated_at: ts_any(row, &["server_updated_at", "updated_at", "updatedAt"]),
            origin: RecordOrigin::Remote,
        })
    }
}

/// One line item within an order. Items are exclusively owned by their
/// order; `course_stage` partitions them into independently-fired serving
/// groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub menu_item_id: Option<String>,
    pub name: Option<String>,
    pub quantity: i64,
    pub price: f64,
    /// Ordered modifier descriptors (milk type, size, …).
    pub modifiers: Vec<String>,
    pub note: Option<String>,
    pub status: ItemStatus,
    /// Serving group, 1-based. Stage 2+ items start `held`.
    pub course_stage: u32,
    /// Cosmetic flag only; never affects status or card derivation.
    pub early_delivered: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn new_local(order_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            menu_item_id: None,
            name: None,
            quantity: 1,
            price: 0.0,
            modifiers: Vec::new(),
            note: None,
            status: ItemStatus::Pending,
            course_stage: 1,
            early_delivered: false,
            fired_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Build an [`OrderItem`] from a loosely-shaped remote row.
    pub fn from_remote(row: &Value, fallback_order_id: &str) -> Option<Self> {
        let id = str_any(row, &["id"])?;
        let order_id =
            str_any(row, &["order_id", "orderId"]).unwrap_or_else(|| fallback_order_id.to_string());
        Some(Self {
            id,
            order_id,
            menu_item_id: str_any(row, &["menu_item_id", "menuItemId"]),
            name: str_any(row, &["name", "item_name"]),
            quantity: i64_any(row, &["quantity", "qty"]).unwrap_or(1),
            price: num_any(row, &["price"]).unwrap_or(0.0),
            modifiers: modifiers_any(row.get("mods").or_else(|| row.get("modifiers"))),
            note: str_any(row, &["notes", "note"]),
            status: str_any(row, &["item_status", "itemStatus", "status"])
                .and_then(|s| ItemStatus::parse(&s))
                .unwrap_or_default(),
            course_stage: i64_any(row, &["course_stage", "courseStage"])
                .filter(|v| *v >= 1)
                .unwrap_or(1) as u32,
            early_delivered: bool_any(row, &["is_early_delivered", "early_delivered"])
                .unwrap_or(false),
            fired_at: ts_any(row, &["item_fired_at", "fired_at", "firedAt"]),
            updated_at: ts_any(row, &["updated_at", "updatedAt"]).unwrap_or_else(Utc::now),
        })
    }
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// Mutation intent stored durably while the remote call is unconfirmed.
///
/// Every variant maps onto a full-state upsert or an explicit status-set on
/// the remote side so that replaying an entry twice is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueAction {
    SubmitOrder {
        order: Order,
        items: Vec<OrderItem>,
    },
    SetOrderStatus {
        status: OrderStatus,
    },
    FireItems {
        item_ids: Vec<String>,
    },
    MarkItemsReady {
        item_ids: Vec<String>,
    },
    CompleteOrderPart {
        item_ids: Vec<String>,
        keep_order_open: bool,
    },
    /// Full-record upsert of a reference-table document.
    UpsertRecord {
        record: Value,
    },
    DeleteRecord,
}

/// One durable row of the offline action queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub table: String,
    pub record_id: String,
    pub action: QueueAction,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Change feed + sync metadata
// ---------------------------------------------------------------------------

/// Kind of a live change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One event from the remote change feed. `record` is the raw remote row;
/// the live-merge path runs it through the same adapters as pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub record: Value,
}

/// Per-table pull bookkeeping. Written only by the orchestrator, read by
/// diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMeta {
    pub table: String,
    pub last_synced_at: DateTime<Utc>,
    pub record_count: i64,
}

// ---------------------------------------------------------------------------
// Loose-row helpers
// ---------------------------------------------------------------------------

pub(crate) fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn num_any(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(Value::as_f64) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn i64_any(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(Value::as_i64) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn bool_any(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::Number(n)) => return Some(n.as_i64() == Some(1)),
            Some(Value::String(s)) => {
                let normalized = s.trim().to_ascii_lowercase();
                if ["true", "1", "yes", "on"].contains(&normalized.as_str()) {
                    return Some(true);
                }
                if ["false", "0", "no", "off"].contains(&normalized.as_str()) {
                    return Some(false);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn ts_any(v: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    str_any(v, keys).and_then(|s| parse_ts(&s))
}

/// Parse an RFC3339 timestamp, tolerating a trailing offset or `Z`.
pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Modifiers arrive as an array of strings, an array of objects carrying a
/// `name` field, or a JSON-encoded string of either.
fn modifiers_any(raw: Option<&Value>) -> Vec<String> {
    fn from_array(arr: &[Value]) -> Vec<String> {
        arr.iter()
            .filter_map(|m| match m {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Object(_) => str_any(m, &["name", "text", "value_name", "valueName"]),
                _ => None,
            })
            .collect()
    }

    match raw {
        Some(Value::Array(arr)) => from_array(arr),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(arr)) => from_array(&arr),
            _ if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_status_transitions() {
        use ItemStatus::*;
        assert!(Pending.can_transition(InProgress));
        assert!(Held.can_transition(InProgress));
        assert!(InProgress.can_transition(Ready));
        assert!(Ready.can_transition(Completed));
        // undo paths
        assert!(Ready.can_transition(InProgress));
        assert!(Completed.can_transition(Ready));
        // cancel from non-terminal only
        assert!(InProgress.can_transition(Cancelled));
        assert!(!Completed.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Cancelled));
        // no skipping
        assert!(!Pending.can_transition(Ready));
        assert!(!InProgress.can_transition(Completed));
    }

    #[test]
    fn test_order_from_remote_camel_and_snake() {
        let row = json!({
            "id": "ord-1",
            "businessId": "biz-9",
            "order_status": "in_progress",
            "totalAmount": 42.5,
            "order_type": "takeaway",
            "created_at": "2026-08-01T10:00:00Z",
            "updated_at": "2026-08-01T10:05:00Z"
        });
        let order = Order::from_remote(&row).expect("adapter should accept row");
        assert_eq!(order.business_id, "biz-9");
        assert_eq!(order.status, OrderStatus::InProgress);
        assert_eq!(order.kind, OrderKind::Pickup);
        assert_eq!(order.total_amount, 42.5);
        assert!(!order.pending_sync);
        assert_eq!(order.origin, RecordOrigin::Remote);
        assert!(order.server_updated_at.is_some());
    }

    #[test]
    fn test_order_from_remote_requires_id() {
        assert!(Order::from_remote(&json!({ "total_amount": 5 })).is_none());
    }

    #[test]
    fn test_item_modifiers_parse_mixed_shapes() {
        let row = json!({
            "id": "item-1",
            "mods": [ "oat milk", { "name": "extra shot" }, 17 ],
            "item_status": "held",
            "course_stage": 2
        });
        let item = OrderItem::from_remote(&row, "ord-1").expect("adapter should accept row");
        assert_eq!(item.modifiers, vec!["oat milk", "extra shot"]);
        assert_eq!(item.status, ItemStatus::Held);
        assert_eq!(item.course_stage, 2);
        assert_eq!(item.order_id, "ord-1");
    }

    #[test]
    fn test_item_modifiers_parse_json_string() {
        let row = json!({ "id": "item-2", "mods": "[\"soy\",\"no foam\"]" });
        let item = OrderItem::from_remote(&row, "ord-1").unwrap();
        assert_eq!(item.modifiers, vec!["soy", "no foam"]);
    }

    #[test]
    fn test_queue_action_round_trips_through_json() {
        let action = QueueAction::CompleteOrderPart {
            item_ids: vec!["a".into(), "b".into()],
            keep_order_open: true,
        };
        let encoded = serde_json::to_string(&action).unwrap();
        let decoded: QueueAction = serde_json::from_str(&encoded).unwrap();
        assert_eq!(action, decoded);
    }

    #[test]
    fn test_status_parse_tolerates_aliases() {
        assert_eq!(
            OrderStatus::parse("COMPLETED"),
            Some(OrderStatus::Delivered)
        );
        assert_eq!(ItemStatus::parse("prep_started"), Some(ItemStatus::InProgress));
        assert_eq!(OrderKind::parse("takeaway"), OrderKind::Pickup);
    }
}
