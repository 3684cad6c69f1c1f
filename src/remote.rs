//! Collaborator interfaces to the authoritative remote store.
//!
//! The transport itself is out of scope; the engine only assumes a
//! request/response call surface plus a publish/subscribe change feed and
//! a connectivity signal. [`crate::api::HttpRemote`] is the reference
//! implementation; tests substitute mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::SyncError;
use crate::models::{ChangeEvent, Order, OrderItem, OrderStatus};

/// Filter for paginated bulk reads.
#[derive(Debug, Clone, Default)]
pub struct FetchFilter {
    pub business_id: Option<String>,
    /// Rows created at or after this instant (windowed tables).
    pub since: Option<DateTime<Utc>>,
}

/// Request/response surface of the remote authoritative store.
///
/// Named procedures (`fire_items`, `complete_order_part`, …) encapsulate
/// server-side invariants — payment and course-stage bookkeeping stay on
/// the server, the client never reimplements them. Every call is a
/// full-state upsert or an explicit status-set so that replaying a queued
/// mutation twice cannot corrupt remote state.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Paginated bulk read of one table.
    async fn fetch(
        &self,
        table: &str,
        filter: &FetchFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, SyncError>;

    /// Full-record upsert of a reference-table document.
    async fn upsert(&self, table: &str, id: &str, record: &Value) -> Result<(), SyncError>;

    /// Remove a record outright.
    async fn delete(&self, table: &str, id: &str) -> Result<(), SyncError>;

    /// Submit a (possibly offline-created) order with its items.
    async fn submit_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), SyncError>;

    /// Explicit coarse status set, cascading to items server-side.
    async fn set_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), SyncError>;

    async fn fire_items(&self, order_id: &str, item_ids: &[String]) -> Result<(), SyncError>;

    async fn mark_items_ready(&self, order_id: &str, item_ids: &[String])
        -> Result<(), SyncError>;

    async fn complete_order_part(
        &self,
        order_id: &str,
        item_ids: &[String],
        keep_order_open: bool,
    ) -> Result<(), SyncError>;
}

/// Live change feed. Implementations push [`ChangeEvent`]s into a
/// broadcast channel; the orchestrator consumes them in a dedicated task.
/// Arrival order is not guaranteed to match remote commit order — the
/// conflict resolver's timestamp check is what makes the merge safe.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Boolean "online" observable. Pull and push are gated on it; the
/// offline→online transition triggers a queue drain.
pub type ConnectivitySignal = watch::Receiver<bool>;

/// Feed backed by a plain broadcast channel. Useful as a building block
/// for transports and as the test double.
pub struct ChannelFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Inject an event, e.g. from a websocket read loop.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }
}

impl ChangeFeed for ChannelFeed {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

/// Shared remote double for the queue, sync, and kitchen tests: records
/// calls, serves canned fetch pages, keeps a status map as "remote state",
/// and fails on demand.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockRemote {
        calls: Mutex<Vec<String>>,
        rows: Mutex<HashMap<String, Vec<Value>>>,
        pub(crate) statuses: Mutex<HashMap<String, OrderStatus>>,
        fail_with: Mutex<Option<fn() -> SyncError>>,
        fetch_calls: AtomicUsize,
    }

    impl MockRemote {
        pub(crate) fn set_rows(&self, table: &str, rows: Vec<Value>) {
            self.rows.lock().unwrap().insert(table.to_string(), rows);
        }

        pub(crate) fn fail(&self, f: fn() -> SyncError) {
            *self.fail_with.lock().unwrap() = Some(f);
        }

        pub(crate) fn succeed(&self) {
            *self.fail_with.lock().unwrap() = None;
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn fetch_count(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), SyncError> {
            match *self.fail_with.lock().unwrap() {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn fetch(
            &self,
            table: &str,
            _filter: &FetchFilter,
            offset: usize,
            _limit: usize,
        ) -> Result<Vec<Value>, SyncError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.record(format!("fetch:{table}:{offset}"));
            if offset > 0 {
                return Ok(Vec::new());
            }
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default())
        }

        async fn upsert(&self, table: &str, id: &str, _record: &Value) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("upsert:{table}:{id}"));
            Ok(())
        }

        async fn delete(&self, table: &str, id: &str) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("delete:{table}:{id}"));
            Ok(())
        }

        async fn submit_order(&self, order: &Order, _items: &[OrderItem]) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("submit:{}", order.id));
            self.statuses
                .lock()
                .unwrap()
                .insert(order.id.clone(), order.status);
            Ok(())
        }

        async fn set_order_status(
            &self,
            order_id: &str,
            status: OrderStatus,
        ) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("status:{order_id}:{}", status.as_str()));
            self.statuses
                .lock()
                .unwrap()
                .insert(order_id.to_string(), status);
            Ok(())
        }

        async fn fire_items(&self, order_id: &str, item_ids: &[String]) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("fire:{order_id}:{}", item_ids.join(",")));
            Ok(())
        }

        async fn mark_items_ready(
            &self,
            order_id: &str,
            item_ids: &[String],
        ) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!("ready:{order_id}:{}", item_ids.join(",")));
            Ok(())
        }

        async fn complete_order_part(
            &self,
            order_id: &str,
            item_ids: &[String],
            keep_order_open: bool,
        ) -> Result<(), SyncError> {
            self.check()?;
            self.record(format!(
                "complete:{order_id}:{}:{keep_order_open}",
                item_ids.join(",")
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_feed_delivers_events() {
        let feed = ChannelFeed::new(8);
        let mut rx = feed.subscribe();
        feed.publish(ChangeEvent {
            kind: ChangeKind::Update,
            table: "orders".into(),
            record: json!({ "id": "ord-1" }),
        });
        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.table, "orders");
    }
}
