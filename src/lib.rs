//! Offline-first order synchronization and state-reconciliation engine.
//!
//! Keeps a durable local cache of orders and order items on the device,
//! pulls and pushes deltas against a remote authoritative store, merges
//! live change-feed events, resolves conflicts between concurrently
//! mutated copies of the same record, and derives the kitchen/kanban card
//! views from item-level state. The device keeps working through network
//! outages; mutations made offline replay from a durable queue when
//! connectivity returns.
//!
//! Wiring order: open a [`db::CacheDb`], build a [`sync::SyncOrchestrator`]
//! with a [`remote::RemoteStore`] implementation and a connectivity watch
//! channel, run `initial_load`, then `spawn_loop` and `spawn_live_merge`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod cards;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod kitchen;
pub mod models;
pub mod queue;
pub mod remote;
pub mod retention;
pub mod sync;
pub mod views;

pub use config::SyncConfig;
pub use db::CacheDb;
pub use error::SyncError;
pub use models::{ChangeEvent, ChangeKind, ItemStatus, Order, OrderItem, OrderStatus};
pub use remote::{ChangeFeed, ConnectivitySignal, FetchFilter, RemoteStore};
pub use sync::{SyncOrchestrator, SyncStatus};

/// Initialise tracing for binaries embedding the engine. `filter` is an
/// `EnvFilter` directive, e.g. `"info,ordersync=debug"`; `RUST_LOG`
/// overrides it when set.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
