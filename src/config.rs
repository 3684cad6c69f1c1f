//! Sync engine configuration.
//!
//! All tunables live here so the orchestrator, queue, and retention policy
//! share one source of truth. Defaults match production operation; tests
//! shrink the windows to keep assertions fast.

use std::time::Duration;

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rolling window for order/item pulls. Orders older than this are not
    /// synchronized (they may still exist locally until the purge horizon).
    pub sync_window_days: i64,
    /// Hard purge horizon. Anything older is deleted outright, independent
    /// of sync state, to bound local storage growth.
    pub purge_horizon_days: i64,
    /// Interval between background sync cycles.
    pub pull_interval: Duration,
    /// Page size for paginated remote fetches.
    pub batch_size: usize,
    /// Upper bound on pages fetched per pull so one cycle stays bounded.
    pub max_pull_pages: usize,
    /// Bounded attempts for a failing pull before the degraded-sync
    /// indicator is raised.
    pub max_pull_attempts: u32,
    /// Per-record suppression window armed after a locally-confirmed write.
    pub anti_jump_window: Duration,
    /// Base delay for queue retry backoff.
    pub base_retry_delay_ms: i64,
    /// Cap for queue retry backoff.
    pub max_retry_delay_ms: i64,
    /// Attempts before a queue entry is parked as `failed`.
    pub max_queue_retries: i64,
    /// Entries examined per drain pass.
    pub drain_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_window_days: 3,
            purge_horizon_days: 60,
            pull_interval: Duration::from_secs(30),
            batch_size: 200,
            max_pull_pages: 10,
            max_pull_attempts: 4,
            anti_jump_window: Duration::from_secs(5),
            base_retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            max_queue_retries: 5,
            drain_batch: 25,
        }
    }
}
