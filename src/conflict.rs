//! Conflict resolution between local and incoming remote records.
//!
//! [`should_accept`] is the single decision function used by both the pull
//! and live-merge paths. The check order is load-bearing: the queue flag
//! and guard window are consulted *before* any timestamp comparison,
//! because clock skew between devices makes timestamps unreliable in the
//! seconds right after a local write.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Local-side facts the resolver needs about an existing record.
#[derive(Debug, Clone, Copy)]
pub struct ConflictSnapshot {
    pub pending_sync: bool,
    /// Timestamp of the last local write.
    pub updated_at: DateTime<Utc>,
}

impl ConflictSnapshot {
    pub fn of_order(order: &crate::models::Order) -> Self {
        Self {
            pending_sync: order.pending_sync,
            updated_at: order.updated_at,
        }
    }
}

/// Decide whether an incoming remote record may overwrite the local copy.
///
/// 1. No local record — accept.
/// 2. Outstanding offline-queue entry — reject (local intent wins until
///    confirmed).
/// 3. Record inside its anti-jump window — reject (echo of our own write).
/// 4. Local `pending_sync` and remote authoritative timestamp not strictly
///    newer than the local write — reject.
/// 5. Otherwise accept.
pub fn should_accept(
    local: Option<&ConflictSnapshot>,
    remote_updated_at: Option<DateTime<Utc>>,
    has_queued_mutation: bool,
    guard_active: bool,
) -> bool {
    let Some(local) = local else {
        return true;
    };

    if has_queued_mutation {
        return false;
    }

    if guard_active {
        return false;
    }

    if local.pending_sync {
        match remote_updated_at {
            Some(remote) if remote > local.updated_at => return true,
            _ => return false,
        }
    }

    true
}

/// Per-record suppression window preventing a device's own optimistic
/// write from being undone by the echo of that same write arriving back
/// through the live-merge channel.
///
/// One expiring entry per record id — a single global window would let an
/// unrelated record's write mask updates to everything else.
pub struct AntiJumpGuard {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl AntiJumpGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the guard for `record_id`. Called after a local mutation is
    /// confirmed remotely; re-arming extends the window.
    pub fn arm(&self, record_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(record_id.to_string(), Instant::now() + self.window);
        }
    }

    /// Whether `record_id` is currently suppressed. Expired entries are
    /// removed on the way out.
    pub fn is_active(&self, record_id: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(record_id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                entries.remove(record_id);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry. Called opportunistically from the sync
    /// loop so the map does not accumulate dead ids on a busy day.
    pub fn sweep(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let now = Instant::now();
            entries.retain(|_, expiry| *expiry > now);
        }
    }

    #[cfg(test)]
    pub(crate) fn armed_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn snapshot(pending: bool, updated_at: DateTime<Utc>) -> ConflictSnapshot {
        ConflictSnapshot {
            pending_sync: pending,
            updated_at,
        }
    }

    #[test]
    fn test_missing_local_record_is_accepted() {
        assert!(should_accept(None, None, false, false));
    }

    #[test]
    fn test_queued_mutation_takes_precedence() {
        let now = Utc::now();
        let local = snapshot(false, now);
        // Even a much newer remote row loses to an unconfirmed local intent.
        assert!(!should_accept(
            Some(&local),
            Some(now + ChronoDuration::hours(1)),
            true,
            false
        ));
    }

    #[test]
    fn test_guard_window_rejects_even_newer_timestamps() {
        let now = Utc::now();
        let local = snapshot(false, now);
        // Echo-of-self case: nominally newer remote timestamp, still dropped.
        assert!(!should_accept(
            Some(&local),
            Some(now + ChronoDuration::seconds(2)),
            false,
            true
        ));
    }

    #[test]
    fn test_pending_sync_requires_strictly_newer_remote() {
        let now = Utc::now();
        let local = snapshot(true, now);

        // Older-or-equal authoritative timestamp: rejected.
        assert!(!should_accept(Some(&local), Some(now), false, false));
        assert!(!should_accept(
            Some(&local),
            Some(now - ChronoDuration::seconds(30)),
            false,
            false
        ));
        assert!(!should_accept(Some(&local), None, false, false));

        // Strictly newer: accepted.
        assert!(should_accept(
            Some(&local),
            Some(now + ChronoDuration::seconds(1)),
            false,
            false
        ));
    }

    #[test]
    fn test_clean_local_record_is_overwritten() {
        let now = Utc::now();
        let local = snapshot(false, now);
        assert!(should_accept(
            Some(&local),
            Some(now - ChronoDuration::hours(1)),
            false,
            false
        ));
        assert!(should_accept(Some(&local), None, false, false));
    }

    #[test]
    fn test_guard_is_per_record() {
        let guard = AntiJumpGuard::new(Duration::from_secs(5));
        guard.arm("ord-1");
        assert!(guard.is_active("ord-1"));
        assert!(!guard.is_active("ord-2"));
    }

    #[test]
    fn test_guard_expires() {
        let guard = AntiJumpGuard::new(Duration::from_millis(10));
        guard.arm("ord-1");
        assert!(guard.is_active("ord-1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!guard.is_active("ord-1"));
    }

    #[test]
    fn test_sweep_drops_expired_entries() {
        let guard = AntiJumpGuard::new(Duration::from_millis(10));
        guard.arm("ord-1");
        guard.arm("ord-2");
        std::thread::sleep(Duration::from_millis(25));
        guard.sweep();
        assert_eq!(guard.armed_count(), 0);
    }
}
