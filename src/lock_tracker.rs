//! Detects crashed remote lock holders via a repeated-conflict heuristic (spec §4.6, C6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::types::ExecutionStats;

const STALE_ENTRY_MAX_AGE_MS: u64 = 60_000;
const RECOVERY_MIN_COUNT: u32 = 3;
const RECOVERY_MIN_AGE_MS: u64 = 20_000;

struct ConflictRecord {
    first_seen_ms: u64,
    count: u32,
}

/// Per-opportunity conflict tracking for one distributed lock namespace (a chain).
pub struct LockTracker {
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, ConflictRecord>>,
}

impl LockTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Records a "lock not acquired" conflict for `opportunity_id` and returns `true`
    /// if crash-recovery should trigger: `count >= 3` and `now - first_seen >= 20s`.
    /// 20s comfortably exceeds expected execution time while staying well below a
    /// typical lock TTL (e.g. 120s), bounding ghost-lock duration without racing
    /// legitimate long-running holders.
    pub fn record_conflict(&self, opportunity_id: &str, stats: &ExecutionStats) -> bool {
        stats.incr_lock_conflicts();
        let now = self.clock.now_ms();
        let mut guard = self.records.lock().unwrap();
        let record = guard.entry(opportunity_id.to_string()).or_insert(ConflictRecord {
            first_seen_ms: now,
            count: 0,
        });
        record.count += 1;

        let should_recover = record.count >= RECOVERY_MIN_COUNT
            && now.saturating_sub(record.first_seen_ms) >= RECOVERY_MIN_AGE_MS;

        if should_recover {
            guard.remove(opportunity_id);
            stats.incr_stale_lock_recoveries();
            tracing::warn!(opportunity_id, "stale distributed lock recovered");
        }
        should_recover
    }

    pub fn clear_on_success(&self, opportunity_id: &str) {
        self.records.lock().unwrap().remove(opportunity_id);
    }

    /// Drops entries older than 60s; run by the health monitor (spec §4.14).
    pub fn cleanup(&self) {
        let now = self.clock.now_ms();
        let mut guard = self.records.lock().unwrap();
        guard.retain(|_, record| now.saturating_sub(record.first_seen_ms) < STALE_ENTRY_MAX_AGE_MS);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn recovers_after_three_conflicts_spaced_past_the_age_floor() {
        let clock = ManualClock::new(0);
        let tracker = LockTracker::new(clock.clone());
        let stats = ExecutionStats::default();

        assert!(!tracker.record_conflict("op-1", &stats));
        clock.advance(10_000);
        assert!(!tracker.record_conflict("op-1", &stats));
        clock.advance(10_000); // total age 20_000ms, count 3
        assert!(tracker.record_conflict("op-1", &stats));
        assert_eq!(stats.stale_lock_recoveries(), 1);
    }

    #[test]
    fn no_recovery_below_age_floor_even_with_enough_conflicts() {
        let clock = ManualClock::new(0);
        let tracker = LockTracker::new(clock.clone());
        let stats = ExecutionStats::default();

        assert!(!tracker.record_conflict("op-1", &stats));
        clock.advance(1_000);
        assert!(!tracker.record_conflict("op-1", &stats));
        clock.advance(1_000); // age only 2s
        assert!(!tracker.record_conflict("op-1", &stats));
        assert_eq!(stats.stale_lock_recoveries(), 0);
    }

    #[test]
    fn cleanup_drops_entries_past_sixty_seconds() {
        let clock = ManualClock::new(0);
        let tracker = LockTracker::new(clock.clone());
        let stats = ExecutionStats::default();
        tracker.record_conflict("op-1", &stats);
        clock.advance(60_001);
        tracker.cleanup();
        assert!(tracker.is_empty());
    }

    #[test]
    fn success_clears_tracking() {
        let clock = ManualClock::new(0);
        let tracker = LockTracker::new(clock.clone());
        let stats = ExecutionStats::default();
        tracker.record_conflict("op-1", &stats);
        tracker.clear_on_success("op-1");
        assert!(tracker.is_empty());
    }
}
