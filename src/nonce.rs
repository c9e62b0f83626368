//! Per-chain nonce allocation mutex with an absolute deadline (spec §4.2, C2).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::errors::EngineError;

struct ChainLock {
    holder: StdMutex<Option<String>>,
    notify: Notify,
}

impl Default for ChainLock {
    fn default() -> Self {
        Self {
            holder: StdMutex::new(None),
            notify: Notify::new(),
        }
    }
}

/// Exclusive per-chain mutex keyed by chain id, with a diagnostic concurrent-access
/// detector layered on top (not used for correctness, only to surface locking bugs).
pub struct NonceAllocator {
    locks: StdMutex<HashMap<String, std::sync::Arc<ChainLock>>>,
    concurrent_access: StdMutex<HashMap<String, HashSet<String>>>,
}

impl Default for NonceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            concurrent_access: StdMutex::new(HashMap::new()),
        }
    }

    fn chain_lock(&self, chain: &str) -> std::sync::Arc<ChainLock> {
        let mut guard = self.locks.lock().unwrap();
        guard
            .entry(chain.to_string())
            .or_insert_with(|| std::sync::Arc::new(ChainLock::default()))
            .clone()
    }

    /// Waits, if necessary, for `chain`'s mutex and marks `opportunity_id` as the
    /// holder. The deadline is computed exactly once; every re-wait after a spurious
    /// wakeup re-uses it, so total wait time never exceeds `timeout_ms` (+ one
    /// scheduler tick).
    pub async fn acquire_lock(
        &self,
        chain: &str,
        opportunity_id: &str,
        timeout_ms: u64,
    ) -> Result<(), EngineError> {
        let lock = self.chain_lock(chain);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let notified = lock.notify.notified();
            {
                let mut holder = lock.holder.lock().unwrap();
                if holder.is_none() {
                    *holder = Some(opportunity_id.to_string());
                    return Ok(());
                }
            }

            tokio::select! {
                _ = notified => {
                    // Woke up because the previous holder released; loop and re-check.
                    // Another waiter may have raced in, so we may need to wait again.
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(chain, opportunity_id, timeout_ms, "WARN_NONCE_LOCK_TIMEOUT");
                    return Err(EngineError::NonceLockTimeout { timeout_ms });
                }
            }
        }
    }

    /// Releases `chain`'s lock if currently held by `opportunity_id`, and wakes all
    /// waiters so they re-contend.
    pub fn release_lock(&self, chain: &str, opportunity_id: &str) {
        let lock = self.chain_lock(chain);
        let mut holder = lock.holder.lock().unwrap();
        if holder.as_deref() == Some(opportunity_id) {
            *holder = None;
        }
        drop(holder);
        lock.notify.notify_waiters();
    }

    /// Diagnostic only: records `opportunity_id` into a per-chain set and reports
    /// whether the set was already non-empty before this call. Not used to enforce
    /// correctness, only to detect locking bugs.
    pub fn check_concurrent_access(&self, chain: &str, opportunity_id: &str) -> bool {
        let mut guard = self.concurrent_access.lock().unwrap();
        let set = guard.entry(chain.to_string()).or_default();
        let had_entries = !set.is_empty();
        set.insert(opportunity_id.to_string());
        had_entries
    }

    pub fn clear_tracking(&self, chain: &str, opportunity_id: &str) {
        let mut guard = self.concurrent_access.lock().unwrap();
        if let Some(set) = guard.get_mut(chain) {
            set.remove(opportunity_id);
        }
    }

    pub fn has_lock(&self, chain: &str) -> bool {
        let guard = self.locks.lock().unwrap();
        guard
            .get(chain)
            .map(|l| l.holder.lock().unwrap().is_some())
            .unwrap_or(false)
    }

    pub fn get_in_progress_count(&self, chain: &str) -> usize {
        let guard = self.concurrent_access.lock().unwrap();
        guard.get(chain).map(|s| s.len()).unwrap_or(0)
    }

    /// Force-clears every chain's lock, waking all waiters so they re-contend against
    /// an empty lock map. Used by crash recovery (C6) and shutdown.
    pub fn reset(&self) {
        let guard = self.locks.lock().unwrap();
        for lock in guard.values() {
            *lock.holder.lock().unwrap() = None;
            lock.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_wait() {
        let allocator = Arc::new(NonceAllocator::new());
        allocator
            .acquire_lock("ethereum", "op-A", 10_000)
            .await
            .unwrap();

        let a2 = allocator.clone();
        let waiter = tokio::spawn(async move { a2.acquire_lock("ethereum", "op-B", 50).await });

        tokio::time::advance(Duration::from_millis(51)).await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::NonceLockTimeout { timeout_ms: 50 })));
        assert!(allocator.has_lock("ethereum"));
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let allocator = Arc::new(NonceAllocator::new());
        allocator.acquire_lock("ethereum", "op-A", 1_000).await.unwrap();

        let a2 = allocator.clone();
        let waiter = tokio::spawn(async move { a2.acquire_lock("ethereum", "op-B", 1_000).await });

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        allocator.release_lock("ethereum", "op-A");

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
        assert!(allocator.has_lock("ethereum"));
    }

    #[test]
    fn concurrent_access_diagnostic() {
        let allocator = NonceAllocator::new();
        assert!(!allocator.check_concurrent_access("ethereum", "op-A"));
        assert!(allocator.check_concurrent_access("ethereum", "op-B"));
        allocator.clear_tracking("ethereum", "op-A");
        allocator.clear_tracking("ethereum", "op-B");
        assert_eq!(allocator.get_in_progress_count("ethereum"), 0);
    }

    #[test]
    fn reset_releases_all_chains() {
        let allocator = NonceAllocator::new();
        allocator.locks.lock().unwrap().insert(
            "ethereum".into(),
            Arc::new({
                let l = ChainLock::default();
                *l.holder.lock().unwrap() = Some("op-A".into());
                l
            }),
        );
        assert!(allocator.has_lock("ethereum"));
        allocator.reset();
        assert!(!allocator.has_lock("ethereum"));
    }
}
