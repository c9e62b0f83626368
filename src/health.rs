//! Periodic health publication and housekeeping, guarded against overlap
//! (spec §4.14, C14).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::clock::Clock;
use crate::consumer::Consumer;
use crate::engine::{Engine, EngineState};
use crate::gas::GasOptimizer;
use crate::lock_tracker::LockTracker;
use crate::queue::Queue;
use crate::stream::{HealthMessage, HealthSink};
use crate::types::ExecutionStats;

pub struct HealthMonitorConfig {
    pub service_name: String,
    pub instance_name: String,
}

/// Gas-history compaction bounds applied every cycle (spec §4.14).
const GAS_HISTORY_MAX_AGE_MS: u64 = 5 * 60 * 1_000;
const GAS_HISTORY_KEEP_MOST_RECENT: usize = 100;

/// Single interval, re-entrancy guarded by `reporting` so overlapping timer fires
/// (e.g. a slow publish plus the next tick) never run two cycles concurrently.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    clock: Arc<dyn Clock>,
    started_at_ms: u64,
    queue: Arc<Queue>,
    consumer: Arc<Consumer>,
    gas: Arc<GasOptimizer>,
    lock_tracker: Arc<LockTracker>,
    stats: Arc<ExecutionStats>,
    health: Arc<dyn HealthSink>,
    chains: Vec<String>,
    reporting: AtomicBool,
    last_heartbeat_ms: AtomicU64,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HealthMonitorConfig,
        clock: Arc<dyn Clock>,
        queue: Arc<Queue>,
        consumer: Arc<Consumer>,
        gas: Arc<GasOptimizer>,
        lock_tracker: Arc<LockTracker>,
        stats: Arc<ExecutionStats>,
        health: Arc<dyn HealthSink>,
        chains: Vec<String>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            config,
            clock,
            started_at_ms: now,
            queue,
            consumer,
            gas,
            lock_tracker,
            stats,
            health,
            chains,
            reporting: AtomicBool::new(false),
            last_heartbeat_ms: AtomicU64::new(now),
        }
    }

    /// Compacts gas history and lock-tracker state, then publishes a health
    /// snapshot. Skips entirely (rather than queueing) if a cycle is already
    /// in-flight.
    pub async fn run_cycle(&self, engine_state: EngineState) {
        if self.reporting.swap(true, Ordering::SeqCst) {
            tracing::debug!("health cycle already in progress; skipping");
            return;
        }

        self.gas.compact_all(GAS_HISTORY_MAX_AGE_MS, GAS_HISTORY_KEEP_MOST_RECENT);
        self.lock_tracker.cleanup();
        let evicted = self.consumer.cleanup_stale_pending_messages().await;
        if evicted > 0 {
            tracing::info!(evicted, "evicted stale deferred-ack entries");
        }

        let now = self.clock.now_ms();
        self.last_heartbeat_ms.store(now, Ordering::SeqCst);

        let status = if matches!(engine_state, EngineState::Running) { "healthy" } else { "unhealthy" };
        let message = HealthMessage {
            name: self.config.instance_name.clone(),
            service: self.config.service_name.clone(),
            status: status.to_string(),
            uptime_ms: now.saturating_sub(self.started_at_ms),
            memory_usage_bytes: 0,
            last_heartbeat_ms: now,
            event: None,
            region_id: None,
            simulation_mode: None,
            timestamp_ms: now,
            stats: Some(json!({
                "queueSize": self.queue.size(),
                "queuePaused": self.queue.is_paused(),
                "pendingMessages": self.consumer.pending_count(),
                "counters": self.stats.snapshot(),
            })),
            simulation_metrics: None,
            strategy_metrics: None,
        };

        if let Err(err) = self.health.publish(message).await {
            tracing::warn!(error = %err, "health publish failed");
        }

        self.reporting.store(false, Ordering::SeqCst);
    }

}

/// Drives `HealthMonitor::run_cycle` on a fixed interval until cancelled. Exposed
/// as a free function rather than a method so callers can hand it to whatever
/// task-spawning mechanism the binary uses.
pub async fn run_periodic(monitor: Arc<HealthMonitor>, engine: Arc<Engine>, interval_ms: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                monitor.run_cycle(engine.state()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
