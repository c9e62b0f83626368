//! Idempotent standby → active lifecycle transition (spec §4.12, C12).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::nonce::NonceAllocator;
use crate::providers::ProviderRegistry;
use crate::queue::Queue;
use crate::stream::{HealthMessage, HealthSink};
use crate::types::StandbyConfig;

/// Non-critical subsystems initialized on activation; failures here are logged and
/// do not abort activation (spec §4.12 step 2).
#[async_trait::async_trait]
pub trait NonCriticalInit: Send + Sync {
    async fn init(&self) -> eyre::Result<()>;
    fn name(&self) -> &str;
}

pub struct StandbyManager {
    config: Mutex<StandbyConfig>,
    clock: Arc<dyn Clock>,
    providers: Arc<ProviderRegistry>,
    chain_urls: HashMap<String, String>,
    queue: Arc<Queue>,
    nonce: Arc<NonceAllocator>,
    health: Arc<dyn HealthSink>,
    non_critical: Vec<Arc<dyn NonCriticalInit>>,
    activated: AtomicBool,
    activation_lock: Mutex<()>,
    simulation_enabled: AtomicBool,
}

impl StandbyManager {
    pub fn new(
        config: StandbyConfig,
        clock: Arc<dyn Clock>,
        providers: Arc<ProviderRegistry>,
        chain_urls: HashMap<String, String>,
        queue: Arc<Queue>,
        nonce: Arc<NonceAllocator>,
        health: Arc<dyn HealthSink>,
        non_critical: Vec<Arc<dyn NonCriticalInit>>,
        simulation_enabled_initially: bool,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            clock,
            providers,
            chain_urls,
            queue,
            nonce,
            health,
            non_critical,
            activated: AtomicBool::new(false),
            activation_lock: Mutex::new(()),
            simulation_enabled: AtomicBool::new(simulation_enabled_initially),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn simulation_enabled(&self) -> bool {
        self.simulation_enabled.load(Ordering::SeqCst)
    }

    /// Idempotent; concurrent callers share a single in-flight activation via the
    /// activation mutex rather than racing each other's side effects.
    pub async fn activate(&self) -> bool {
        if self.activated.load(Ordering::SeqCst) {
            return true;
        }
        let _guard = self.activation_lock.lock().await;
        if self.activated.load(Ordering::SeqCst) {
            return true;
        }

        let disables_simulation = self.config.lock().await.activation_disables_simulation;
        if disables_simulation && self.simulation_enabled.load(Ordering::SeqCst) {
            self.simulation_enabled.store(false, Ordering::SeqCst);
            tracing::info!("simulation mode disabled on standby activation");
        }

        if self.providers.get_healthy_count() == 0 {
            self.providers.initialize(&self.chain_urls).await;
            self.providers.validate_connectivity().await;

            for subsystem in &self.non_critical {
                if let Err(err) = subsystem.init().await {
                    tracing::warn!(subsystem = subsystem.name(), error = %err, "non-critical subsystem init failed during activation");
                }
            }
            self.nonce.reset();
        }

        if self.queue.is_paused() {
            self.queue.resume();
        }

        let region_id = self.config.lock().await.region_id.clone();
        let message = HealthMessage {
            name: "standby-manager".into(),
            service: "execution-engine".into(),
            status: "healthy".into(),
            uptime_ms: 0,
            memory_usage_bytes: 0,
            last_heartbeat_ms: self.clock.now_ms(),
            event: Some("standby_activated".into()),
            region_id,
            simulation_mode: Some(self.simulation_enabled.load(Ordering::SeqCst)),
            timestamp_ms: self.clock.now_ms(),
            stats: None,
            simulation_metrics: None,
            strategy_metrics: None,
        };
        if let Err(err) = self.health.publish(message).await {
            tracing::warn!(error = %err, "failed to publish standby_activated event");
        }

        self.activated.store(true, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::nonce::NonceAllocator;
    use crate::providers::{ProviderRegistry, ProviderRegistryConfig, RpcFactory};
    use crate::providers::test_support::FakeRpc;
    use crate::queue::{Queue, QueueConfig};
    use crate::stream::InMemoryStreams;
    use std::sync::atomic::AtomicUsize;

    fn providers() -> Arc<ProviderRegistry> {
        let factory: RpcFactory = Arc::new(|_url: &str| FakeRpc::new() as Arc<dyn crate::providers::ChainRpc>);
        Arc::new(ProviderRegistry::new(
            ProviderRegistryConfig { health_check_interval_ms: 30_000, reconnection_failure_threshold: 3, connectivity_timeout_ms: 500 },
            factory,
            Arc::new(crate::types::ExecutionStats::default()),
        ))
    }

    struct FailingInit;
    #[async_trait::async_trait]
    impl NonCriticalInit for FailingInit {
        async fn init(&self) -> eyre::Result<()> {
            Err(eyre::eyre!("mev init failed"))
        }
        fn name(&self) -> &str {
            "mev"
        }
    }

    #[tokio::test]
    async fn activation_is_idempotent_and_resumes_queue() {
        let queue = Arc::new(Queue::new(QueueConfig { max_size: 10, high_water_mark: 8, low_water_mark: 2 }));
        queue.pause();
        let clock = ManualClock::new(0);
        let streams = Arc::new(InMemoryStreams::default());
        let mut urls = HashMap::new();
        urls.insert("ethereum".to_string(), "url".to_string());

        let manager = StandbyManager::new(
            StandbyConfig { is_standby: true, queue_paused_on_start: true, activation_disables_simulation: true, region_id: Some("us-east".into()) },
            clock,
            providers(),
            urls,
            queue.clone(),
            Arc::new(NonceAllocator::new()),
            streams.clone(),
            vec![Arc::new(FailingInit)],
            true,
        );

        assert!(manager.activate().await);
        assert!(!queue.is_paused());
        assert!(!manager.simulation_enabled());
        assert_eq!(streams.health_messages.lock().unwrap().len(), 1);

        // second call is a no-op short-circuit, no duplicate health event
        assert!(manager.activate().await);
        assert_eq!(streams.health_messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_activations_publish_exactly_one_event() {
        let queue = Arc::new(Queue::new(QueueConfig { max_size: 10, high_water_mark: 8, low_water_mark: 2 }));
        let clock = ManualClock::new(0);
        let streams = Arc::new(InMemoryStreams::default());
        let manager = Arc::new(StandbyManager::new(
            StandbyConfig::default(),
            clock,
            providers(),
            HashMap::new(),
            queue,
            Arc::new(NonceAllocator::new()),
            streams.clone(),
            vec![],
            false,
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                if manager.activate().await {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(streams.health_messages.lock().unwrap().len(), 1);
    }
}
