//! RPC client lifecycle, connectivity checks, automatic reconnect, and wallet
//! binding (spec §4.5, C5).
//!
//! The concrete JSON-RPC client is `ethers::providers::Provider<Http>` (the
//! teacher's stack); everything the engine needs from it is narrowed to the
//! `ChainRpc` capability trait per spec §9 so health checks, reconnection, and
//! tests don't depend on a live node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use eyre::{eyre, Result};
use tokio::sync::RwLock;

use crate::types::ExecutionStats;

/// Narrow capability interface for an EVM JSON-RPC endpoint. `Provider<Http>`
/// implements it directly below; tests substitute a fake.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_block_number(&self) -> Result<u64>;
    async fn get_fee_data(&self) -> Result<FeeData>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeeData {
    pub gas_price_wei: Option<u128>,
    pub max_fee_per_gas_wei: Option<u128>,
    pub max_priority_fee_per_gas_wei: Option<u128>,
}

#[async_trait]
impl ChainRpc for Provider<Http> {
    async fn get_block_number(&self) -> Result<u64> {
        Ok(Middleware::get_block_number(self).await?.as_u64())
    }

    async fn get_fee_data(&self) -> Result<FeeData> {
        let fee = Middleware::estimate_eip1559_fees(self, None).await;
        match fee {
            Ok((max_fee, max_priority)) => Ok(FeeData {
                gas_price_wei: None,
                max_fee_per_gas_wei: Some(max_fee.as_u128()),
                max_priority_fee_per_gas_wei: Some(max_priority.as_u128()),
            }),
            Err(_) => {
                let price = Middleware::get_gas_price(self).await?;
                Ok(FeeData {
                    gas_price_wei: Some(price.as_u128()),
                    max_fee_per_gas_wei: None,
                    max_priority_fee_per_gas_wei: None,
                })
            }
        }
    }
}

/// Signing capability, deliberately narrow: key derivation, HSM/KMS integration, and
/// concrete signing live outside this crate (spec §1's scope boundary).
pub trait Signer: Send + Sync {
    fn address(&self) -> String;
}

pub struct StaticSigner(pub String);
impl Signer for StaticSigner {
    fn address(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

struct ChainEntry {
    rpc: Arc<dyn ChainRpc>,
    signer: Option<Arc<dyn Signer>>,
    status: HealthStatus,
    consecutive_failures: u32,
}

pub type RpcFactory = Arc<dyn Fn(&str) -> Arc<dyn ChainRpc> + Send + Sync>;
pub type ReconnectCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, PartialEq)]
pub struct ProviderRegistryConfig {
    pub health_check_interval_ms: u64,
    pub reconnection_failure_threshold: u32,
    pub connectivity_timeout_ms: u64,
}

pub struct ProviderRegistry {
    config: ProviderRegistryConfig,
    chains: RwLock<HashMap<String, ChainEntry>>,
    healthy_count: AtomicUsize,
    checking: AtomicBool,
    rpc_factory: RpcFactory,
    reconnect_cb: RwLock<Option<ReconnectCallback>>,
    stats: Arc<ExecutionStats>,
}

impl ProviderRegistry {
    pub fn new(config: ProviderRegistryConfig, rpc_factory: RpcFactory, stats: Arc<ExecutionStats>) -> Self {
        Self {
            config,
            chains: RwLock::new(HashMap::new()),
            healthy_count: AtomicUsize::new(0),
            checking: AtomicBool::new(false),
            rpc_factory,
            reconnect_cb: RwLock::new(None),
            stats,
        }
    }

    pub async fn on_provider_reconnect(&self, cb: ReconnectCallback) {
        *self.reconnect_cb.write().await = Some(cb);
    }

    /// Constructs one RPC client per configured chain URL with an idempotent, initially
    /// unhealthy, health record.
    pub async fn initialize(&self, chain_urls: &HashMap<String, String>) {
        let mut guard = self.chains.write().await;
        for (chain, url) in chain_urls {
            if guard.contains_key(chain) {
                continue;
            }
            let rpc = (self.rpc_factory)(url);
            guard.insert(
                chain.clone(),
                ChainEntry {
                    rpc,
                    signer: None,
                    status: HealthStatus::Unhealthy,
                    consecutive_failures: 0,
                },
            );
        }
    }

    pub async fn register_wallet(&self, chain: &str, signer: Arc<dyn Signer>) {
        if let Some(entry) = self.chains.write().await.get_mut(chain) {
            entry.signer = Some(signer);
        }
    }

    pub async fn get_provider(&self, chain: &str) -> Option<Arc<dyn ChainRpc>> {
        self.chains.read().await.get(chain).map(|e| e.rpc.clone())
    }

    pub async fn get_wallet(&self, chain: &str) -> Option<Arc<dyn Signer>> {
        self.chains.read().await.get(chain).and_then(|e| e.signer.clone())
    }

    /// `getBlockNumber` under a bounded timeout; non-fatal on failure, only logged.
    pub async fn validate_connectivity(&self) {
        let chains: Vec<String> = self.chains.read().await.keys().cloned().collect();
        for chain in chains {
            let rpc = self.get_provider(&chain).await;
            let Some(rpc) = rpc else { continue };
            let timeout = Duration::from_millis(self.config.connectivity_timeout_ms);
            match tokio::time::timeout(timeout, rpc.get_block_number()).await {
                Ok(Ok(_)) => self.set_status(&chain, HealthStatus::Healthy).await,
                Ok(Err(err)) => {
                    tracing::warn!(chain, error = %err, "connectivity check failed");
                }
                Err(_) => {
                    tracing::warn!(chain, "connectivity check timed out");
                }
            }
        }
    }

    async fn set_status(&self, chain: &str, status: HealthStatus) {
        let mut guard = self.chains.write().await;
        if let Some(entry) = guard.get_mut(chain) {
            let was_healthy = entry.status == HealthStatus::Healthy;
            entry.status = status;
            if status == HealthStatus::Healthy {
                entry.consecutive_failures = 0;
            }
            let is_healthy = entry.status == HealthStatus::Healthy;
            drop(guard);
            if was_healthy != is_healthy {
                let delta: isize = if is_healthy { 1 } else { -1 };
                if delta > 0 {
                    self.healthy_count.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.healthy_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    pub fn get_healthy_count(&self) -> usize {
        self.healthy_count.load(Ordering::SeqCst)
    }

    pub async fn get_health_map(&self) -> HashMap<String, HealthStatus> {
        self.chains
            .read()
            .await
            .iter()
            .map(|(chain, entry)| (chain.clone(), entry.status))
            .collect()
    }

    /// One health-check cycle, guarded against re-entrancy, running per-chain checks
    /// in parallel with error isolation. On reaching the reconnection-failure
    /// threshold, recreates the RPC client, re-verifies, swaps it in atomically, and
    /// re-binds the cached signer before notifying the reconnect callback.
    pub async fn run_health_check_cycle(&self, chain_urls: &HashMap<String, String>) {
        if self.checking.swap(true, Ordering::SeqCst) {
            tracing::debug!("health check cycle already in progress; skipping");
            return;
        }
        let chains: Vec<String> = self.chains.read().await.keys().cloned().collect();
        let mut handles = Vec::new();
        for chain in chains {
            let url = chain_urls.get(&chain).cloned();
            handles.push(self.check_one_chain(chain, url));
        }
        futures::future::join_all(handles).await;
        self.checking.store(false, Ordering::SeqCst);
    }

    async fn check_one_chain(&self, chain: String, url: Option<String>) {
        let timeout = Duration::from_millis(self.config.connectivity_timeout_ms);
        let rpc = self.get_provider(&chain).await;
        let Some(rpc) = rpc else { return };

        let ok = matches!(
            tokio::time::timeout(timeout, rpc.get_block_number()).await,
            Ok(Ok(_))
        );

        if ok {
            self.set_status(&chain, HealthStatus::Healthy).await;
            return;
        }

        let should_reconnect = {
            let mut guard = self.chains.write().await;
            if let Some(entry) = guard.get_mut(&chain) {
                entry.consecutive_failures += 1;
                entry.status = HealthStatus::Unhealthy;
                entry.consecutive_failures >= self.config.reconnection_failure_threshold
            } else {
                false
            }
        };

        if should_reconnect {
            self.reconnect_chain(&chain, url).await;
        }
    }

    async fn reconnect_chain(&self, chain: &str, url: Option<String>) {
        let Some(url) = url else {
            tracing::warn!(chain, "cannot reconnect: no URL configured");
            return;
        };
        tracing::warn!(chain, "reconnecting RPC client after repeated failures");
        let new_rpc = (self.rpc_factory)(&url);

        let timeout = Duration::from_millis(self.config.connectivity_timeout_ms);
        if tokio::time::timeout(timeout, new_rpc.get_block_number()).await.is_err() {
            tracing::warn!(chain, "reconnect verification failed; keeping old client");
            return;
        }

        let cached_signer = self.get_wallet(chain).await;
        {
            let mut guard = self.chains.write().await;
            if let Some(entry) = guard.get_mut(chain) {
                entry.rpc = new_rpc;
                entry.signer = cached_signer; // never re-read from environment here
                entry.consecutive_failures = 0;
            }
        }
        self.set_status(chain, HealthStatus::Healthy).await;
        self.stats.incr_provider_reconnections();

        if let Some(cb) = self.reconnect_cb.read().await.as_ref() {
            cb(chain);
        }
        tracing::info!(chain, "RPC client reconnected");
    }

    pub async fn stop(&self) {
        // Drop all signer references; providers are dropped with the registry.
        let mut guard = self.chains.write().await;
        for entry in guard.values_mut() {
            entry.signer = None;
        }
    }
}

pub fn http_rpc_factory() -> RpcFactory {
    Arc::new(|url: &str| -> Arc<dyn ChainRpc> {
        match Provider::<Http>::try_from(url) {
            Ok(provider) => Arc::new(provider.interval(Duration::from_millis(800))),
            Err(err) => {
                tracing::error!(url, error = %err, "failed to construct RPC provider; using always-failing stub");
                Arc::new(FailingRpc)
            }
        }
    })
}

struct FailingRpc;
#[async_trait]
impl ChainRpc for FailingRpc {
    async fn get_block_number(&self) -> Result<u64> {
        Err(eyre!("provider not constructed"))
    }
    async fn get_fee_data(&self) -> Result<FeeData> {
        Err(eyre!("provider not constructed"))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::AtomicU64;

    pub struct FakeRpc {
        pub block: AtomicU64,
        pub fail: AtomicBool,
    }

    impl FakeRpc {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                block: AtomicU64::new(1),
                fail: AtomicBool::new(false),
            })
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainRpc for FakeRpc {
        async fn get_block_number(&self) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                Err(eyre!("simulated failure"))
            } else {
                Ok(self.block.load(Ordering::SeqCst))
            }
        }
        async fn get_fee_data(&self) -> Result<FeeData> {
            Ok(FeeData {
                gas_price_wei: Some(1_000_000_000),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeRpc;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reconnects_after_threshold_and_rebinds_signer() {
        // First factory call (initial client) yields a failing fake; every call
        // after that (the reconnect's fresh client) yields a healthy one, so the
        // test can observe an actual client swap rather than a same-instance recovery.
        let initial = FakeRpc::new();
        initial.fail.store(true, Ordering::SeqCst);
        let reconnected_client = FakeRpc::new();
        let call_count = Arc::new(AtomicUsize::new(0));

        let factory: RpcFactory = {
            let initial = initial.clone();
            let reconnected_client = reconnected_client.clone();
            let call_count = call_count.clone();
            Arc::new(move |_url: &str| -> Arc<dyn ChainRpc> {
                let n = call_count.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    initial.clone()
                } else {
                    reconnected_client.clone()
                }
            })
        };

        let stats = Arc::new(ExecutionStats::default());
        let registry = ProviderRegistry::new(
            ProviderRegistryConfig {
                health_check_interval_ms: 30_000,
                reconnection_failure_threshold: 3,
                connectivity_timeout_ms: 500,
            },
            factory,
            stats.clone(),
        );

        let mut urls = HashMap::new();
        urls.insert("ethereum".to_string(), "ethereum-url".to_string());
        registry.initialize(&urls).await;
        registry
            .register_wallet("ethereum", Arc::new(StaticSigner("0xabc".into())))
            .await;

        let reconnected_flag = Arc::new(AtomicBool::new(false));
        let r2 = reconnected_flag.clone();
        registry
            .on_provider_reconnect(Box::new(move |_chain| {
                r2.store(true, Ordering::SeqCst);
            }))
            .await;

        for _ in 0..3 {
            registry.run_health_check_cycle(&urls).await;
        }

        assert!(reconnected_flag.load(Ordering::SeqCst));
        assert_eq!(registry.get_healthy_count(), 1);
        assert_eq!(
            registry.get_wallet("ethereum").await.unwrap().address(),
            "0xabc"
        );
        assert_eq!(stats.provider_reconnections(), 1);
    }
}
