mod breaker;
mod bridge;
mod clock;
mod commit_reveal;
mod config;
mod consumer;
mod engine;
mod errors;
mod gas;
mod health;
mod lock_tracker;
mod mev;
mod nonce;
mod providers;
mod queue;
mod risk;
mod simulation;
mod standby;
mod strategy;
mod stream;
mod types;

use std::sync::Arc;

use eyre::{eyre, Result};

use breaker::CircuitBreaker;
use clock::SystemClock;
use config::EngineConfig;
use consumer::Consumer;
use engine::Engine;
use gas::GasOptimizer;
use health::{run_periodic as run_health_periodic, HealthMonitor, HealthMonitorConfig};
use lock_tracker::LockTracker;
use nonce::NonceAllocator;
use providers::{http_rpc_factory, ProviderRegistry};
use queue::Queue;
use risk::RiskOrchestrator;
use simulation::SimulationService;
use standby::StandbyManager;
use stream::InMemoryStreams;
use strategy::StrategyRegistry;
use types::ExecutionStats;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::parse_and_validate().map_err(|err| eyre!("configuration error: {err}"))?;

    for (chain, settings) in &config.chains {
        if std::env::var(&settings.private_key_env).is_err() {
            tracing::warn!(chain, env_var = %settings.private_key_env, "no private key configured for chain; submission will fail for it");
        }
    }

    let clock = Arc::new(SystemClock);
    let stats = Arc::new(ExecutionStats::default());
    let streams = Arc::new(InMemoryStreams::default());

    let chain_urls: std::collections::HashMap<String, String> = config.chains.iter().map(|(chain, settings)| (chain.clone(), settings.url.clone())).collect();

    let health_check_interval_ms = config.providers.health_check_interval_ms;
    let providers = Arc::new(ProviderRegistry::new(config.providers, http_rpc_factory(), stats.clone()));
    providers.initialize(&chain_urls).await;
    providers.validate_connectivity().await;

    let gas = Arc::new(GasOptimizer::new(config.gas, clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(config.breaker, clock.clone(), stats.clone()));
    let nonce = Arc::new(NonceAllocator::new());
    let lock_tracker = Arc::new(LockTracker::new(clock.clone()));
    let risk = Arc::new(RiskOrchestrator::new(config.risk, stats.clone()));
    // MevShaper, BridgeFilter, and CommitReveal are available to whatever concrete
    // `Strategy` a deployment registers (spec §4.9-§4.11); none is constructed here
    // since no concrete strategy exists yet to consume it.
    let simulation = Arc::new(SimulationService::new(config.simulation, Vec::new()));
    // Concrete per-opportunity-type execution logic is out of scope; the registry
    // starts empty and strategies are registered by whatever deployment wires them in.
    let strategies = Arc::new(StrategyRegistry::new());

    let is_standby = config.standby.is_standby;

    let queue = Arc::new(Queue::new(config.queue));
    if config.standby.queue_paused_on_start {
        queue.pause();
    }

    let consumer = Arc::new(Consumer::new(config.consumer, clock.clone(), streams.clone(), streams.clone(), queue.clone(), stats.clone()));

    let standby = Arc::new(StandbyManager::new(
        config.standby,
        clock.clone(),
        providers.clone(),
        chain_urls.clone(),
        queue.clone(),
        nonce.clone(),
        streams.clone(),
        Vec::new(),
        !config.simulation_mode,
    ));

    let engine = Arc::new(Engine::new(
        queue.clone(),
        consumer.clone(),
        breaker.clone(),
        risk.clone(),
        strategies.clone(),
        simulation.clone(),
        nonce.clone(),
        lock_tracker.clone(),
        stats.clone(),
    ));

    {
        let gas = gas.clone();
        providers
            .on_provider_reconnect(Box::new(move |chain: &str| {
                gas.invalidate_chain(chain);
            }))
            .await;
    }

    let health_monitor = Arc::new(HealthMonitor::new(
        HealthMonitorConfig { service_name: config.service_name.clone(), instance_name: config.instance_id.clone() },
        clock.clone(),
        queue.clone(),
        consumer.clone(),
        gas.clone(),
        lock_tracker.clone(),
        stats.clone(),
        streams.clone(),
        chain_urls.keys().cloned().collect(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // A single dedicated task drains the queue; `Notify::notify_one` coalesces
    // bursts of item-available signals into at most one pending wakeup, so the
    // re-entrancy guard in `Engine::process_one` stays unreachable in steady
    // state instead of racing a fresh spawn per enqueue (spec §5, §9).
    let drain_notify = Arc::new(tokio::sync::Notify::new());
    {
        let drain_notify = drain_notify.clone();
        queue.on_item_available(Box::new(move || {
            drain_notify.notify_one();
        }));
    }
    let drain_task = {
        let engine = engine.clone();
        let drain_notify = drain_notify.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = drain_notify.notified() => {
                        engine.drain_queue().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let provider_health_task = {
        let providers = providers.clone();
        let chain_urls = chain_urls.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(health_check_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        providers.run_health_check_cycle(&chain_urls).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let health_task = {
        let monitor = health_monitor.clone();
        let engine = engine.clone();
        tokio::spawn(run_health_periodic(monitor, engine, 15_000, shutdown_rx.clone()))
    };

    if is_standby {
        tracing::info!("starting in standby mode");
    } else {
        standby.activate().await;
    }

    engine.start();

    let consumer_task = {
        let consumer = consumer.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            while consumer.is_running() {
                tokio::select! {
                    result = consumer.run_once() => {
                        if let Err(err) = result {
                            tracing::warn!(error = %err, "consumer read cycle failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.map_err(|err| eyre!("failed to listen for shutdown signal: {err}"))?;
    tracing::info!("shutdown signal received");

    engine.stop();
    let _ = shutdown_tx.send(true);
    drain_notify.notify_one();
    let _ = consumer_task.await;
    let _ = health_task.await;
    let _ = drain_task.await;
    let _ = provider_health_task.await;
    providers.stop().await;

    Ok(())
}
