//! Runner: pool ownership, instance spawning and health monitoring
//!
//! The runner owns the pool collection and the single routing strategy.
//! A periodic monitor task probes instance health, reconciles each pool's
//! live-instance count against its subscription-driven target, and reaps
//! pools that have sat without subscribers past the idle timeout. Dispatch
//! paths can also ask for an instance on demand when a held pool is empty.

pub mod pool;

use crate::manager::PluginManager;
use crate::routing::RoutingStrategy;
use crate::rpc::cache::CachedCollector;
use crate::rpc::{RoleClient, RpcClientFactory};
use crate::supervisor::ProcessSupervisor;
use mittari_core::{ControlError, PluginId, PluginKey, SubscriptionKind};
use parking_lot::Mutex;
use pool::{AvailableInstance, HealthStatus, Pool, PoolCollection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tuning for the monitor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Interval between monitor passes
    pub tick: Duration,
    /// Budget for one liveness probe; exceeding it counts as a failure
    pub probe_timeout: Duration,
    /// Consecutive probe failures before an instance is unresponsive
    pub unresponsive_after: u32,
    /// Consecutive probe failures before an instance is terminated
    pub terminate_after: u32,
    /// How long a pool may sit with zero subscribers before it is drained
    pub pool_idle_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            unresponsive_after: 3,
            terminate_after: 6,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl MonitorOptions {
    /// Set the monitor interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the per-probe budget
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the unresponsive threshold
    pub fn with_unresponsive_after(mut self, failures: u32) -> Self {
        self.unresponsive_after = failures;
        self
    }

    /// Set the termination threshold
    pub fn with_terminate_after(mut self, failures: u32) -> Self {
        self.terminate_after = failures;
        self
    }

    /// Set the idle-pool drain timeout
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }
}

/// Construction-time configuration for the runner.
pub struct RunnerConfig {
    /// Instance selection strategy; round-robin unless overridden
    pub strategy: Arc<dyn RoutingStrategy>,
    /// Global cap on live instances across all pools
    pub max_running_plugins: usize,
    /// TTL for collector response caching; zero disables the cache
    pub cache_expiration: Duration,
    /// Monitor tuning
    pub monitor: MonitorOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            strategy: Arc::new(crate::routing::RoundRobin::new()),
            max_running_plugins: 16,
            cache_expiration: Duration::from_millis(500),
            monitor: MonitorOptions::default(),
        }
    }
}

/// Owns the pools and keeps them sized and healthy.
pub struct Runner {
    pools: Arc<PoolCollection>,
    strategy: Arc<dyn RoutingStrategy>,
    manager: Arc<PluginManager>,
    factory: Arc<dyn RpcClientFactory>,
    supervisor: Arc<dyn ProcessSupervisor>,
    max_running_plugins: usize,
    cache_expiration: Duration,
    monitor_options: Mutex<MonitorOptions>,
    monitor_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    instance_seq: AtomicU64,
}

impl Runner {
    /// Build a runner over the manager and the two instance seams
    pub fn new(
        manager: Arc<PluginManager>,
        factory: Arc<dyn RpcClientFactory>,
        supervisor: Arc<dyn ProcessSupervisor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pools: Arc::new(PoolCollection::new()),
            strategy: config.strategy,
            manager,
            factory,
            supervisor,
            max_running_plugins: config.max_running_plugins,
            cache_expiration: config.cache_expiration,
            monitor_options: Mutex::new(config.monitor),
            monitor_task: Mutex::new(None),
            instance_seq: AtomicU64::new(0),
        }
    }

    /// The pool collection
    pub fn pools(&self) -> &Arc<PoolCollection> {
        &self.pools
    }

    /// The routing strategy
    pub fn strategy(&self) -> &Arc<dyn RoutingStrategy> {
        &self.strategy
    }

    /// Replace the monitor tuning; takes effect on the next pass
    pub fn set_monitor_options(&self, options: MonitorOptions) {
        *self.monitor_options.lock() = options;
    }

    /// Current monitor tuning
    pub fn monitor_options(&self) -> MonitorOptions {
        self.monitor_options.lock().clone()
    }

    /// Live (non-terminated) instances across every pool
    pub fn running_count(&self) -> usize {
        self.pools.all().iter().map(|pool| pool.live_count()).sum()
    }

    /// Start the monitor task. Idempotent.
    pub fn start(self: Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut task = self.monitor_task.lock();
        if task.is_some() {
            return;
        }
        let runner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            monitor_loop(runner, shutdown_rx).await;
        });
        *task = Some((shutdown_tx, handle));
        info!("runner started");
    }

    /// Stop the monitor and drain every pool, accumulating drain errors.
    pub async fn stop(&self) -> Vec<ControlError> {
        let task = self.monitor_task.lock().take();
        if let Some((shutdown_tx, handle)) = task {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task failed during shutdown");
            }
        }

        let mut errors = Vec::new();
        for pool in self.pools.all() {
            errors.extend(pool.drain().await);
            self.pools.remove(pool.key());
        }
        info!("runner stopped");
        errors
    }

    /// Spawn one instance into `pool`: supervisor starts the process, the
    /// factory opens the typed client, and the instance enters in
    /// `Starting`. An immediate probe promotes it to `Ready` when the
    /// plugin answers right away.
    pub async fn spawn_instance(
        &self,
        pool: &Arc<Pool>,
    ) -> Result<Arc<AvailableInstance>, ControlError> {
        let key = pool.key().clone();
        if self.running_count() >= self.max_running_plugins {
            return Err(ControlError::SpawnFailed {
                key: key.to_string(),
                reason: format!(
                    "global cap of {} running instances reached",
                    self.max_running_plugins
                ),
            });
        }

        let plugin = self.manager.get(&key)?;
        let process = self.supervisor.spawn(&plugin.spawn).await?;
        let client = match self.factory.connect(&plugin.id, &process).await {
            Ok(client) => client,
            Err(err) => {
                if let Err(kill_err) = process.kill().await {
                    warn!(plugin = %key, error = %kill_err, "kill after failed connect");
                }
                return Err(ControlError::SpawnFailed {
                    key: key.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        // collectors get the response cache in front when enabled
        let client = match client {
            RoleClient::Collector(inner) if !self.cache_expiration.is_zero() => {
                RoleClient::Collector(Arc::new(CachedCollector::new(
                    inner,
                    self.cache_expiration,
                )))
            }
            other => other,
        };

        let instance = Arc::new(AvailableInstance::new(
            self.instance_seq.fetch_add(1, Ordering::Relaxed),
            key.clone(),
            client,
            process,
        ));
        pool.add_instance(Arc::clone(&instance));

        let probe_timeout = self.monitor_options.lock().probe_timeout;
        match tokio::time::timeout(probe_timeout, instance.client().ping()).await {
            Ok(Ok(())) => {
                instance.probe_succeeded();
            }
            _ => {
                debug!(plugin = %key, instance = instance.id(), "first probe failed, instance stays starting");
            }
        }

        debug!(plugin = %key, instance = instance.id(), health = ?instance.health(), "instance spawned");
        Ok(instance)
    }

    /// Bring the pool to at least one ready instance, spawning on demand.
    /// Used by dispatch paths that hold an empty pool.
    pub async fn ensure_ready(&self, pool: &Arc<Pool>) -> Result<(), ControlError> {
        if pool.ready_count() > 0 {
            return Ok(());
        }
        let instance = self.spawn_instance(pool).await?;
        if instance.health() != HealthStatus::Ready {
            return Err(ControlError::SpawnFailed {
                key: pool.key().to_string(),
                reason: "instance failed its first health probe".to_string(),
            });
        }
        Ok(())
    }

    /// Drain the pool for `key` and remove it from the collection.
    /// A missing pool is a no-op.
    pub async fn drain_pool(&self, key: &PluginKey) -> Vec<ControlError> {
        let Some(pool) = self.pools.get(key) else {
            return Vec::new();
        };
        let errors = pool.drain().await;
        self.pools.remove(key);
        errors
    }

    /// Move every unbound subscription from older-version pools of the
    /// same role and name onto `promoted`'s pool. Returns how many tasks
    /// moved. The vacated pools shrink on subsequent monitor passes.
    pub fn migrate_unbound(&self, promoted: &PluginId) -> usize {
        let mut moved = 0;
        for pool in self.pools.all() {
            let Ok(id) = pool.key().to_id() else { continue };
            if id.role != promoted.role || id.name != promoted.name || id.version >= promoted.version
            {
                continue;
            }
            let tasks = pool.take_unbound();
            if tasks.is_empty() {
                continue;
            }
            let target = self.pools.get_or_create(&promoted.key());
            for task in tasks {
                target.subscribe(task, SubscriptionKind::Unbound);
                moved += 1;
            }
            debug!(from = %pool.key(), to = %promoted.key(), "unbound subscriptions promoted");
        }
        moved
    }

    /// One monitor pass: probe, reconcile, reap.
    async fn tick(&self) {
        let options = self.monitor_options.lock().clone();

        for pool in self.pools.all() {
            if pool.is_draining() {
                continue;
            }

            self.probe_pool(&pool, &options).await;
            self.reconcile_pool(&pool).await;

            let idle_expired = pool
                .idle_for()
                .is_some_and(|idle| idle >= options.pool_idle_timeout);
            if idle_expired && pool.holds() == 0 {
                info!(pool = %pool.key(), "draining idle pool");
                let errors = self.drain_pool(pool.key()).await;
                for error in errors {
                    warn!(pool = %pool.key(), error = %error, "error draining idle pool");
                }
            }
        }
    }

    async fn probe_pool(&self, pool: &Arc<Pool>, options: &MonitorOptions) {
        for instance in pool.instances() {
            if instance.health() == HealthStatus::Terminated {
                pool.remove_instance(instance.id());
                continue;
            }
            let probe = tokio::time::timeout(options.probe_timeout, instance.client().ping()).await;
            match probe {
                Ok(Ok(())) => {
                    instance.probe_succeeded();
                }
                _ => {
                    let failures = instance.probe_failed();
                    if failures >= options.terminate_after {
                        warn!(pool = %pool.key(), instance = instance.id(), failures, "instance terminated");
                        instance.transition(HealthStatus::Terminated);
                        if let Err(e) = instance.process().kill().await {
                            warn!(pool = %pool.key(), instance = instance.id(), error = %e, "kill failed");
                        }
                        pool.remove_instance(instance.id());
                    } else if failures >= options.unresponsive_after {
                        debug!(pool = %pool.key(), instance = instance.id(), failures, "instance unresponsive");
                        instance.transition(HealthStatus::Unresponsive);
                    }
                }
            }
        }
    }

    async fn reconcile_pool(&self, pool: &Arc<Pool>) {
        let target = pool.target_size();
        let live = pool.live_count();

        if live < target {
            for _ in live..target {
                match self.spawn_instance(pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        debug!(pool = %pool.key(), error = %e, "spawn deferred");
                        break;
                    }
                }
            }
        } else if live > target && pool.holds() == 0 {
            // retire the most recently added surplus instances
            let mut instances = pool.instances();
            instances.retain(|instance| instance.health() != HealthStatus::Terminated);
            for instance in instances.into_iter().skip(target) {
                debug!(pool = %pool.key(), instance = instance.id(), "retiring surplus instance");
                instance.transition(HealthStatus::Terminated);
                if let Err(e) = instance.process().kill().await {
                    warn!(pool = %pool.key(), instance = instance.id(), error = %e, "kill failed");
                }
                pool.remove_instance(instance.id());
            }
        }
    }
}

/// Monitor loop: ticks until shutdown is signaled.
async fn monitor_loop(runner: Arc<Runner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let tick = runner.monitor_options.lock().tick;
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                runner.tick().await;
            }
            _ = shutdown_rx.changed() => {
                debug!("monitor shutting down");
                break;
            }
        }
    }
}
