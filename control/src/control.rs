//! Control facade
//!
//! The public surface of the control plane. Everything flows through
//! [`Control`]: plugin lifecycle (load/unload/swap), dependency validation
//! and subscription, and the three dispatch operations (collect, process,
//! publish). Subsystems return structured records; the facade is the only
//! place events are emitted.

use crate::catalog::{MetricCatalog, MetricType, ResolvedMetric};
use crate::events::{ControlEvent, EventSink, NullSink};
use crate::manager::{LoadedPlugin, PluginManager};
use crate::routing::{RoundRobin, RoutingStrategy};
use crate::rpc::loopback::LoopbackFactory;
use crate::rpc::RpcClientFactory;
use crate::runner::pool::AvailableInstance;
use crate::runner::{MonitorOptions, Runner, RunnerConfig};
use crate::signing::{ChecksumValidator, SignatureValidator, TrustLevel};
use crate::supervisor::{NullSupervisor, ProcessSupervisor};
use bytes::Bytes;
use mittari_core::{
    ConfigTable, ControlError, Metric, MetricRequest, Namespace, PluginId, PluginKey,
    PluginRole, SubscriptionKind, VersionSpec,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A plugin dependency as a task names it: role, name, version spec and
/// an optional configuration table validated against the plugin's policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRequest {
    /// Requested role
    pub role: PluginRole,
    /// Plugin name
    pub name: String,
    /// Version pin or `Latest`
    pub version: VersionSpec,
    /// Plugin-level configuration to validate
    pub config: Option<ConfigTable>,
}

impl PluginRequest {
    /// Request a plugin with no configuration
    pub fn new(role: PluginRole, name: impl Into<String>, version: impl Into<VersionSpec>) -> Self {
        Self {
            role,
            name: name.into(),
            version: version.into(),
            config: None,
        }
    }

    /// Attach a configuration table
    pub fn with_config(mut self, config: ConfigTable) -> Self {
        self.config = Some(config);
        self
    }
}

/// Builder for [`Control`]. Options are typed methods, so there is no such
/// thing as an unknown option.
pub struct ControlBuilder {
    factory: Arc<dyn RpcClientFactory>,
    supervisor: Arc<dyn ProcessSupervisor>,
    validator: Arc<dyn SignatureValidator>,
    events: Arc<dyn EventSink>,
    strategy: Arc<dyn RoutingStrategy>,
    max_running_plugins: usize,
    cache_expiration: Duration,
    monitor: MonitorOptions,
}

impl Default for ControlBuilder {
    fn default() -> Self {
        Self {
            factory: Arc::new(LoopbackFactory::new()),
            supervisor: Arc::new(NullSupervisor::default()),
            validator: Arc::new(ChecksumValidator),
            events: Arc::new(NullSink),
            strategy: Arc::new(RoundRobin::new()),
            max_running_plugins: 16,
            cache_expiration: Duration::from_millis(500),
            monitor: MonitorOptions::default(),
        }
    }
}

impl ControlBuilder {
    /// Start from defaults: loopback factory, null supervisor, checksum
    /// validator, no event sink
    pub fn new() -> Self {
        Self::default()
    }

    /// RPC client factory (transport owner)
    pub fn factory(mut self, factory: Arc<dyn RpcClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Process supervisor
    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Signature validator
    pub fn validator(mut self, validator: Arc<dyn SignatureValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Event sink the facade publishes to
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Routing strategy; round-robin unless overridden. Set before any
    /// pool exists — the runner never changes strategy mid-flight.
    pub fn strategy(mut self, strategy: Arc<dyn RoutingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Global cap on live instances across all pools
    pub fn max_running_plugins(mut self, max: usize) -> Self {
        self.max_running_plugins = max;
        self
    }

    /// TTL for the collector response cache; zero disables it
    pub fn cache_expiration(mut self, expiration: Duration) -> Self {
        self.cache_expiration = expiration;
        self
    }

    /// Initial monitor tuning
    pub fn monitor_options(mut self, monitor: MonitorOptions) -> Self {
        self.monitor = monitor;
        self
    }

    /// Wire the components together
    pub fn build(self) -> Control {
        let catalog = Arc::new(MetricCatalog::new());
        let manager = Arc::new(PluginManager::new(
            Arc::clone(&catalog),
            self.validator,
            Arc::clone(&self.factory),
        ));
        let runner = Arc::new(Runner::new(
            Arc::clone(&manager),
            self.factory,
            self.supervisor,
            RunnerConfig {
                strategy: self.strategy,
                max_running_plugins: self.max_running_plugins,
                cache_expiration: self.cache_expiration,
                monitor: self.monitor,
            },
        ));

        Control {
            started: AtomicBool::new(false),
            catalog,
            manager,
            runner,
            events: self.events,
            trust: Mutex::new(TrustLevel::Disabled),
            keyring: Mutex::new(None),
            autodiscover_paths: RwLock::new(Vec::new()),
            mutation: tokio::sync::Mutex::new(()),
        }
    }
}

/// The plugin control plane.
pub struct Control {
    started: AtomicBool,
    catalog: Arc<MetricCatalog>,
    manager: Arc<PluginManager>,
    runner: Arc<Runner>,
    events: Arc<dyn EventSink>,
    trust: Mutex<TrustLevel>,
    keyring: Mutex<Option<PathBuf>>,
    autodiscover_paths: RwLock<Vec<PathBuf>>,
    /// Serializes load/unload/swap so the catalog never observes a
    /// half-applied mutation
    mutation: tokio::sync::Mutex<()>,
}

impl Control {
    /// Builder with default seams
    pub fn builder() -> ControlBuilder {
        ControlBuilder::new()
    }

    /// Begin accepting lifecycle operations and start the runner's monitor
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        Arc::clone(&self.runner).start();
        info!("control started");
    }

    /// Stop the monitor, drain every pool and unload every plugin.
    /// Returns the errors accumulated while shutting down.
    pub async fn stop(&self) -> Vec<ControlError> {
        self.started.store(false, Ordering::Release);
        let errors = self.runner.stop().await;
        self.manager.teardown();
        info!(errors = errors.len(), "control stopped");
        errors
    }

    fn ensure_started(&self) -> Result<(), ControlError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ControlError::NotStarted)
        }
    }

    fn signing_config(&self) -> (TrustLevel, Option<PathBuf>) {
        (*self.trust.lock(), self.keyring.lock().clone())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Load the plugin binary at `path`
    pub async fn load(&self, path: &Path) -> Result<Arc<LoadedPlugin>, ControlError> {
        self.ensure_started()?;
        let _guard = self.mutation.lock().await;

        let (trust, keyring) = self.signing_config();
        let plugin = self.manager.load(path, trust, keyring.as_deref()).await?;

        let moved = self.runner.migrate_unbound(&plugin.id);
        if moved > 0 {
            debug!(plugin = %plugin.key(), moved, "unbound subscriptions followed the new version");
        }

        self.events.publish(ControlEvent::LoadPlugin {
            id: plugin.id.clone(),
            signed: plugin.signed,
        });
        Ok(plugin)
    }

    /// Unload a plugin and drain its pool
    pub async fn unload(&self, id: &PluginId) -> Result<Arc<LoadedPlugin>, ControlError> {
        let _guard = self.mutation.lock().await;
        let plugin = self.manager.unload(id)?;

        for error in self.runner.drain_pool(&plugin.key()).await {
            warn!(plugin = %plugin.key(), error = %error, "error draining pool on unload");
        }

        self.events
            .publish(ControlEvent::UnloadPlugin { id: plugin.id.clone() });
        Ok(plugin)
    }

    /// Replace `out` with the plugin at `in_path`.
    ///
    /// The incoming plugin loads first; if unloading the outgoing one then
    /// fails, the incoming plugin is unloaded again to restore the prior
    /// state. A failed rollback surfaces [`ControlError::Composite`] with
    /// both causes. The swap event fires only on full success.
    pub async fn swap_plugins(
        &self,
        in_path: &Path,
        out: &PluginId,
    ) -> Result<Arc<LoadedPlugin>, ControlError> {
        self.ensure_started()?;
        let _guard = self.mutation.lock().await;

        let (trust, keyring) = self.signing_config();
        let loaded = self.manager.load(in_path, trust, keyring.as_deref()).await?;

        let unloaded = match self.manager.unload(out) {
            Ok(unloaded) => unloaded,
            Err(original) => {
                return match self.manager.unload(&loaded.id) {
                    Ok(_) => Err(original),
                    Err(rollback) => Err(ControlError::Composite {
                        original: Box::new(original),
                        rollback: Box::new(rollback),
                    }),
                };
            }
        };

        for error in self.runner.drain_pool(&unloaded.key()).await {
            warn!(plugin = %unloaded.key(), error = %error, "error draining pool on swap");
        }
        self.runner.migrate_unbound(&loaded.id);

        self.events.publish(ControlEvent::SwapPlugins {
            loaded: loaded.id.clone(),
            unloaded: unloaded.id.clone(),
        });
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // dependency validation & subscription
    // ------------------------------------------------------------------

    /// Validate every metric and plugin dependency, returning the complete
    /// error vector. Nothing short-circuits: the caller gets the full
    /// diagnostic in one pass.
    pub fn validate_deps(
        &self,
        metrics: &[MetricRequest],
        plugins: &[PluginRequest],
    ) -> Vec<ControlError> {
        let mut errors = Vec::new();

        for request in metrics {
            if let Err(e) =
                self.catalog
                    .get_with_config(&request.namespace, request.version, request.config.as_ref())
            {
                errors.push(e);
            }
        }

        for request in plugins {
            let plugin = match self.resolve_plugin(request) {
                Ok(plugin) => plugin,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if let Some(config) = &request.config {
                let root = plugin.policy.root();
                if !root.is_empty() {
                    if let Err(violations) = root.process(config) {
                        errors.push(ControlError::PolicyViolation {
                            subject: plugin.key().to_string(),
                            violations,
                        });
                    }
                }
            }
        }

        errors
    }

    fn resolve_plugin(&self, request: &PluginRequest) -> Result<Arc<LoadedPlugin>, ControlError> {
        match request.version {
            VersionSpec::Exact(version) => self
                .manager
                .get(&PluginKey::new(request.role, &request.name, version)),
            VersionSpec::Latest => self.manager.latest(request.role, &request.name),
        }
    }

    /// Resolve the set of plugins a dependency list implies. Returns
    /// `key → (identity, kind)`; a `Latest` request resolves to the current
    /// concrete key with an unbound kind. Bound wins when both kinds name
    /// the same key.
    fn resolve_dependencies(
        &self,
        metrics: &[MetricRequest],
        plugins: &[PluginRequest],
    ) -> Result<BTreeMap<PluginKey, (PluginId, SubscriptionKind)>, Vec<ControlError>> {
        let mut resolved: BTreeMap<PluginKey, (PluginId, SubscriptionKind)> = BTreeMap::new();
        let mut errors = Vec::new();

        let mut insert = |id: PluginId, kind: SubscriptionKind| {
            let key = id.key();
            resolved
                .entry(key)
                .and_modify(|(_, existing)| {
                    if kind == SubscriptionKind::Bound {
                        *existing = SubscriptionKind::Bound;
                    }
                })
                .or_insert((id, kind));
        };

        for request in metrics {
            match self.catalog.get_plugin(&request.namespace, request.version) {
                Ok(id) => {
                    let kind = if request.version.is_latest() {
                        SubscriptionKind::Unbound
                    } else {
                        SubscriptionKind::Bound
                    };
                    insert(id, kind);
                }
                Err(e) => errors.push(e),
            }
        }

        for request in plugins {
            match request.version {
                VersionSpec::Exact(version) => insert(
                    PluginId::new(request.role, &request.name, version),
                    SubscriptionKind::Bound,
                ),
                VersionSpec::Latest => match self.manager.latest(request.role, &request.name) {
                    Ok(plugin) => insert(plugin.id.clone(), SubscriptionKind::Unbound),
                    Err(e) => errors.push(e),
                },
            }
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(errors)
        }
    }

    /// Subscribe `task_id` to every plugin the dependency list implies.
    /// Pools are created as needed so the runner can bring instances up.
    /// Resolution failures are surfaced and abort before any pool mutates.
    pub fn subscribe_deps(
        &self,
        task_id: u64,
        metrics: &[MetricRequest],
        plugins: &[PluginRequest],
    ) -> Vec<ControlError> {
        let resolved = match self.resolve_dependencies(metrics, plugins) {
            Ok(resolved) => resolved,
            Err(errors) => return errors,
        };

        for request in metrics {
            // refcount bookkeeping, independent of pool subscriptions
            if let Err(e) = self.catalog.subscribe(&request.namespace, request.version) {
                debug!(namespace = %request.namespace, error = %e, "catalog subscribe skipped");
            }
        }

        for (key, (id, kind)) in resolved {
            let pool = self.runner.pools().get_or_create(&key);
            pool.subscribe(task_id, kind);
            debug!(task = task_id, plugin = %key, kind = %kind, "subscribed");
            self.events.publish(ControlEvent::PluginSubscription {
                task_id,
                id,
                kind,
            });
        }

        Vec::new()
    }

    /// Drop `task_id`'s subscriptions for the dependency list. Symmetric
    /// with [`Control::subscribe_deps`], but never creates pools; an
    /// absent pool is a no-op.
    pub fn unsubscribe_deps(
        &self,
        task_id: u64,
        metrics: &[MetricRequest],
        plugins: &[PluginRequest],
    ) -> Vec<ControlError> {
        let resolved = match self.resolve_dependencies(metrics, plugins) {
            Ok(resolved) => resolved,
            Err(errors) => return errors,
        };

        for request in metrics {
            if let Err(e) = self.catalog.unsubscribe(&request.namespace, request.version) {
                debug!(namespace = %request.namespace, error = %e, "catalog unsubscribe skipped");
            }
        }

        for (key, (id, _)) in resolved {
            if let Some(pool) = self.runner.pools().get(&key) {
                pool.unsubscribe(task_id);
            }
            debug!(task = task_id, plugin = %key, "unsubscribed");
            self.events
                .publish(ControlEvent::PluginUnsubscription { task_id, id });
        }

        Vec::new()
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    /// Collect every requested metric, fanning out one concurrent RPC per
    /// owning plugin. All-or-nothing: any group error fails the whole
    /// request with the collected error vector.
    pub async fn collect_metrics(
        &self,
        requests: &[MetricRequest],
        deadline: Duration,
    ) -> Result<Vec<Metric>, Vec<ControlError>> {
        let (metrics, errors) = self.collect_inner(requests, deadline).await;
        if errors.is_empty() {
            Ok(metrics)
        } else {
            Err(errors)
        }
    }

    /// Collect with explicit partial-result tolerance: whatever succeeded
    /// comes back alongside whatever failed.
    pub async fn collect_metrics_partial(
        &self,
        requests: &[MetricRequest],
        deadline: Duration,
    ) -> (Vec<Metric>, Vec<ControlError>) {
        self.collect_inner(requests, deadline).await
    }

    async fn collect_inner(
        &self,
        requests: &[MetricRequest],
        deadline: Duration,
    ) -> (Vec<Metric>, Vec<ControlError>) {
        // group requests by the plugin owning each metric, at latest
        let mut groups: BTreeMap<PluginKey, Vec<MetricRequest>> = BTreeMap::new();
        let mut errors = Vec::new();
        for request in requests {
            match self
                .catalog
                .get_plugin(&request.namespace, VersionSpec::Latest)
            {
                Ok(id) => groups.entry(id.key()).or_default().push(request.clone()),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            // resolution failures abort before any pool is touched
            return (Vec::new(), errors);
        }

        // per group: hold the pool, pick a ready instance, check the role
        let mut holds = Vec::new();
        let mut prepared = Vec::new();
        for (key, group) in groups {
            let Some(pool) = self.runner.pools().get(&key) else {
                errors.push(ControlError::PoolMissing {
                    key: key.to_string(),
                });
                continue;
            };
            let hold = match pool.hold() {
                Ok(hold) => hold,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if let Err(e) = self.runner.ensure_ready(&pool).await {
                errors.push(e);
                continue;
            }
            let Some(instance) = pool.select(self.runner.strategy().as_ref()) else {
                errors.push(ControlError::SpawnFailed {
                    key: key.to_string(),
                    reason: "no ready instance after spawn".to_string(),
                });
                continue;
            };
            let client = match instance.client().as_collector(&key) {
                Ok(client) => client,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            instance.record_hit();
            holds.push(hold);
            prepared.push((client, group));
        }

        // one task per group; a single channel merges results, and the
        // last task dropping its sender closes it
        let (tx, mut rx) = mpsc::channel::<Result<Vec<Metric>, ControlError>>(
            prepared.len().max(1),
        );
        for (client, group) in prepared {
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client.collect(&group, deadline).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut metrics = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(batch) => metrics.extend(batch),
                Err(e) => errors.push(e),
            }
        }
        drop(holds);

        (metrics, errors)
    }

    /// Push a metric payload through the named processor. The caller must
    /// pin a concrete version.
    pub async fn process_metrics(
        &self,
        content_type: &str,
        content: Bytes,
        name: &str,
        version: u32,
        config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(String, Bytes), ControlError> {
        let key = PluginKey::new(PluginRole::Processor, name, version);
        let pool = self
            .runner
            .pools()
            .get(&key)
            .ok_or_else(|| ControlError::PoolMissing {
                key: key.to_string(),
            })?;
        let _hold = pool.hold()?;
        self.runner.ensure_ready(&pool).await?;
        let instance = pool
            .select(self.runner.strategy().as_ref())
            .ok_or_else(|| ControlError::SpawnFailed {
                key: key.to_string(),
                reason: "no ready instance after spawn".to_string(),
            })?;
        let client = instance.client().as_processor(&key)?;
        instance.record_hit();
        client.process(content_type, content, config, deadline).await
    }

    /// Publish a metric payload through the named publisher. The caller
    /// must pin a concrete version.
    pub async fn publish_metrics(
        &self,
        content_type: &str,
        content: Bytes,
        name: &str,
        version: u32,
        config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(), ControlError> {
        let key = PluginKey::new(PluginRole::Publisher, name, version);
        let pool = self
            .runner
            .pools()
            .get(&key)
            .ok_or_else(|| ControlError::PoolMissing {
                key: key.to_string(),
            })?;
        let _hold = pool.hold()?;
        self.runner.ensure_ready(&pool).await?;
        let instance = pool
            .select(self.runner.strategy().as_ref())
            .ok_or_else(|| ControlError::SpawnFailed {
                key: key.to_string(),
                reason: "no ready instance after spawn".to_string(),
            })?;
        let client = instance.client().as_publisher(&key)?;
        instance.record_hit();
        client.publish(content_type, content, config, deadline).await
    }

    // ------------------------------------------------------------------
    // inventory
    // ------------------------------------------------------------------

    /// Every loaded plugin
    pub fn plugin_catalog(&self) -> Vec<Arc<LoadedPlugin>> {
        self.manager.all()
    }

    /// The runner's pool collection, read-only from the caller's side
    pub fn pool_collection(&self) -> &Arc<crate::runner::pool::PoolCollection> {
        self.runner.pools()
    }

    /// Every live instance across every pool
    pub fn available_plugins(&self) -> Vec<Arc<AvailableInstance>> {
        self.runner
            .pools()
            .all()
            .iter()
            .flat_map(|pool| pool.instances())
            .collect()
    }

    /// The entire metric catalog
    pub fn metric_catalog(&self) -> Vec<Arc<MetricType>> {
        self.catalog.fetch(&Namespace::new(Vec::<String>::new()))
    }

    /// Metric types under `prefix`, optionally filtered to one version
    pub fn fetch_metrics(&self, prefix: &Namespace, version: Option<u32>) -> Vec<Arc<MetricType>> {
        let mut metrics = self.catalog.fetch(prefix);
        if let Some(version) = version {
            metrics.retain(|metric| metric.version() == version);
        }
        metrics
    }

    /// Look up one metric type, running config gating when `config` is given
    pub fn get_metric(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
        config: Option<&ConfigTable>,
    ) -> Result<ResolvedMetric, ControlError> {
        self.catalog.get_with_config(namespace, version, config)
    }

    /// True if a metric type exists at `namespace`/`version`
    pub fn metric_exists(&self, namespace: &Namespace, version: VersionSpec) -> bool {
        self.catalog.get(namespace, version).is_ok()
    }

    /// Accepted and returned content types of a loaded plugin
    pub fn plugin_content_types(
        &self,
        role: PluginRole,
        name: &str,
        version: VersionSpec,
    ) -> Result<(Vec<String>, Vec<String>), ControlError> {
        let plugin = match version {
            VersionSpec::Exact(v) => self.manager.get(&PluginKey::new(role, name, v))?,
            VersionSpec::Latest => self.manager.latest(role, name)?,
        };
        Ok((
            plugin.accepted_content_types.clone(),
            plugin.returned_content_types.clone(),
        ))
    }

    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    /// Directories that may be offered to an operator for plugin
    /// discovery. Stored only; the control plane never walks them.
    pub fn set_autodiscover_paths(&self, paths: Vec<PathBuf>) {
        *self.autodiscover_paths.write() = paths;
    }

    /// The stored autodiscover paths
    pub fn autodiscover_paths(&self) -> Vec<PathBuf> {
        self.autodiscover_paths.read().clone()
    }

    /// Set the trust level applied to subsequent loads
    pub fn set_plugin_trust_level(&self, trust: TrustLevel) {
        *self.trust.lock() = trust;
    }

    /// Set the keyring file used by the signature validator
    pub fn set_keyring_file(&self, keyring: impl Into<PathBuf>) {
        *self.keyring.lock() = Some(keyring.into());
    }

    /// Replace the monitor tuning
    pub fn set_monitor_options(&self, options: MonitorOptions) {
        self.runner.set_monitor_options(options);
    }
}
