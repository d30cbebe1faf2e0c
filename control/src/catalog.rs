//! Metric catalog
//!
//! Namespaced, versioned registry of every metric type declared by loaded
//! plugins. Lookups with [`VersionSpec::Latest`] resolve to the greatest
//! version present; exact lookups require an exact match. The catalog also
//! gates caller configuration through the owning plugin's policy, always
//! returning a new processed table and never mutating the caller's.

use mittari_core::{
    ConfigTable, ControlError, Namespace, PluginId, PluginKey, PolicyNode, VersionSpec,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One metric type, owned by exactly one loaded plugin.
#[derive(Debug, Clone)]
pub struct MetricType {
    namespace: Namespace,
    version: u32,
    plugin: PluginId,
    default_config: ConfigTable,
    policy: PolicyNode,
}

impl MetricType {
    /// Build a metric type for `plugin` at `namespace`/`version`
    pub fn new(
        namespace: Namespace,
        version: u32,
        plugin: PluginId,
        default_config: ConfigTable,
        policy: PolicyNode,
    ) -> Self {
        Self {
            namespace,
            version,
            plugin,
            default_config,
            policy,
        }
    }

    /// The metric's namespace
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The metric's concrete version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Identity of the owning plugin
    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    /// Key of the owning plugin
    pub fn plugin_key(&self) -> PluginKey {
        self.plugin.key()
    }

    /// Default configuration declared by the plugin
    pub fn default_config(&self) -> &ConfigTable {
        &self.default_config
    }

    /// Policy node governing caller configuration for this metric
    pub fn policy(&self) -> &PolicyNode {
        &self.policy
    }
}

/// A catalog lookup that also ran config gating: the resolved metric type
/// plus the processed configuration the caller should dispatch with.
#[derive(Debug, Clone)]
pub struct ResolvedMetric {
    /// The resolved metric type; `metric.version()` is the concrete
    /// version a `Latest` request bound to
    pub metric: Arc<MetricType>,
    /// Caller config processed through the metric's policy (defaults
    /// applied), or the metric's default config when none was supplied
    pub config: ConfigTable,
}

#[derive(Default)]
struct CatalogInner {
    tree: HashMap<Namespace, BTreeMap<u32, Arc<MetricType>>>,
    subscriptions: HashMap<(Namespace, u32), usize>,
}

/// The metric catalog.
#[derive(Default)]
pub struct MetricCatalog {
    inner: RwLock<CatalogInner>,
}

impl MetricCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a metric type. Fails with [`ControlError::MetricConflict`]
    /// if the namespace+version is already present (even from the same
    /// plugin — declarations must be unique).
    pub fn add(&self, metric: MetricType) -> Result<(), ControlError> {
        let mut inner = self.inner.write();
        let versions = inner.tree.entry(metric.namespace.clone()).or_default();
        if let Some(existing) = versions.get(&metric.version) {
            return Err(ControlError::MetricConflict {
                namespace: metric.namespace.to_string(),
                version: metric.version,
                existing: existing.plugin_key().to_string(),
            });
        }
        debug!(namespace = %metric.namespace, version = metric.version, plugin = %metric.plugin, "metric added to catalog");
        versions.insert(metric.version, Arc::new(metric));
        Ok(())
    }

    /// Remove every metric type owned by `plugin`, returning the removed
    /// entries. Namespaces left without versions disappear entirely.
    pub fn remove_all_of(&self, plugin: &PluginKey) -> Vec<Arc<MetricType>> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        inner.tree.retain(|_, versions| {
            versions.retain(|_, metric| {
                if metric.plugin_key() == *plugin {
                    removed.push(Arc::clone(metric));
                    false
                } else {
                    true
                }
            });
            !versions.is_empty()
        });
        for metric in &removed {
            inner
                .subscriptions
                .remove(&(metric.namespace.clone(), metric.version));
        }
        removed
    }

    fn resolve(
        inner: &CatalogInner,
        namespace: &Namespace,
        version: VersionSpec,
    ) -> Result<Arc<MetricType>, ControlError> {
        let not_found = || ControlError::MetricNotFound {
            namespace: namespace.to_string(),
            version: version.to_string(),
        };
        let versions = inner.tree.get(namespace).ok_or_else(not_found)?;
        match version {
            VersionSpec::Exact(v) => versions.get(&v).map(Arc::clone).ok_or_else(not_found),
            VersionSpec::Latest => versions
                .last_key_value()
                .map(|(_, metric)| Arc::clone(metric))
                .ok_or_else(not_found),
        }
    }

    /// Look up one metric type
    pub fn get(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
    ) -> Result<Arc<MetricType>, ControlError> {
        Self::resolve(&self.inner.read(), namespace, version)
    }

    /// Look up one metric type and gate the caller's configuration through
    /// its policy. The policy runs over the caller's table as supplied —
    /// the metric's own default config never pre-fills it, so a required
    /// key the caller omitted is a violation. The caller's table is never
    /// mutated; the returned [`ResolvedMetric`] carries a fresh processed
    /// table.
    pub fn get_with_config(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
        config: Option<&ConfigTable>,
    ) -> Result<ResolvedMetric, ControlError> {
        let metric = self.get(namespace, version)?;
        let config = match config {
            Some(table) if !metric.policy.is_empty() => metric
                .policy
                .process(table)
                .map_err(|violations| ControlError::PolicyViolation {
                    subject: metric.namespace.to_string(),
                    violations,
                })?,
            Some(table) => metric.default_config.merged(table),
            None => metric.default_config.clone(),
        };
        Ok(ResolvedMetric { metric, config })
    }

    /// All metric types whose namespace has `prefix` as a prefix, sorted
    /// by namespace then version
    pub fn fetch(&self, prefix: &Namespace) -> Vec<Arc<MetricType>> {
        let inner = self.inner.read();
        let mut out: Vec<Arc<MetricType>> = inner
            .tree
            .iter()
            .filter(|(namespace, _)| namespace.starts_with(prefix))
            .flat_map(|(_, versions)| versions.values().map(Arc::clone))
            .collect();
        out.sort_by(|a, b| {
            a.namespace
                .cmp(&b.namespace)
                .then(a.version.cmp(&b.version))
        });
        out
    }

    /// Identity of the plugin owning the metric at `namespace`/`version`
    pub fn get_plugin(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
    ) -> Result<PluginId, ControlError> {
        Ok(self.get(namespace, version)?.plugin.clone())
    }

    /// Bump the subscription count on one metric type. Returns the
    /// concrete version the subscription bound to.
    pub fn subscribe(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
    ) -> Result<u32, ControlError> {
        let mut inner = self.inner.write();
        let metric = Self::resolve(&inner, namespace, version)?;
        let bound = metric.version;
        *inner
            .subscriptions
            .entry((metric.namespace.clone(), bound))
            .or_insert(0) += 1;
        Ok(bound)
    }

    /// Drop one subscription from a metric type
    pub fn unsubscribe(
        &self,
        namespace: &Namespace,
        version: VersionSpec,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.write();
        let metric = Self::resolve(&inner, namespace, version)?;
        let slot = (metric.namespace.clone(), metric.version);
        if let Some(count) = inner.subscriptions.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                inner.subscriptions.remove(&slot);
            }
        }
        Ok(())
    }

    /// Current subscription count for one concrete metric type
    pub fn subscription_count(&self, namespace: &Namespace, version: u32) -> usize {
        self.inner
            .read()
            .subscriptions
            .get(&(namespace.clone(), version))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of metric types across all namespaces
    pub fn len(&self) -> usize {
        self.inner.read().tree.values().map(BTreeMap::len).sum()
    }

    /// True if no metric type is cataloged
    pub fn is_empty(&self) -> bool {
        self.inner.read().tree.is_empty()
    }
}
