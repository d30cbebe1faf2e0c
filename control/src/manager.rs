//! Plugin manager
//!
//! Owns the table of loaded plugins and keeps the metric catalog in sync
//! with it: a plugin's declared metric types enter the catalog when it
//! loads and leave atomically when it unloads. Loading is all-or-nothing —
//! a catalog conflict rolls the whole load back.

use crate::catalog::{MetricCatalog, MetricType};
use crate::rpc::RpcClientFactory;
use crate::signing::{SignatureValidator, TrustLevel, SIGNATURE_SUFFIX};
use crate::supervisor::SpawnArgs;
use mittari_core::{ConfigPolicy, ControlError, PluginId, PluginKey, PluginRole};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A successfully loaded plugin. Immutable once inserted; the signed flag
/// is decided during the load itself.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Plugin identity
    pub id: PluginId,
    /// Path of the binary on disk
    pub path: PathBuf,
    /// Whether the binary's signature validated at load time
    pub signed: bool,
    /// Metric types this plugin declared (collectors)
    pub metrics: Vec<crate::rpc::DeclaredMetric>,
    /// Configuration policy for the plugin and its metrics
    pub policy: ConfigPolicy,
    /// Content types the plugin accepts
    pub accepted_content_types: Vec<String>,
    /// Content types the plugin returns
    pub returned_content_types: Vec<String>,
    /// How the runner starts instances of this plugin
    pub spawn: SpawnArgs,
}

impl LoadedPlugin {
    /// Canonical key of this plugin
    pub fn key(&self) -> PluginKey {
        self.id.key()
    }
}

/// Owns loaded-plugin records and their catalog entries.
pub struct PluginManager {
    plugins: RwLock<HashMap<PluginKey, Arc<LoadedPlugin>>>,
    catalog: Arc<MetricCatalog>,
    validator: Arc<dyn SignatureValidator>,
    factory: Arc<dyn RpcClientFactory>,
}

impl PluginManager {
    /// Build a manager around the shared catalog and the two load-time seams
    pub fn new(
        catalog: Arc<MetricCatalog>,
        validator: Arc<dyn SignatureValidator>,
        factory: Arc<dyn RpcClientFactory>,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            catalog,
            validator,
            factory,
        }
    }

    /// The catalog this manager keeps in sync
    pub fn catalog(&self) -> &Arc<MetricCatalog> {
        &self.catalog
    }

    /// Load the plugin binary at `path`.
    ///
    /// Signature validation runs first, gated by `trust`; then the binary
    /// is introspected through the factory; then the record and its metric
    /// types are inserted. A duplicate key fails with `AlreadyLoaded`; a
    /// metric conflict removes everything inserted so far and fails with
    /// `MetricConflict`.
    pub async fn load(
        &self,
        path: &Path,
        trust: TrustLevel,
        keyring: Option<&Path>,
    ) -> Result<Arc<LoadedPlugin>, ControlError> {
        let signed = self.check_signature(path, trust, keyring)?;

        let prospectus = self.factory.introspect(path).await?;
        let id = prospectus.id.clone();
        let key = id.key();

        let plugin = Arc::new(LoadedPlugin {
            id: id.clone(),
            path: path.to_path_buf(),
            signed,
            metrics: prospectus.metrics.clone(),
            policy: prospectus.policy.clone(),
            accepted_content_types: prospectus.accepted_content_types,
            returned_content_types: prospectus.returned_content_types,
            spawn: prospectus.spawn,
        });

        {
            let mut plugins = self.plugins.write();
            if plugins.contains_key(&key) {
                return Err(ControlError::AlreadyLoaded {
                    key: key.to_string(),
                });
            }
            plugins.insert(key.clone(), Arc::clone(&plugin));
        }

        // catalog fill; conflicts roll the whole load back
        let mut inserted = 0usize;
        for declared in &prospectus.metrics {
            let metric = MetricType::new(
                declared.namespace.clone(),
                declared.version,
                id.clone(),
                declared.default_config.clone(),
                prospectus.policy.node(&declared.namespace).clone(),
            );
            if let Err(conflict) = self.catalog.add(metric) {
                warn!(plugin = %key, error = %conflict, "metric conflict, rolling back load");
                self.catalog.remove_all_of(&key);
                self.plugins.write().remove(&key);
                debug_assert!(inserted <= prospectus.metrics.len());
                return Err(conflict);
            }
            inserted += 1;
        }

        info!(plugin = %key, path = %path.display(), signed, metrics = inserted, "plugin loaded");
        Ok(plugin)
    }

    fn check_signature(
        &self,
        path: &Path,
        trust: TrustLevel,
        keyring: Option<&Path>,
    ) -> Result<bool, ControlError> {
        if trust == TrustLevel::Disabled {
            return Ok(false);
        }
        let keyring = keyring.ok_or_else(|| ControlError::SignatureInvalid {
            path: path.display().to_string(),
            reason: "no keyring file configured".to_string(),
        });
        let keyring = match keyring {
            Ok(k) => k,
            Err(err) if trust == TrustLevel::Warn => {
                warn!(path = %path.display(), error = %err, "signature check skipped");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let mut signature = path.as_os_str().to_owned();
        signature.push(SIGNATURE_SUFFIX);
        match self
            .validator
            .validate(keyring, path, Path::new(&signature))
        {
            Ok(()) => Ok(true),
            Err(err) if trust == TrustLevel::Warn => {
                warn!(path = %path.display(), error = %err, "loading unsigned plugin");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Unload a plugin: its catalog entries are removed atomically with
    /// the record itself. The caller is responsible for draining the
    /// plugin's pool afterwards.
    pub fn unload(&self, id: &PluginId) -> Result<Arc<LoadedPlugin>, ControlError> {
        let key = id.key();
        let mut plugins = self.plugins.write();
        let plugin = plugins
            .remove(&key)
            .ok_or_else(|| ControlError::PluginNotFound {
                key: key.to_string(),
            })?;
        // removed while still holding the plugin table's write lock, so no
        // reader observes a plugin whose metrics are gone (or vice versa)
        self.catalog.remove_all_of(&key);
        drop(plugins);

        info!(plugin = %key, "plugin unloaded");
        Ok(plugin)
    }

    /// Exact lookup by key
    pub fn get(&self, key: &PluginKey) -> Result<Arc<LoadedPlugin>, ControlError> {
        self.plugins
            .read()
            .get(key)
            .map(Arc::clone)
            .ok_or_else(|| ControlError::PluginNotFound {
                key: key.to_string(),
            })
    }

    /// The greatest-version plugin with this role and name
    pub fn latest(&self, role: PluginRole, name: &str) -> Result<Arc<LoadedPlugin>, ControlError> {
        self.plugins
            .read()
            .values()
            .filter(|plugin| plugin.id.role == role && plugin.id.name == name)
            .max_by_key(|plugin| plugin.id.version)
            .map(Arc::clone)
            .ok_or_else(|| ControlError::PluginNotFound {
                key: format!("{role}:{name}:latest"),
            })
    }

    /// Every loaded plugin, sorted by key for stable listings
    pub fn all(&self) -> Vec<Arc<LoadedPlugin>> {
        let mut plugins: Vec<Arc<LoadedPlugin>> =
            self.plugins.read().values().map(Arc::clone).collect();
        plugins.sort_by(|a, b| a.key().cmp(&b.key()));
        plugins
    }

    /// Number of loaded plugins
    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    /// True if nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Drop every plugin and its catalog entries
    pub fn teardown(&self) {
        let mut plugins = self.plugins.write();
        for key in plugins.keys() {
            self.catalog.remove_all_of(key);
        }
        plugins.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rpc::loopback::{LoopbackFactory, ScriptedCollector};
    use crate::rpc::{DeclaredMetric, PluginProspectus, RoleClient};
    use crate::signing::ChecksumValidator;
    use mittari_core::{Namespace, VersionSpec};
    use std::fs;
    use tempfile::TempDir;

    fn ns(s: &str) -> Namespace {
        s.parse().unwrap()
    }

    fn harness() -> (Arc<MetricCatalog>, Arc<LoopbackFactory>, PluginManager) {
        let catalog = Arc::new(MetricCatalog::new());
        let factory = Arc::new(LoopbackFactory::new());
        let manager = PluginManager::new(
            Arc::clone(&catalog),
            Arc::new(ChecksumValidator),
            factory.clone() as Arc<dyn RpcClientFactory>,
        );
        (catalog, factory, manager)
    }

    fn register_collector(
        factory: &LoopbackFactory,
        name: &str,
        version: u32,
        namespaces: &[(&str, u32)],
    ) -> PathBuf {
        let path = PathBuf::from(format!("/plugins/{name}-{version}"));
        let id = PluginId::new(PluginRole::Collector, name, version);
        let mut prospectus = PluginProspectus::new(id, SpawnArgs::new(&path));
        for (namespace, metric_version) in namespaces {
            prospectus =
                prospectus.with_metric(DeclaredMetric::new(ns(namespace), *metric_version));
        }
        factory.register(
            prospectus,
            RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new()))),
        );
        path
    }

    #[tokio::test]
    async fn load_fills_the_catalog() {
        let (catalog, factory, manager) = harness();
        let path = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1), ("/intel/cpu/temp", 1)]);

        let plugin = manager.load(&path, TrustLevel::Disabled, None).await.unwrap();
        assert_eq!(plugin.key().as_str(), "collector:cpu:1");
        assert!(!plugin.signed);
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get_plugin(&ns("/intel/cpu/load"), VersionSpec::Latest).unwrap(),
            plugin.id
        );
    }

    #[tokio::test]
    async fn duplicate_load_is_rejected() {
        let (_, factory, manager) = harness();
        let path = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1)]);

        manager.load(&path, TrustLevel::Disabled, None).await.unwrap();
        let err = manager.load(&path, TrustLevel::Disabled, None).await.unwrap_err();
        assert_eq!(err.kind(), "already_loaded");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn metric_conflict_rolls_back_the_whole_load() {
        let (catalog, factory, manager) = harness();
        let first = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1)]);
        manager.load(&first, TrustLevel::Disabled, None).await.unwrap();

        // second plugin declares a fresh namespace and a conflicting one
        let second = register_collector(
            &factory,
            "cpu-next",
            1,
            &[("/intel/cpu/freq", 1), ("/intel/cpu/load", 1)],
        );
        let err = manager.load(&second, TrustLevel::Disabled, None).await.unwrap_err();
        assert_eq!(err.kind(), "metric_conflict");

        // nothing of the failed load remains
        assert_eq!(manager.len(), 1);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(&ns("/intel/cpu/freq"), VersionSpec::Latest).is_err());
    }

    #[tokio::test]
    async fn unload_restores_pre_load_state() {
        let (catalog, factory, manager) = harness();
        let path = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1)]);

        let plugin = manager.load(&path, TrustLevel::Disabled, None).await.unwrap();
        manager.unload(&plugin.id).unwrap();

        assert!(manager.is_empty());
        assert!(catalog.is_empty());
        assert_eq!(
            manager.unload(&plugin.id).unwrap_err().kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn latest_picks_the_greatest_version() {
        let (_, factory, manager) = harness();
        let v1 = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1)]);
        let v3 = register_collector(&factory, "cpu", 3, &[("/intel/cpu/load", 3)]);
        manager.load(&v1, TrustLevel::Disabled, None).await.unwrap();
        manager.load(&v3, TrustLevel::Disabled, None).await.unwrap();

        assert_eq!(manager.latest(PluginRole::Collector, "cpu").unwrap().id.version, 3);
        assert!(manager.latest(PluginRole::Publisher, "cpu").is_err());
    }

    #[tokio::test]
    async fn required_trust_refuses_unsigned_binaries() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("cpu-plugin");
        fs::write(&binary, b"binary").unwrap();
        let keyring = dir.path().join("keyring");
        fs::write(&keyring, "").unwrap();

        let (_, factory, manager) = harness();
        // introspection would succeed if signing passed
        let id = PluginId::new(PluginRole::Collector, "cpu", 1);
        factory.register(
            PluginProspectus::new(id, SpawnArgs::new(&binary)),
            RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new()))),
        );

        let err = manager
            .load(&binary, TrustLevel::Required, Some(&keyring))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "signature_invalid");
        assert!(manager.is_empty(), "no manager mutation on refused load");
    }

    #[tokio::test]
    async fn warn_trust_loads_with_signed_false() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("cpu-plugin");
        fs::write(&binary, b"binary").unwrap();
        let keyring = dir.path().join("keyring");
        fs::write(&keyring, "").unwrap();

        let (_, factory, manager) = harness();
        let id = PluginId::new(PluginRole::Collector, "cpu", 1);
        factory.register(
            PluginProspectus::new(id, SpawnArgs::new(&binary)),
            RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new()))),
        );

        let plugin = manager
            .load(&binary, TrustLevel::Warn, Some(&keyring))
            .await
            .unwrap();
        assert!(!plugin.signed);
    }

    #[tokio::test]
    async fn valid_signature_sets_signed_true() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("cpu-plugin");
        fs::write(&binary, b"binary").unwrap();

        // sign it: digest in the .asc file and in the keyring
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(b"binary");
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        fs::write(dir.path().join("cpu-plugin.asc"), &hex).unwrap();
        let keyring = dir.path().join("keyring");
        fs::write(&keyring, format!("{hex}\n")).unwrap();

        let (_, factory, manager) = harness();
        let id = PluginId::new(PluginRole::Collector, "cpu", 1);
        factory.register(
            PluginProspectus::new(id, SpawnArgs::new(&binary)),
            RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new()))),
        );

        let plugin = manager
            .load(&binary, TrustLevel::Required, Some(&keyring))
            .await
            .unwrap();
        assert!(plugin.signed);
    }

    #[tokio::test]
    async fn teardown_clears_everything() {
        let (catalog, factory, manager) = harness();
        let a = register_collector(&factory, "cpu", 1, &[("/intel/cpu/load", 1)]);
        let b = register_collector(&factory, "mem", 1, &[("/intel/mem/free", 1)]);
        manager.load(&a, TrustLevel::Disabled, None).await.unwrap();
        manager.load(&b, TrustLevel::Disabled, None).await.unwrap();

        manager.teardown();
        assert!(manager.is_empty());
        assert!(catalog.is_empty());
    }
}
