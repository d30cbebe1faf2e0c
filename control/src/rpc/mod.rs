//! RPC seam between the control plane and running plugins
//!
//! The control plane never speaks a wire protocol itself. It works against
//! three role-shaped client traits plus a factory that produces them. The
//! factory also owns the introspection handshake: a short-lived run of the
//! plugin binary that yields its self-description ([`PluginProspectus`]).
//!
//! A client is stored next to its role in [`RoleClient`], so "cast to the
//! collector client" is a match that either yields the typed client or a
//! [`ControlError::ClientRoleMismatch`] — there is no runtime downcast.

pub mod cache;
pub mod loopback;

use crate::supervisor::{ProcessHandle, SpawnArgs};
use async_trait::async_trait;
use bytes::Bytes;
use mittari_core::{
    ConfigPolicy, ConfigTable, ControlError, Metric, MetricRequest, Namespace, PluginId,
    PluginKey, PluginRole,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Liveness surface shared by all three roles.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Cheap health probe. Errors and timeouts both count as failures.
    async fn ping(&self) -> Result<(), ControlError>;
}

/// Client to a collector plugin.
#[async_trait]
pub trait CollectorClient: PluginClient {
    /// Collect the requested metrics. The transport honors `deadline` and
    /// fails the call with [`ControlError::Deadline`] when it expires.
    async fn collect(
        &self,
        requests: &[MetricRequest],
        deadline: Duration,
    ) -> Result<Vec<Metric>, ControlError>;
}

/// Client to a processor plugin.
#[async_trait]
pub trait ProcessorClient: PluginClient {
    /// Transform a metric payload, returning the new content type and body.
    async fn process(
        &self,
        content_type: &str,
        content: Bytes,
        config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(String, Bytes), ControlError>;
}

/// Client to a publisher plugin.
#[async_trait]
pub trait PublisherClient: PluginClient {
    /// Deliver a metric payload to the plugin's destination.
    async fn publish(
        &self,
        content_type: &str,
        content: Bytes,
        config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(), ControlError>;
}

impl std::fmt::Debug for dyn PublisherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn PublisherClient")
    }
}

/// A typed client stored alongside the role it implements.
#[derive(Clone)]
pub enum RoleClient {
    /// Collector-role client
    Collector(Arc<dyn CollectorClient>),
    /// Processor-role client
    Processor(Arc<dyn ProcessorClient>),
    /// Publisher-role client
    Publisher(Arc<dyn PublisherClient>),
}

impl RoleClient {
    /// The role this client implements
    pub fn role(&self) -> PluginRole {
        match self {
            RoleClient::Collector(_) => PluginRole::Collector,
            RoleClient::Processor(_) => PluginRole::Processor,
            RoleClient::Publisher(_) => PluginRole::Publisher,
        }
    }

    /// Probe liveness through whichever role client this is
    pub async fn ping(&self) -> Result<(), ControlError> {
        match self {
            RoleClient::Collector(c) => c.ping().await,
            RoleClient::Processor(c) => c.ping().await,
            RoleClient::Publisher(c) => c.ping().await,
        }
    }

    fn mismatch(&self, key: &PluginKey, wanted: PluginRole) -> ControlError {
        ControlError::ClientRoleMismatch {
            key: key.to_string(),
            wanted: wanted.to_string(),
            actual: self.role().to_string(),
        }
    }

    /// The collector client, or a role mismatch naming `key`
    pub fn as_collector(&self, key: &PluginKey) -> Result<Arc<dyn CollectorClient>, ControlError> {
        match self {
            RoleClient::Collector(c) => Ok(Arc::clone(c)),
            other => Err(other.mismatch(key, PluginRole::Collector)),
        }
    }

    /// The processor client, or a role mismatch naming `key`
    pub fn as_processor(&self, key: &PluginKey) -> Result<Arc<dyn ProcessorClient>, ControlError> {
        match self {
            RoleClient::Processor(c) => Ok(Arc::clone(c)),
            other => Err(other.mismatch(key, PluginRole::Processor)),
        }
    }

    /// The publisher client, or a role mismatch naming `key`
    pub fn as_publisher(&self, key: &PluginKey) -> Result<Arc<dyn PublisherClient>, ControlError> {
        match self {
            RoleClient::Publisher(c) => Ok(Arc::clone(c)),
            other => Err(other.mismatch(key, PluginRole::Publisher)),
        }
    }
}

impl std::fmt::Debug for RoleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoleClient({})", self.role())
    }
}

/// One metric type a plugin declares during introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredMetric {
    /// Namespace the metric lives at
    pub namespace: Namespace,
    /// Concrete version of the metric type
    pub version: u32,
    /// Default configuration merged under caller config
    pub default_config: ConfigTable,
}

impl DeclaredMetric {
    /// Declare a metric with an empty default configuration
    pub fn new(namespace: Namespace, version: u32) -> Self {
        Self {
            namespace,
            version,
            default_config: ConfigTable::new(),
        }
    }

    /// Attach a default configuration table
    pub fn with_default_config(mut self, config: ConfigTable) -> Self {
        self.default_config = config;
        self
    }
}

/// A plugin's self-description, obtained from the introspection handshake.
#[derive(Debug, Clone)]
pub struct PluginProspectus {
    /// Plugin identity
    pub id: PluginId,
    /// Metric types the plugin declares (collectors; empty otherwise)
    pub metrics: Vec<DeclaredMetric>,
    /// Content types the plugin accepts (processors/publishers)
    pub accepted_content_types: Vec<String>,
    /// Content types the plugin returns (processors)
    pub returned_content_types: Vec<String>,
    /// Configuration policy for the plugin and its metrics
    pub policy: ConfigPolicy,
    /// How to start an instance of this plugin
    pub spawn: SpawnArgs,
}

impl PluginProspectus {
    /// Minimal prospectus: identity plus spawn arguments
    pub fn new(id: PluginId, spawn: SpawnArgs) -> Self {
        Self {
            id,
            metrics: Vec::new(),
            accepted_content_types: Vec::new(),
            returned_content_types: Vec::new(),
            policy: ConfigPolicy::new(),
            spawn,
        }
    }

    /// Declare a metric type
    pub fn with_metric(mut self, metric: DeclaredMetric) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Set the configuration policy
    pub fn with_policy(mut self, policy: ConfigPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set accepted and returned content types
    pub fn with_content_types(
        mut self,
        accepted: Vec<String>,
        returned: Vec<String>,
    ) -> Self {
        self.accepted_content_types = accepted;
        self.returned_content_types = returned;
        self
    }
}

/// Produces introspection results and typed clients.
///
/// The factory owns whatever transport the deployment uses; the control
/// plane only sees the traits above.
#[async_trait]
pub trait RpcClientFactory: Send + Sync {
    /// Run the binary at `path` in introspection mode and read back its
    /// self-description. Short-lived; the process exits after handshaking.
    async fn introspect(&self, path: &Path) -> Result<PluginProspectus, ControlError>;

    /// Open a typed client to a running instance of `id`.
    async fn connect(
        &self,
        id: &PluginId,
        process: &Arc<dyn ProcessHandle>,
    ) -> Result<RoleClient, ControlError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::loopback::ScriptedCollector;
    use super::*;

    #[test]
    fn role_client_reports_its_role() {
        let client = RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new())));
        assert_eq!(client.role(), PluginRole::Collector);
        assert_eq!(format!("{client:?}"), "RoleClient(collector)");
    }

    #[test]
    fn role_mismatch_names_both_roles() {
        let client = RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new())));
        let key = PluginKey::new(PluginRole::Publisher, "file", 1);

        let err = client.as_publisher(&key).unwrap_err();
        match err {
            ControlError::ClientRoleMismatch { key, wanted, actual } => {
                assert_eq!(key, "publisher:file:1");
                assert_eq!(wanted, "publisher");
                assert_eq!(actual, "collector");
            }
            other => panic!("expected ClientRoleMismatch, got {other:?}"),
        }
    }

    #[test]
    fn matching_role_yields_typed_client() {
        let client = RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new())));
        let key = PluginKey::new(PluginRole::Collector, "cpu", 1);
        assert!(client.as_collector(&key).is_ok());
    }

    #[test]
    fn prospectus_builder_accumulates() {
        let ns: Namespace = "/intel/cpu/load".parse().unwrap();
        let prospectus = PluginProspectus::new(
            PluginId::new(PluginRole::Collector, "cpu", 1),
            SpawnArgs::new("/opt/plugins/cpu"),
        )
        .with_metric(DeclaredMetric::new(ns.clone(), 1))
        .with_content_types(vec!["mittari.json".into()], vec![]);

        assert_eq!(prospectus.metrics.len(), 1);
        assert_eq!(prospectus.metrics[0].namespace, ns);
        assert_eq!(prospectus.accepted_content_types, vec!["mittari.json"]);
    }
}
