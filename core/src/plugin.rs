//! Plugin identity types
//!
//! A plugin is identified by the triple `(role, name, version)`. The
//! canonical string form `role:name:version` is the key used everywhere a
//! plugin is looked up: the loaded-plugin table, the metric catalog and the
//! runner's pool collection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three roles a plugin can fill in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginRole {
    /// Gathers metrics from the host
    Collector,
    /// Transforms a metric payload in flight
    Processor,
    /// Delivers a metric payload to a destination
    Publisher,
}

impl PluginRole {
    /// Canonical lowercase name, as used inside plugin keys
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginRole::Collector => "collector",
            PluginRole::Processor => "processor",
            PluginRole::Publisher => "publisher",
        }
    }
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collector" => Ok(PluginRole::Collector),
            "processor" => Ok(PluginRole::Processor),
            "publisher" => Ok(PluginRole::Publisher),
            other => Err(format!("unknown plugin role '{other}'")),
        }
    }
}

/// Identity of a loaded plugin: role, name and a concrete positive version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginId {
    /// Pipeline role
    pub role: PluginRole,
    /// Plugin name, unique per role
    pub name: String,
    /// Concrete version, always >= 1
    pub version: u32,
}

impl PluginId {
    /// Create an identity. `version` must be a concrete version (>= 1);
    /// "latest" is expressed with [`VersionSpec::Latest`], never stored here.
    pub fn new(role: PluginRole, name: impl Into<String>, version: u32) -> Self {
        Self {
            role,
            name: name.into(),
            version,
        }
    }

    /// Canonical `role:name:version` key
    pub fn key(&self) -> PluginKey {
        PluginKey(format!("{}:{}:{}", self.role, self.name, self.version))
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.role, self.name, self.version)
    }
}

/// Canonical `role:name:version` string identifying a plugin.
///
/// Keys index the loaded-plugin table and the pool collection. The inner
/// string is canonical by construction: build keys through
/// [`PluginId::key`] or [`PluginKey::new`], not by formatting ad hoc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey(String);

impl PluginKey {
    /// Build a key from its parts
    pub fn new(role: PluginRole, name: &str, version: u32) -> Self {
        PluginId::new(role, name, version).key()
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the key back into its identity triple
    pub fn to_id(&self) -> Result<PluginId, String> {
        let mut parts = self.0.splitn(3, ':');
        let role = parts
            .next()
            .ok_or_else(|| format!("malformed plugin key '{}'", self.0))?
            .parse::<PluginRole>()?;
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| format!("malformed plugin key '{}'", self.0))?;
        let version = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| format!("malformed plugin key '{}'", self.0))?;
        Ok(PluginId::new(role, name, version))
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A requested plugin version: a concrete pin or "whatever is newest".
///
/// Resolvers always hand back the concrete version they bound to, so a
/// caller that asked for `Latest` can record what it actually got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionSpec {
    /// Exactly this version
    Exact(u32),
    /// The greatest version currently available
    Latest,
}

impl VersionSpec {
    /// The pinned version, if this is an exact request
    pub fn exact(&self) -> Option<u32> {
        match self {
            VersionSpec::Exact(v) => Some(*v),
            VersionSpec::Latest => None,
        }
    }

    /// True for [`VersionSpec::Latest`]
    pub fn is_latest(&self) -> bool {
        matches!(self, VersionSpec::Latest)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Exact(v) => write!(f, "{v}"),
            VersionSpec::Latest => f.write_str("latest"),
        }
    }
}

impl From<u32> for VersionSpec {
    fn from(v: u32) -> Self {
        VersionSpec::Exact(v)
    }
}

/// How a task is subscribed to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// The task pinned a concrete version
    Bound,
    /// The task asked for "latest"; the subscription follows version
    /// promotions when a newer plugin loads
    Unbound,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::Bound => f.write_str("bound"),
            SubscriptionKind::Unbound => f.write_str("unbound"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_is_canonical_triple() {
        let id = PluginId::new(PluginRole::Collector, "cpu", 2);
        assert_eq!(id.key().as_str(), "collector:cpu:2");
        assert_eq!(id.to_string(), "collector:cpu:2");
    }

    #[test]
    fn key_round_trips_to_id() {
        let key = PluginKey::new(PluginRole::Publisher, "influxdb", 7);
        let id = key.to_id().unwrap();
        assert_eq!(id.role, PluginRole::Publisher);
        assert_eq!(id.name, "influxdb");
        assert_eq!(id.version, 7);
        assert_eq!(id.key(), key);
    }

    #[test]
    fn key_parse_rejects_garbage() {
        assert!(PluginKey("collector".to_string()).to_id().is_err());
        assert!(PluginKey("collector:cpu".to_string()).to_id().is_err());
        assert!(PluginKey("collector:cpu:zero".to_string()).to_id().is_err());
        assert!(PluginKey("collector:cpu:0".to_string()).to_id().is_err());
        assert!(PluginKey("driver:cpu:1".to_string()).to_id().is_err());
    }

    #[test]
    fn role_parses_canonical_names() {
        assert_eq!("collector".parse::<PluginRole>().unwrap(), PluginRole::Collector);
        assert_eq!("processor".parse::<PluginRole>().unwrap(), PluginRole::Processor);
        assert_eq!("publisher".parse::<PluginRole>().unwrap(), PluginRole::Publisher);
        assert!("Collector".parse::<PluginRole>().is_err());
    }

    #[test]
    fn version_spec_exact_and_latest() {
        assert_eq!(VersionSpec::Exact(3).exact(), Some(3));
        assert_eq!(VersionSpec::Latest.exact(), None);
        assert!(VersionSpec::Latest.is_latest());
        assert_eq!(VersionSpec::from(5), VersionSpec::Exact(5));
        assert_eq!(VersionSpec::Latest.to_string(), "latest");
        assert_eq!(VersionSpec::Exact(1).to_string(), "1");
    }
}
