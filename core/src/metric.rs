//! Metric namespaces, requests and samples
//!
//! A metric lives at a slash-separated namespace (`/intel/cpu/load`) and a
//! positive version. Requests name a namespace plus a [`VersionSpec`];
//! collected samples carry the concrete version they came from.

use crate::config::ConfigTable;
use crate::plugin::VersionSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reserved content-type identifiers for processor/publisher payloads.
pub mod content_type {
    /// JSON-encoded metric batches
    pub const JSON: &str = "mittari.json";
    /// Compact binary metric batches
    pub const BINARY: &str = "mittari.bin";
}

/// An ordered sequence of namespace segments.
///
/// Displayed with a leading slash: `/intel/cpu/load`. Segments never
/// contain slashes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(Vec<String>);

impl Namespace {
    /// Build a namespace from segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Namespace(segments.into_iter().map(Into::into).collect())
    }

    /// The ordered segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty (root) namespace, which prefixes everything
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` is a (possibly empty) prefix of this namespace
    pub fn starts_with(&self, prefix: &Namespace) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Namespace(Vec::new()));
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(format!("namespace '{s}' has an empty segment"));
        }
        Ok(Namespace(segments))
    }
}

impl<S: Into<String>> FromIterator<S> for Namespace {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Namespace::new(iter)
    }
}

/// A caller's request for one metric: where it lives, which version, and
/// an optional configuration table handed to the owning plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRequest {
    /// Namespace of the wanted metric
    pub namespace: Namespace,
    /// Version pin or `Latest`
    pub version: VersionSpec,
    /// Caller-supplied configuration, validated against the metric's policy
    pub config: Option<ConfigTable>,
}

impl MetricRequest {
    /// Request the latest version with no configuration
    pub fn latest(namespace: Namespace) -> Self {
        Self {
            namespace,
            version: VersionSpec::Latest,
            config: None,
        }
    }

    /// Request a concrete version with no configuration
    pub fn exact(namespace: Namespace, version: u32) -> Self {
        Self {
            namespace,
            version: VersionSpec::Exact(version),
            config: None,
        }
    }

    /// Attach a configuration table
    pub fn with_config(mut self, config: ConfigTable) -> Self {
        self.config = Some(config);
        self
    }
}

/// The value carried by a collected metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Signed integer sample
    Int(i64),
    /// Floating point sample
    Float(f64),
    /// Boolean sample
    Bool(bool),
    /// String sample
    Str(String),
}

/// One collected metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Namespace the sample belongs to
    pub namespace: Namespace,
    /// Concrete version of the metric type that produced it
    pub version: u32,
    /// Collection timestamp, nanoseconds since the Unix epoch
    pub timestamp_unix_ns: u64,
    /// The sample itself
    pub value: MetricValue,
    /// Free-form labels attached by the collector
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    /// Build a sample with no tags
    pub fn new(namespace: Namespace, version: u32, timestamp_unix_ns: u64, value: MetricValue) -> Self {
        Self {
            namespace,
            version,
            timestamp_unix_ns,
            value,
            tags: BTreeMap::new(),
        }
    }

    /// Attach a tag, returning self for chained construction
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
