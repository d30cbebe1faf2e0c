//! Configuration tables for plugins and metrics
//!
//! Configuration flows through the control plane as a flat table of typed
//! values. Tables are treated as immutable at API boundaries: the policy
//! engine returns a processed copy and never mutates the caller's table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// UTF-8 string
    Str(String),
    /// Signed integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Boolean
    Bool(bool),
}

impl ConfigValue {
    /// Name of the value's type, used in policy violation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Str(_) => "string",
            ConfigValue::Int(_) => "integer",
            ConfigValue::Float(_) => "float",
            ConfigValue::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<f64> for ConfigValue {
    fn from(x: f64) -> Self {
        ConfigValue::Float(x)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

/// A flat key → value configuration table.
///
/// Backed by a `BTreeMap` so iteration order is deterministic, which keeps
/// policy violation output and logs stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigTable(BTreeMap<String, ConfigValue>);

impl ConfigTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning self for chained construction
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// True if the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `other` on top of this table, returning a new table.
    /// Keys present in `other` win.
    pub fn merged(&self, other: &ConfigTable) -> ConfigTable {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.insert(k, v.clone());
        }
        out
    }
}

impl FromIterator<(String, ConfigValue)> for ConfigTable {
    fn from_iter<T: IntoIterator<Item = (String, ConfigValue)>>(iter: T) -> Self {
        ConfigTable(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn table_builder_and_lookup() {
        let table = ConfigTable::new()
            .with("interval", 10i64)
            .with("label", "host-a")
            .with("verbose", true);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get("interval"), Some(&ConfigValue::Int(10)));
        assert_eq!(table.get("label"), Some(&ConfigValue::Str("host-a".into())));
        assert!(table.contains("verbose"));
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn merged_prefers_overlay() {
        let base = ConfigTable::new().with("a", 1i64).with("b", 2i64);
        let overlay = ConfigTable::new().with("b", 20i64).with("c", 30i64);

        let merged = base.merged(&overlay);
        assert_eq!(merged.get("a"), Some(&ConfigValue::Int(1)));
        assert_eq!(merged.get("b"), Some(&ConfigValue::Int(20)));
        assert_eq!(merged.get("c"), Some(&ConfigValue::Int(30)));
        // input untouched
        assert_eq!(base.get("b"), Some(&ConfigValue::Int(2)));
    }

    #[test]
    fn value_type_names() {
        assert_eq!(ConfigValue::from("x").type_name(), "string");
        assert_eq!(ConfigValue::from(1i64).type_name(), "integer");
        assert_eq!(ConfigValue::from(1.5f64).type_name(), "float");
        assert_eq!(ConfigValue::from(false).type_name(), "bool");
    }

    #[test]
    fn table_serializes_flat() {
        let table = ConfigTable::new().with("port", 8080i64).with("host", "localhost");
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"host":"localhost","port":8080}"#);
    }
}
