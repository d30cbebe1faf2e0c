//! Configuration policy engine
//!
//! Plugins declare, per namespace, which configuration keys they accept:
//! whether a key is required, what type it must be, and an optional default.
//! `process` validates a caller's table against those rules and returns a
//! new table with defaults applied — the input is never mutated. All rule
//! failures for a table are aggregated, not just the first.

use crate::config::{ConfigTable, ConfigValue};
use crate::error::FieldViolation;
use crate::metric::Namespace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Expected type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// UTF-8 string
    Str,
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// Boolean
    Bool,
}

impl ValueKind {
    /// True if `value` has this kind
    pub fn matches(&self, value: &ConfigValue) -> bool {
        matches!(
            (self, value),
            (ValueKind::Str, ConfigValue::Str(_))
                | (ValueKind::Int, ConfigValue::Int(_))
                | (ValueKind::Float, ConfigValue::Float(_))
                | (ValueKind::Bool, ConfigValue::Bool(_))
        )
    }

    /// Human-readable name used in violation messages
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::Int => "integer",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
        }
    }
}

/// A single configuration rule: one key's type, requiredness and default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Expected value type
    pub kind: ValueKind,
    /// Whether the key must be present (after defaults are applied)
    pub required: bool,
    /// Value inserted when the caller omits the key
    pub default: Option<ConfigValue>,
}

impl Rule {
    /// A required key of the given type
    pub fn required(kind: ValueKind) -> Self {
        Self {
            kind,
            required: true,
            default: None,
        }
    }

    /// An optional key of the given type
    pub fn optional(kind: ValueKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
        }
    }

    /// An optional key with a default value
    pub fn with_default(kind: ValueKind, default: impl Into<ConfigValue>) -> Self {
        Self {
            kind,
            required: false,
            default: Some(default.into()),
        }
    }
}

/// The rules for one namespace (or for the plugin as a whole).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyNode {
    rules: BTreeMap<String, Rule>,
}

impl PolicyNode {
    /// Node with no rules; `process` passes tables through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, returning self for chained construction
    pub fn with_rule(mut self, key: impl Into<String>, rule: Rule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    /// True if the node carries no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Validate `table` against the rules.
    ///
    /// On success returns a new table: the caller's entries plus defaults
    /// for omitted optional keys. On failure returns every violation found.
    pub fn process(&self, table: &ConfigTable) -> Result<ConfigTable, Vec<FieldViolation>> {
        let mut out = table.clone();
        let mut violations = Vec::new();

        for (key, rule) in &self.rules {
            match table.get(key) {
                Some(value) => {
                    if !rule.kind.matches(value) {
                        violations.push(FieldViolation {
                            field: key.clone(),
                            message: format!(
                                "expected {}, got {}",
                                rule.kind.name(),
                                value.type_name()
                            ),
                        });
                    }
                }
                None => {
                    if let Some(default) = &rule.default {
                        out.insert(key.clone(), default.clone());
                    } else if rule.required {
                        violations.push(FieldViolation {
                            field: key.clone(),
                            message: format!("required {} is missing", rule.kind.name()),
                        });
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(out)
        } else {
            Err(violations)
        }
    }
}

/// A plugin's full configuration policy: a plugin-level root node plus
/// per-namespace nodes for the metrics it declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPolicy {
    root: PolicyNode,
    nodes: BTreeMap<Namespace, PolicyNode>,
}

impl ConfigPolicy {
    /// Empty policy: everything validates
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plugin-level root node
    pub fn with_root(mut self, node: PolicyNode) -> Self {
        self.root = node;
        self
    }

    /// Attach a node for one namespace
    pub fn with_node(mut self, namespace: Namespace, node: PolicyNode) -> Self {
        self.nodes.insert(namespace, node);
        self
    }

    /// The plugin-level node, validated on plugin subscriptions
    pub fn root(&self) -> &PolicyNode {
        &self.root
    }

    /// The node governing `namespace`: an exact per-namespace node if one
    /// exists, otherwise the root node
    pub fn node(&self, namespace: &Namespace) -> &PolicyNode {
        self.nodes.get(namespace).unwrap_or(&self.root)
    }

    /// True if no node anywhere carries a rule
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.nodes.values().all(PolicyNode::is_empty)
    }
}
