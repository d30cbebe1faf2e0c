//! Error types for the control plane
//!
//! One error enum covers the whole surface. The `Display` message is stable
//! human text; [`ControlError::fields`] is the machine-readable surface,
//! feeding structured log output without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One failed field inside a policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Configuration key that failed
    pub field: String,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Error type for control-plane operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// The facade was used before `start`
    #[error("control plane not started")]
    NotStarted,

    /// No loaded plugin under this key
    #[error("plugin not found: {key}")]
    PluginNotFound {
        /// Requested plugin key (may name `latest`)
        key: String,
    },

    /// No catalog entry for this namespace/version
    #[error("metric not found: {namespace} version {version}")]
    MetricNotFound {
        /// Requested namespace
        namespace: String,
        /// Requested version (`latest` or a number)
        version: String,
    },

    /// A plugin with the same key is already loaded
    #[error("plugin already loaded: {key}")]
    AlreadyLoaded {
        /// Conflicting plugin key
        key: String,
    },

    /// A declared metric collides with one from another plugin
    #[error("metric conflict: {namespace} version {version} already declared by {existing}")]
    MetricConflict {
        /// Conflicting namespace
        namespace: String,
        /// Conflicting version
        version: u32,
        /// Key of the plugin that already owns the entry
        existing: String,
    },

    /// Signature validation failed under a required trust level
    #[error("invalid signature for {path}: {reason}")]
    SignatureInvalid {
        /// Plugin binary that failed validation
        path: String,
        /// Validator's reason
        reason: String,
    },

    /// An instance could not be brought up for a pool
    #[error("failed to spawn instance for {key}: {reason}")]
    SpawnFailed {
        /// Pool key
        key: String,
        /// Supervisor or factory failure
        reason: String,
    },

    /// A pool's client does not implement the requested role
    #[error("client role mismatch for {key}: wanted {wanted}, have {actual}")]
    ClientRoleMismatch {
        /// Pool key
        key: String,
        /// Role the caller needed
        wanted: String,
        /// Role the instance actually implements
        actual: String,
    },

    /// No pool exists under this key
    #[error("no pool for plugin key {key}")]
    PoolMissing {
        /// Requested pool key
        key: String,
    },

    /// The pool refused a hold because it is shutting down
    #[error("pool {key} is draining")]
    PoolDraining {
        /// Pool key
        key: String,
    },

    /// Configuration failed policy validation
    #[error("config policy violations for {subject}: {}", format_violations(.violations))]
    PolicyViolation {
        /// What was being configured (metric namespace or plugin key)
        subject: String,
        /// Every failed field
        violations: Vec<FieldViolation>,
    },

    /// An RPC did not complete before its deadline
    #[error("deadline of {deadline_ms}ms exceeded")]
    Deadline {
        /// The deadline that expired, in milliseconds
        deadline_ms: u64,
    },

    /// The transport failed underneath an RPC
    #[error("transport error: {message}")]
    Transport {
        /// Transport-level failure description
        message: String,
    },

    /// A rollback failed after a failed mutation; both causes preserved
    #[error("rollback failed: original: {original}; rollback: {rollback}")]
    Composite {
        /// The failure that triggered the rollback
        original: Box<ControlError>,
        /// The failure of the rollback itself
        rollback: Box<ControlError>,
    },
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(FieldViolation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    /// Stable snake_case kind tag, one per variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::NotStarted => "not_started",
            ControlError::PluginNotFound { .. } | ControlError::MetricNotFound { .. } => {
                "not_found"
            }
            ControlError::AlreadyLoaded { .. } => "already_loaded",
            ControlError::MetricConflict { .. } => "metric_conflict",
            ControlError::SignatureInvalid { .. } => "signature_invalid",
            ControlError::SpawnFailed { .. } => "spawn_failed",
            ControlError::ClientRoleMismatch { .. } => "client_role_mismatch",
            ControlError::PoolMissing { .. } => "pool_missing",
            ControlError::PoolDraining { .. } => "pool_draining",
            ControlError::PolicyViolation { .. } => "policy_violation",
            ControlError::Deadline { .. } => "deadline",
            ControlError::Transport { .. } => "transport",
            ControlError::Composite { .. } => "composite",
        }
    }

    /// Structured field map for logging. The message text is stable but
    /// free-form; these pairs are the surface tooling should match on.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("kind", self.kind().to_string())];
        match self {
            ControlError::NotStarted => {}
            ControlError::PluginNotFound { key } => {
                fields.push(("plugin", key.clone()));
            }
            ControlError::MetricNotFound { namespace, version } => {
                fields.push(("namespace", namespace.clone()));
                fields.push(("version", version.clone()));
            }
            ControlError::AlreadyLoaded { key } => {
                fields.push(("plugin", key.clone()));
            }
            ControlError::MetricConflict {
                namespace,
                version,
                existing,
            } => {
                fields.push(("namespace", namespace.clone()));
                fields.push(("version", version.to_string()));
                fields.push(("existing", existing.clone()));
            }
            ControlError::SignatureInvalid { path, reason } => {
                fields.push(("path", path.clone()));
                fields.push(("reason", reason.clone()));
            }
            ControlError::SpawnFailed { key, reason } => {
                fields.push(("plugin", key.clone()));
                fields.push(("reason", reason.clone()));
            }
            ControlError::ClientRoleMismatch { key, wanted, actual } => {
                fields.push(("plugin", key.clone()));
                fields.push(("wanted", wanted.clone()));
                fields.push(("actual", actual.clone()));
            }
            ControlError::PoolMissing { key } | ControlError::PoolDraining { key } => {
                fields.push(("plugin", key.clone()));
            }
            ControlError::PolicyViolation { subject, violations } => {
                fields.push(("subject", subject.clone()));
                fields.push(("violations", format_violations(violations)));
            }
            ControlError::Deadline { deadline_ms } => {
                fields.push(("deadline_ms", deadline_ms.to_string()));
            }
            ControlError::Transport { message } => {
                fields.push(("message", message.clone()));
            }
            ControlError::Composite { original, rollback } => {
                fields.push(("original", original.to_string()));
                fields.push(("rollback", rollback.to_string()));
            }
        }
        fields
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_share_a_kind() {
        let plugin = ControlError::PluginNotFound {
            key: "collector:cpu:1".into(),
        };
        let metric = ControlError::MetricNotFound {
            namespace: "/intel/cpu/load".into(),
            version: "latest".into(),
        };
        assert_eq!(plugin.kind(), "not_found");
        assert_eq!(metric.kind(), "not_found");
    }

    #[test]
    fn policy_violation_message_lists_fields() {
        let err = ControlError::PolicyViolation {
            subject: "/intel/cpu/load".into(),
            violations: vec![
                FieldViolation {
                    field: "user".into(),
                    message: "required string is missing".into(),
                },
                FieldViolation {
                    field: "port".into(),
                    message: "expected integer, got string".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("user: required string is missing"));
        assert!(msg.contains("port: expected integer, got string"));
    }

    #[test]
    fn composite_preserves_both_causes() {
        let err = ControlError::Composite {
            original: Box::new(ControlError::PluginNotFound {
                key: "collector:mem:1".into(),
            }),
            rollback: Box::new(ControlError::Transport {
                message: "connection reset".into(),
            }),
        };
        let fields = err.fields();
        assert!(fields.iter().any(|(k, v)| *k == "original" && v.contains("collector:mem:1")));
        assert!(fields.iter().any(|(k, v)| *k == "rollback" && v.contains("connection reset")));
    }

    #[test]
    fn fields_always_carry_the_kind() {
        let err = ControlError::Deadline { deadline_ms: 500 };
        let fields = err.fields();
        assert_eq!(fields[0], ("kind", "deadline".to_string()));
        assert!(fields.iter().any(|(k, v)| *k == "deadline_ms" && v == "500"));
    }
}
