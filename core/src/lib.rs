//! mittari-core - Shared types for the mittari control plane
//!
//! This crate provides the types that are shared between the control plane
//! and out-of-process plugins (collectors, processors, publishers):
//!
//! - [`PluginId`] / [`PluginKey`] - plugin identity and its canonical key
//! - [`VersionSpec`] - a concrete version pin or "latest"
//! - [`Namespace`] / [`MetricRequest`] / [`Metric`] - the metric surface
//! - [`ConfigTable`] / [`ConfigPolicy`] - typed configuration and the
//!   rule-based policy engine that validates it
//! - [`ControlError`] - the error type, with a structured field surface
//!
//! # Why this crate exists
//!
//! Plugin authors need the identity, metric and config types to implement
//! the RPC roles, but must not depend on the control plane itself (which
//! would pull the runner, pools and supervision into every plugin build).
//! Splitting the types out keeps the dependency arrow pointing one way:
//!
//! ```text
//! mittari-core ◄── mittari-control
//!     ▲
//!     └─────────── plugin implementations
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod config;
mod error;
/// Metric namespaces, requests and samples
pub mod metric;
/// Plugin identity types
pub mod plugin;
/// Rule-based configuration policy
pub mod policy;

pub use config::{ConfigTable, ConfigValue};
pub use error::{ControlError, FieldViolation};
pub use metric::{content_type, Metric, MetricRequest, MetricValue, Namespace};
pub use plugin::{PluginId, PluginKey, PluginRole, SubscriptionKind, VersionSpec};
pub use policy::{ConfigPolicy, PolicyNode, Rule, ValueKind};
