//! mittari-control - Plugin control plane for the mittari telemetry framework
//!
//! Owns the lifecycle of out-of-process plugins (collectors, processors,
//! publishers) and dispatches work to them on behalf of tasks.
//!
//! # Architecture
//!
//! ```text
//! Control (facade)
//!    ├─► PluginManager ──► MetricCatalog
//!    └─► Runner ──► PoolCollection ──► Pool ──► AvailableInstance
//!                                                    │
//!                              RoleClient (collector | processor | publisher)
//! ```
//!
//! The facade validates dependencies against the catalog, binds them to
//! pools of running instances, and executes collection cycles against a
//! deadline. External concerns are trait seams: the RPC transport
//! ([`RpcClientFactory`]), process supervision ([`ProcessSupervisor`]),
//! signature validation ([`SignatureValidator`]) and event delivery
//! ([`EventSink`]).
//!
//! # Example
//!
//! ```ignore
//! use mittari_control::Control;
//! use std::sync::Arc;
//!
//! let control = Arc::new(
//!     Control::builder()
//!         .factory(grpc_factory)
//!         .supervisor(Arc::new(ExecSupervisor))
//!         .max_running_plugins(32)
//!         .build(),
//! );
//! control.start();
//! control.load(Path::new("/opt/plugins/collector-cpu")).await?;
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod catalog;
mod control;
pub mod events;
pub mod manager;
pub mod routing;
pub mod rpc;
pub mod runner;
pub mod signing;
pub mod supervisor;

pub use catalog::{MetricCatalog, MetricType, ResolvedMetric};
pub use control::{Control, ControlBuilder, PluginRequest};
pub use events::{BroadcastBus, ControlEvent, EventSink, NullSink};
pub use manager::{LoadedPlugin, PluginManager};
pub use routing::{LeastHits, RoundRobin, RoutingStrategy};
pub use rpc::cache::{CachedCollector, ResponseCache};
pub use rpc::{
    CollectorClient, DeclaredMetric, PluginClient, PluginProspectus, ProcessorClient,
    PublisherClient, RoleClient, RpcClientFactory,
};
pub use runner::pool::{AvailableInstance, HealthStatus, Pool, PoolCollection, PoolHandle};
pub use runner::{MonitorOptions, Runner, RunnerConfig};
pub use signing::{ChecksumValidator, SignatureValidator, TrustLevel, SIGNATURE_SUFFIX};
pub use supervisor::{
    ExecSupervisor, NullSupervisor, ProcessHandle, ProcessSupervisor, SpawnArgs,
};

// re-export the shared types so downstream users need one import
pub use mittari_core::{
    ConfigPolicy, ConfigTable, ConfigValue, ControlError, FieldViolation, Metric,
    MetricRequest, MetricValue, Namespace, PluginId, PluginKey, PluginRole, PolicyNode, Rule,
    SubscriptionKind, ValueKind, VersionSpec,
};
