//! In-process plugins for tests and single-binary deployments
//!
//! The loopback factory keeps prospectuses and clients in a map instead of
//! talking to real processes. Scripted clients emulate the transport
//! contract, including deadline behavior, so control-plane tests exercise
//! the same paths a gRPC deployment would.

use super::{
    CollectorClient, PluginClient, PluginProspectus, ProcessorClient, PublisherClient,
    RoleClient, RpcClientFactory,
};
use crate::supervisor::ProcessHandle;
use async_trait::async_trait;
use bytes::Bytes;
use mittari_core::{ConfigTable, ControlError, Metric, MetricRequest, PluginId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Factory serving plugins registered in memory.
#[derive(Default)]
pub struct LoopbackFactory {
    by_path: RwLock<HashMap<PathBuf, PluginProspectus>>,
    by_id: RwLock<HashMap<PluginId, RoleClient>>,
}

impl LoopbackFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin: `introspect` answers for its spawn path and
    /// `connect` answers for its identity.
    pub fn register(&self, prospectus: PluginProspectus, client: RoleClient) {
        self.by_id.write().insert(prospectus.id.clone(), client);
        self.by_path
            .write()
            .insert(prospectus.spawn.path.clone(), prospectus);
    }

    /// Forget a plugin, making later connects fail
    pub fn unregister(&self, id: &PluginId) {
        self.by_id.write().remove(id);
        self.by_path.write().retain(|_, p| p.id != *id);
    }
}

#[async_trait]
impl RpcClientFactory for LoopbackFactory {
    async fn introspect(&self, path: &Path) -> Result<PluginProspectus, ControlError> {
        self.by_path
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ControlError::Transport {
                message: format!("no plugin registered at {}", path.display()),
            })
    }

    async fn connect(
        &self,
        id: &PluginId,
        _process: &Arc<dyn ProcessHandle>,
    ) -> Result<RoleClient, ControlError> {
        self.by_id
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::Transport {
                message: format!("no client registered for {id}"),
            })
    }
}

/// Shared ping/latency plumbing for the scripted clients.
#[derive(Debug)]
struct ScriptBase {
    latency: Duration,
    ping_ok: AtomicBool,
    pings: AtomicU64,
}

impl Default for ScriptBase {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptBase {
    fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            ping_ok: AtomicBool::new(true),
            pings: AtomicU64::new(0),
        }
    }

    async fn ping(&self) -> Result<(), ControlError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        if self.ping_ok.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ControlError::Transport {
                message: "ping refused".to_string(),
            })
        }
    }

    /// Emulate the transport's deadline contract: a call slower than the
    /// deadline fails with `Deadline` once the deadline elapses.
    async fn run_with_deadline(&self, deadline: Duration) -> Result<(), ControlError> {
        if self.latency > deadline {
            tokio::time::sleep(deadline).await;
            return Err(ControlError::Deadline {
                deadline_ms: deadline.as_millis() as u64,
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }
}

/// Collector whose responses are scripted up front.
#[derive(Debug)]
pub struct ScriptedCollector {
    base: ScriptBase,
    response: Mutex<Result<Vec<Metric>, ControlError>>,
    calls: AtomicU64,
}

impl ScriptedCollector {
    /// Always return these metrics
    pub fn returning(metrics: Vec<Metric>) -> Self {
        Self {
            base: ScriptBase::new(),
            response: Mutex::new(Ok(metrics)),
            calls: AtomicU64::new(0),
        }
    }

    /// Always fail with this error
    pub fn failing(err: ControlError) -> Self {
        Self {
            base: ScriptBase::new(),
            response: Mutex::new(Err(err)),
            calls: AtomicU64::new(0),
        }
    }

    /// Delay each collect by `latency` (subject to the caller's deadline)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.base.latency = latency;
        self
    }

    /// Replace the scripted response
    pub fn set_response(&self, response: Result<Vec<Metric>, ControlError>) {
        *self.response.lock() = response;
    }

    /// Make future pings succeed or fail
    pub fn set_ping_ok(&self, ok: bool) {
        self.base.ping_ok.store(ok, Ordering::Relaxed);
    }

    /// Number of collect calls served
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of pings served
    pub fn pings(&self) -> u64 {
        self.base.pings.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PluginClient for ScriptedCollector {
    async fn ping(&self) -> Result<(), ControlError> {
        self.base.ping().await
    }
}

#[async_trait]
impl CollectorClient for ScriptedCollector {
    async fn collect(
        &self,
        _requests: &[MetricRequest],
        deadline: Duration,
    ) -> Result<Vec<Metric>, ControlError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.base.run_with_deadline(deadline).await?;
        self.response.lock().clone()
    }
}

/// What a scripted processor does with its input.
#[derive(Debug, Clone)]
pub enum ProcessorScript {
    /// Return the input unchanged
    Echo,
    /// Return a fixed content type and body
    Fixed(String, Bytes),
    /// Fail with this error
    Fail(ControlError),
}

/// Processor whose behavior is scripted up front.
#[derive(Debug)]
pub struct ScriptedProcessor {
    base: ScriptBase,
    script: Mutex<ProcessorScript>,
    calls: AtomicU64,
}

impl ScriptedProcessor {
    /// Build with the given script
    pub fn new(script: ProcessorScript) -> Self {
        Self {
            base: ScriptBase::new(),
            script: Mutex::new(script),
            calls: AtomicU64::new(0),
        }
    }

    /// A processor that returns its input unchanged
    pub fn echo() -> Self {
        Self::new(ProcessorScript::Echo)
    }

    /// Delay each call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.base.latency = latency;
        self
    }

    /// Number of process calls served
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PluginClient for ScriptedProcessor {
    async fn ping(&self) -> Result<(), ControlError> {
        self.base.ping().await
    }
}

#[async_trait]
impl ProcessorClient for ScriptedProcessor {
    async fn process(
        &self,
        content_type: &str,
        content: Bytes,
        _config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(String, Bytes), ControlError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.base.run_with_deadline(deadline).await?;
        match &*self.script.lock() {
            ProcessorScript::Echo => Ok((content_type.to_string(), content)),
            ProcessorScript::Fixed(ct, body) => Ok((ct.clone(), body.clone())),
            ProcessorScript::Fail(err) => Err(err.clone()),
        }
    }
}

/// Publisher that records everything published to it.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    base: ScriptBase,
    published: Mutex<Vec<(String, Bytes)>>,
    fail_with: Mutex<Option<ControlError>>,
}

impl RecordingPublisher {
    /// Publisher that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future publishes fail with this error
    pub fn set_failure(&self, err: Option<ControlError>) {
        *self.fail_with.lock() = err;
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl PluginClient for RecordingPublisher {
    async fn ping(&self) -> Result<(), ControlError> {
        self.base.ping().await
    }
}

#[async_trait]
impl PublisherClient for RecordingPublisher {
    async fn publish(
        &self,
        content_type: &str,
        content: Bytes,
        _config: &ConfigTable,
        deadline: Duration,
    ) -> Result<(), ControlError> {
        self.base.run_with_deadline(deadline).await?;
        if let Some(err) = self.fail_with.lock().clone() {
            return Err(err);
        }
        self.published
            .lock()
            .push((content_type.to_string(), content));
        Ok(())
    }
}
