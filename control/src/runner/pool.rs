//! Instance pools
//!
//! For every plugin key the runner keeps a [`Pool`] of live instances plus
//! the subscriptions that justify their existence. Dispatch paths take a
//! [`PoolHandle`] before touching instances; a pool cannot finish draining
//! while any handle is alive, and a draining pool refuses new handles.

use crate::routing::RoutingStrategy;
use crate::rpc::RoleClient;
use crate::supervisor::ProcessHandle;
use mittari_core::{ControlError, PluginKey, SubscriptionKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Lifecycle state of one plugin instance.
///
/// `Starting → Ready → {Unresponsive ↔ Ready} → Terminated`; Terminated is
/// absorbing. Only `Ready` instances are ever selected for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    /// Spawned but not yet confirmed healthy
    Starting = 0,
    /// Serving traffic
    Ready = 1,
    /// Failing health probes; may recover
    Unresponsive = 2,
    /// Gone for good
    Terminated = 3,
}

impl HealthStatus {
    fn from_u8(raw: u8) -> HealthStatus {
        match raw {
            0 => HealthStatus::Starting,
            1 => HealthStatus::Ready,
            2 => HealthStatus::Unresponsive,
            _ => HealthStatus::Terminated,
        }
    }
}

fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// One live plugin instance inside a pool.
pub struct AvailableInstance {
    id: u64,
    key: PluginKey,
    client: RoleClient,
    process: Arc<dyn ProcessHandle>,
    health: AtomicU8,
    consecutive_failures: AtomicU32,
    hits: AtomicU64,
    last_hit_unix_ns: AtomicU64,
}

impl AvailableInstance {
    pub(crate) fn new(
        id: u64,
        key: PluginKey,
        client: RoleClient,
        process: Arc<dyn ProcessHandle>,
    ) -> Self {
        Self {
            id,
            key,
            client,
            process,
            health: AtomicU8::new(HealthStatus::Starting as u8),
            consecutive_failures: AtomicU32::new(0),
            hits: AtomicU64::new(0),
            last_hit_unix_ns: AtomicU64::new(0),
        }
    }

    /// Instance id, unique within the runner's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the plugin this instance runs
    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    /// The typed client to this instance
    pub fn client(&self) -> &RoleClient {
        &self.client
    }

    /// The underlying process handle
    pub fn process(&self) -> &Arc<dyn ProcessHandle> {
        &self.process
    }

    /// Current health state
    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Number of dispatches routed to this instance
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Time of the last dispatch, nanoseconds since the Unix epoch; 0 if never hit
    pub fn last_hit_unix_ns(&self) -> u64 {
        self.last_hit_unix_ns.load(Ordering::Relaxed)
    }

    /// Record a dispatch: bump the hit counter and advance the last-hit
    /// timestamp. Lock-free; concurrent dispatches race only on which of
    /// two near-identical timestamps wins, and `fetch_max` keeps it
    /// monotone.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit_unix_ns
            .fetch_max(unix_now_ns(), Ordering::Relaxed);
    }

    /// Move to `next`, unless already terminated (absorbing).
    /// Returns the state the instance is in afterwards.
    pub(crate) fn transition(&self, next: HealthStatus) -> HealthStatus {
        let mut current = self.health.load(Ordering::Acquire);
        loop {
            if HealthStatus::from_u8(current) == HealthStatus::Terminated {
                return HealthStatus::Terminated;
            }
            match self.health.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// A successful health probe: reset the failure streak, promote to Ready
    pub(crate) fn probe_succeeded(&self) -> HealthStatus {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.transition(HealthStatus::Ready)
    }

    /// A failed health probe: returns the new consecutive-failure count
    pub(crate) fn probe_failed(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for AvailableInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailableInstance")
            .field("id", &self.id)
            .field("key", &self.key.as_str())
            .field("health", &self.health())
            .field("hits", &self.hits())
            .finish()
    }
}

struct PoolState {
    instances: Vec<Arc<AvailableInstance>>,
    subscriptions: HashMap<u64, SubscriptionKind>,
    idle_since: Option<tokio::time::Instant>,
}

/// Hold bookkeeping, shared with outstanding [`PoolHandle`]s so a handle
/// can release without referencing the pool itself.
struct HoldCore {
    state: Mutex<HoldState>,
    released: Notify,
}

struct HoldState {
    holds: usize,
    draining: bool,
}

/// Live instances of one plugin key plus their subscriptions.
pub struct Pool {
    key: PluginKey,
    state: Mutex<PoolState>,
    holds: Arc<HoldCore>,
    generation: AtomicU64,
}

impl Pool {
    fn new(key: PluginKey) -> Self {
        Self {
            key,
            state: Mutex::new(PoolState {
                instances: Vec::new(),
                subscriptions: HashMap::new(),
                idle_since: Some(tokio::time::Instant::now()),
            }),
            holds: Arc::new(HoldCore {
                state: Mutex::new(HoldState {
                    holds: 0,
                    draining: false,
                }),
                released: Notify::new(),
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// The plugin key this pool serves
    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    /// Monotone counter bumped on every membership or subscription change
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Register `task_id` with the given kind. Re-subscribing overwrites
    /// the kind; a bound subscription wins over an unbound one.
    pub fn subscribe(&self, task_id: u64, kind: SubscriptionKind) {
        let mut state = self.state.lock();
        match state.subscriptions.get(&task_id) {
            Some(SubscriptionKind::Bound) if kind == SubscriptionKind::Unbound => {}
            _ => {
                state.subscriptions.insert(task_id, kind);
            }
        }
        state.idle_since = None;
        drop(state);
        self.bump();
    }

    /// Drop `task_id`'s subscription. Returns its kind if it was present.
    pub fn unsubscribe(&self, task_id: u64) -> Option<SubscriptionKind> {
        let mut state = self.state.lock();
        let removed = state.subscriptions.remove(&task_id);
        if state.subscriptions.is_empty() && removed.is_some() {
            state.idle_since = Some(tokio::time::Instant::now());
        }
        drop(state);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Number of distinct subscribed tasks
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Subscription kind for one task
    pub fn subscription(&self, task_id: u64) -> Option<SubscriptionKind> {
        self.state.lock().subscriptions.get(&task_id).copied()
    }

    /// Take every unbound subscriber out of the table, for promotion to a
    /// newer version's pool
    pub(crate) fn take_unbound(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let unbound: Vec<u64> = state
            .subscriptions
            .iter()
            .filter(|(_, kind)| **kind == SubscriptionKind::Unbound)
            .map(|(task, _)| *task)
            .collect();
        for task in &unbound {
            state.subscriptions.remove(task);
        }
        if state.subscriptions.is_empty() && !unbound.is_empty() {
            state.idle_since = Some(tokio::time::Instant::now());
        }
        drop(state);
        if !unbound.is_empty() {
            self.bump();
        }
        unbound
    }

    /// How many instances this pool should keep ready: one per distinct
    /// bound subscriber, plus one shared instance if anyone subscribed
    /// unbound, floor one while the pool exists at all.
    pub fn target_size(&self) -> usize {
        if self.is_draining() {
            return 0;
        }
        let state = self.state.lock();
        let bound = state
            .subscriptions
            .values()
            .filter(|kind| **kind == SubscriptionKind::Bound)
            .count();
        let unbound = usize::from(state
            .subscriptions
            .values()
            .any(|kind| *kind == SubscriptionKind::Unbound));
        (bound + unbound).max(1)
    }

    /// How long the pool has been without subscribers, if it is idle
    pub fn idle_for(&self) -> Option<Duration> {
        self.state
            .lock()
            .idle_since
            .map(|since| since.elapsed())
    }

    /// Acquire a hold. Fails with [`ControlError::PoolDraining`] once a
    /// drain has begun; callers re-resolve and retry.
    pub fn hold(&self) -> Result<PoolHandle, ControlError> {
        let mut holds = self.holds.state.lock();
        if holds.draining {
            return Err(ControlError::PoolDraining {
                key: self.key.to_string(),
            });
        }
        holds.holds += 1;
        Ok(PoolHandle {
            core: Arc::clone(&self.holds),
        })
    }

    /// Current hold depth
    pub fn holds(&self) -> usize {
        self.holds.state.lock().holds
    }

    /// True once a drain has begun
    pub fn is_draining(&self) -> bool {
        self.holds.state.lock().draining
    }

    /// Select one ready instance via `strategy`. Instances in any other
    /// state are invisible to the strategy.
    pub fn select(&self, strategy: &dyn RoutingStrategy) -> Option<Arc<AvailableInstance>> {
        let ready: Vec<Arc<AvailableInstance>> = self
            .state
            .lock()
            .instances
            .iter()
            .filter(|instance| instance.health() == HealthStatus::Ready)
            .cloned()
            .collect();
        strategy.select(&self.key, &ready)
    }

    /// All instances, regardless of state
    pub fn instances(&self) -> Vec<Arc<AvailableInstance>> {
        self.state.lock().instances.clone()
    }

    /// Number of instances currently Ready
    pub fn ready_count(&self) -> usize {
        self.state
            .lock()
            .instances
            .iter()
            .filter(|instance| instance.health() == HealthStatus::Ready)
            .count()
    }

    /// Number of instances not yet terminated (Starting/Ready/Unresponsive)
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .instances
            .iter()
            .filter(|instance| instance.health() != HealthStatus::Terminated)
            .count()
    }

    pub(crate) fn add_instance(&self, instance: Arc<AvailableInstance>) {
        self.state.lock().instances.push(instance);
        self.bump();
    }

    pub(crate) fn remove_instance(&self, id: u64) -> Option<Arc<AvailableInstance>> {
        let mut state = self.state.lock();
        let position = state.instances.iter().position(|i| i.id() == id)?;
        let removed = state.instances.remove(position);
        drop(state);
        self.bump();
        Some(removed)
    }

    /// Drain the pool: refuse new holds, wait for outstanding holds to be
    /// released, then terminate every instance. The caller removes the
    /// pool from its collection afterwards.
    pub async fn drain(&self) -> Vec<ControlError> {
        {
            let mut holds = self.holds.state.lock();
            holds.draining = true;
        }
        self.bump();

        loop {
            // register for the wakeup before re-checking, so a release
            // between the check and the await is not missed
            let released = self.holds.released.notified();
            if self.holds.state.lock().holds == 0 {
                break;
            }
            debug!(pool = %self.key, holds = self.holds(), "drain waiting on holds");
            released.await;
        }

        let instances = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.instances)
        };

        let mut errors = Vec::new();
        for instance in instances {
            instance.transition(HealthStatus::Terminated);
            if let Err(e) = instance.process().kill().await {
                warn!(pool = %self.key, instance = instance.id(), error = %e, "kill failed during drain");
                errors.push(e);
            }
        }
        debug!(pool = %self.key, "pool drained");
        errors
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.key.as_str())
            .field("subscribers", &self.subscriber_count())
            .field("holds", &self.holds())
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Scoped hold on a pool. The pool cannot finish draining while any handle
/// is alive; dropping the handle is the release, so every exit path (a
/// success, an error, a panic) releases exactly once.
pub struct PoolHandle {
    core: Arc<HoldCore>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        let mut holds = self.core.state.lock();
        holds.holds = holds.holds.saturating_sub(1);
        let none_left = holds.holds == 0;
        drop(holds);
        if none_left {
            self.core.released.notify_waiters();
        }
    }
}

/// All pools, keyed by plugin key.
#[derive(Default)]
pub struct PoolCollection {
    pools: RwLock<HashMap<PluginKey, Arc<Pool>>>,
}

impl PoolCollection {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `key`, creating an empty one if absent
    pub fn get_or_create(&self, key: &PluginKey) -> Arc<Pool> {
        if let Some(pool) = self.pools.read().get(key) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(
            pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Pool::new(key.clone()))),
        )
    }

    /// The pool for `key`, if one exists
    pub fn get(&self, key: &PluginKey) -> Option<Arc<Pool>> {
        self.pools.read().get(key).map(Arc::clone)
    }

    /// Remove the pool for `key`; done after a drain completes
    pub fn remove(&self, key: &PluginKey) -> Option<Arc<Pool>> {
        self.pools.write().remove(key)
    }

    /// Every pool, in no particular order
    pub fn all(&self) -> Vec<Arc<Pool>> {
        self.pools.read().values().map(Arc::clone).collect()
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// True if no pool exists
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}
