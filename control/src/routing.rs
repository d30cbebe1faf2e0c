//! Routing strategies
//!
//! A strategy picks one instance out of a pool's ready set. The runner
//! holds a single strategy, chosen at construction and never swapped while
//! subscriptions are live. Strategies only ever see ready instances; the
//! pool filters before delegating.

use crate::runner::pool::AvailableInstance;
use mittari_core::PluginKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Selects one instance from a pool's ready set.
pub trait RoutingStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Pick an instance, or `None` when the ready set is empty
    fn select(
        &self,
        key: &PluginKey,
        ready: &[Arc<AvailableInstance>],
    ) -> Option<Arc<AvailableInstance>>;
}

/// Rotates through ready instances, keeping a cursor per pool key.
#[derive(Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<PluginKey, usize>>,
}

impl RoundRobin {
    /// Fresh strategy with all cursors at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &self,
        key: &PluginKey,
        ready: &[Arc<AvailableInstance>],
    ) -> Option<Arc<AvailableInstance>> {
        if ready.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(key.clone()).or_insert(0);
        let selected = Arc::clone(&ready[*cursor % ready.len()]);
        *cursor = cursor.wrapping_add(1);
        Some(selected)
    }
}

/// Prefers the instance with the fewest dispatches so far.
#[derive(Debug, Default)]
pub struct LeastHits;

impl LeastHits {
    /// Strategy instance; stateless
    pub fn new() -> Self {
        Self
    }
}

impl RoutingStrategy for LeastHits {
    fn name(&self) -> &'static str {
        "least-hits"
    }

    fn select(
        &self,
        _key: &PluginKey,
        ready: &[Arc<AvailableInstance>],
    ) -> Option<Arc<AvailableInstance>> {
        ready.iter().min_by_key(|instance| instance.hits()).cloned()
    }
}
