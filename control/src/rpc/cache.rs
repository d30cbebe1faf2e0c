//! Response caching for collector clients
//!
//! Repeated collection cycles often ask a plugin for the same namespaces
//! within milliseconds of each other. [`CachedCollector`] wraps a collector
//! client and serves an identical request set from memory while the entry
//! is younger than the configured expiration.
//!
//! Uses `tokio::time::Instant` so the cache respects the paused test clock.

use super::{CollectorClient, PluginClient};
use async_trait::async_trait;
use mittari_core::{ControlError, Metric, MetricRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// TTL cache keyed by the canonical form of a request set.
#[derive(Debug)]
pub struct ResponseCache {
    expiration: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<Metric>)>>,
}

impl ResponseCache {
    /// Cache whose entries live for `expiration`
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical cache key for a request set: order-sensitive list of
    /// `namespace@version` pairs. Config differences are ignored on
    /// purpose; config is applied by the plugin per collection, and two
    /// requests differing only in config within one TTL window would hit
    /// the same plugin state anyway.
    fn key(requests: &[MetricRequest]) -> String {
        let mut key = String::new();
        for request in requests {
            key.push_str(&request.namespace.to_string());
            key.push('@');
            key.push_str(&request.version.to_string());
            key.push(';');
        }
        key
    }

    /// Fresh entry for this request set, if any
    pub fn get(&self, requests: &[MetricRequest]) -> Option<Vec<Metric>> {
        let key = Self::key(requests);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some((stored_at, metrics)) if stored_at.elapsed() < self.expiration => {
                Some(metrics.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store a response for this request set
    pub fn put(&self, requests: &[MetricRequest], metrics: Vec<Metric>) {
        self.entries
            .lock()
            .insert(Self::key(requests), (Instant::now(), metrics));
    }

    /// Number of live (possibly stale) entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Collector client with a response cache in front.
pub struct CachedCollector {
    inner: Arc<dyn CollectorClient>,
    cache: ResponseCache,
}

impl CachedCollector {
    /// Wrap `inner`, caching responses for `expiration`
    pub fn new(inner: Arc<dyn CollectorClient>, expiration: Duration) -> Self {
        Self {
            inner,
            cache: ResponseCache::new(expiration),
        }
    }
}

#[async_trait]
impl PluginClient for CachedCollector {
    async fn ping(&self) -> Result<(), ControlError> {
        self.inner.ping().await
    }
}

#[async_trait]
impl CollectorClient for CachedCollector {
    async fn collect(
        &self,
        requests: &[MetricRequest],
        deadline: Duration,
    ) -> Result<Vec<Metric>, ControlError> {
        if let Some(cached) = self.cache.get(requests) {
            return Ok(cached);
        }
        let metrics = self.inner.collect(requests, deadline).await?;
        self.cache.put(requests, metrics.clone());
        Ok(metrics)
    }
}
