//! Multi-layer read-through cache.
//!
//! Local tier: process-local LRU with TTL. Shared tier: cross-process ([SharedTier]).
//! Tag invalidation is broadcast on an [InvalidationBus]; each local tier drains pending
//! invalidations before every read and write, while the invalidator deletes matching shared
//! entries synchronously. Staleness is therefore bounded by broadcast latency.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use conductor_kernel::KernelError;

use crate::config::CacheConfig;

const INVALIDATION_CHANNEL_CAPACITY: usize = 256;

/// `sha256(content, policy_version, config)` as lowercase hex.
pub fn cache_key(content: &[u8], policy_version: &str, config: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update([0x1f]);
    hasher.update(policy_version.as_bytes());
    hasher.update([0x1f]);
    hasher.update(config.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub tags: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: Value, tags: Vec<String>, ttl: Duration) -> Self {
        Self {
            value,
            tags,
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Cross-process cache tier.
#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, KernelError>;
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), KernelError>;
    /// Deletes every entry carrying `tag`; returns how many were removed.
    async fn invalidate_tag(&self, tag: &str) -> Result<usize, KernelError>;
}

#[derive(Default)]
pub struct InMemorySharedTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, KernelError> {
        let now = Utc::now();
        let mut guard = self
            .entries
            .write()
            .map_err(|e| KernelError::Driver(e.to_string()))?;
        match guard.get(key) {
            Some(entry) if entry.is_expired(now) => {
                guard.remove(key);
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), KernelError> {
        self.entries
            .write()
            .map_err(|e| KernelError::Driver(e.to_string()))?
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, KernelError> {
        let mut guard = self
            .entries
            .write()
            .map_err(|e| KernelError::Driver(e.to_string()))?;
        let before = guard.len();
        guard.retain(|_, entry| !entry.has_tag(tag));
        Ok(before - guard.len())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
    pub tag: String,
}

/// Broadcast channel every local tier subscribes to.
pub struct InvalidationBus {
    tx: broadcast::Sender<Invalidation>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the invalidation.
    pub fn publish(&self, tag: &str) -> usize {
        self.tx
            .send(Invalidation {
                tag: tag.to_string(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(INVALIDATION_CHANNEL_CAPACITY)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
}

pub struct TieredCache {
    local: Mutex<LruCache<String, CacheEntry>>,
    invalidations: Mutex<broadcast::Receiver<Invalidation>>,
    shared: Arc<dyn SharedTier>,
    bus: Arc<InvalidationBus>,
    config: CacheConfig,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn new(shared: Arc<dyn SharedTier>, bus: Arc<InvalidationBus>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.local_max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            local: Mutex::new(LruCache::new(capacity)),
            invalidations: Mutex::new(bus.subscribe()),
            shared,
            bus,
            config,
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn local_ttl(&self) -> Duration {
        Duration::from_std(self.config.local_ttl).unwrap_or_else(|_| Duration::seconds(60))
    }

    fn shared_ttl(&self) -> Duration {
        Duration::from_std(self.config.shared_ttl).unwrap_or_else(|_| Duration::seconds(3600))
    }

    fn lock_local(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>, KernelError> {
        self.local
            .lock()
            .map_err(|e| KernelError::Driver(format!("local cache lock poisoned: {e}")))
    }

    /// Applies every pending broadcast invalidation to the local tier.
    pub fn drain_invalidations(&self) -> Result<usize, KernelError> {
        let mut rx = self
            .invalidations
            .lock()
            .map_err(|e| KernelError::Driver(format!("invalidation receiver lock poisoned: {e}")))?;
        let mut local = self.lock_local()?;
        let mut applied = 0;
        loop {
            match rx.try_recv() {
                Ok(invalidation) => {
                    let stale: Vec<String> = local
                        .iter()
                        .filter(|(_, entry)| entry.has_tag(&invalidation.tag))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in stale {
                        local.pop(&key);
                    }
                    applied += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "cache invalidation receiver lagged, clearing local tier");
                    local.clear();
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(applied)
    }

    fn local_get(&self, key: &str) -> Result<Option<Value>, KernelError> {
        let now = Utc::now();
        let mut local = self.lock_local()?;
        match local.get(key) {
            Some(entry) if entry.is_expired(now) => {
                local.pop(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn local_put(&self, key: &str, value: Value, tags: Vec<String>) -> Result<(), KernelError> {
        let entry = CacheEntry::new(value, tags, self.local_ttl());
        self.lock_local()?.put(key.to_string(), entry);
        Ok(())
    }

    /// Local, then shared (populating local on a shared hit).
    pub async fn get(&self, key: &str) -> Result<Option<Value>, KernelError> {
        self.drain_invalidations()?;
        if let Some(value) = self.local_get(key)? {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        match self.shared.get(key).await? {
            Some(entry) => {
                self.shared_hits.fetch_add(1, Ordering::Relaxed);
                // An invalidation may have landed while the shared read was in flight.
                self.drain_invalidations()?;
                let value = entry.value.clone();
                self.local_put(key, entry.value, entry.tags)?;
                Ok(Some(value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Write-through to both tiers.
    pub async fn put(&self, key: &str, value: Value, tags: Vec<String>) -> Result<(), KernelError> {
        self.drain_invalidations()?;
        self.shared
            .put(key, CacheEntry::new(value.clone(), tags.clone(), self.shared_ttl()))
            .await?;
        self.local_put(key, value, tags)
    }

    /// Read-through: on a full miss runs `compute` and writes the result to both tiers.
    /// Cache-tier failures are logged and treated as misses.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        tags: &[&str],
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        match self.get(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => tracing::warn!(key, error = %e, "cache read failed, computing"),
        }
        let value = compute().await?;
        let tags = tags.iter().map(|t| t.to_string()).collect();
        if let Err(e) = self.put(key, value.clone(), tags).await {
            tracing::warn!(key, error = %e, "cache write failed");
        }
        Ok(value)
    }

    /// Deletes shared entries for `tag`, evicts them locally and broadcasts to every process.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<usize, KernelError> {
        let removed = self.shared.invalidate_tag(tag).await?;
        let receivers = self.bus.publish(tag);
        self.drain_invalidations()?;
        tracing::debug!(tag, removed, receivers, "cache tag invalidated");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            local_ttl: std::time::Duration::from_secs(60),
            shared_ttl: std::time::Duration::from_secs(600),
            local_max_entries: max_entries,
        }
    }

    fn pair() -> (TieredCache, TieredCache) {
        let shared: Arc<dyn SharedTier> = Arc::new(InMemorySharedTier::new());
        let bus = Arc::new(InvalidationBus::default());
        (
            TieredCache::new(Arc::clone(&shared), Arc::clone(&bus), config(64)),
            TieredCache::new(shared, bus, config(64)),
        )
    }

    #[test]
    fn cache_key_depends_on_all_parts() {
        let base = cache_key(b"essay", "v1", &json!({ "model": "m" }));
        assert_eq!(base.len(), 64);
        assert_eq!(base, cache_key(b"essay", "v1", &json!({ "model": "m" })));
        assert_ne!(base, cache_key(b"essay", "v2", &json!({ "model": "m" })));
        assert_ne!(base, cache_key(b"essay", "v1", &json!({ "model": "n" })));
        assert_ne!(base, cache_key(b"essay!", "v1", &json!({ "model": "m" })));
    }

    #[tokio::test]
    async fn read_through_computes_once() {
        let (cache, _) = pair();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: Result<Value, KernelError> = cache
                .get_or_compute("k", &["rubric:1"], || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "score": 9 }))
                })
                .await;
            assert_eq!(v.unwrap(), json!({ "score": 9 }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().local_hits, 2);
    }

    #[tokio::test]
    async fn shared_hit_populates_local() {
        let (a, b) = pair();
        a.put("k", json!(1), vec!["t".into()]).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(b.stats().shared_hits, 1);
        assert_eq!(b.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(b.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn broadcast_invalidation_reaches_other_processes() {
        let (a, b) = pair();
        a.put("k", json!("graded"), vec!["rubric:7".into()]).await.unwrap();
        assert!(b.get("k").await.unwrap().is_some());

        let removed = a.invalidate_tag("rubric:7").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(b.get("k").await.unwrap(), None);
        assert_eq!(a.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidation_misses_in_process_that_never_wrote_locally() {
        let shared: Arc<dyn SharedTier> = Arc::new(InMemorySharedTier::new());
        let bus = Arc::new(InvalidationBus::default());
        let writer = TieredCache::new(Arc::clone(&shared), Arc::clone(&bus), config(64));
        writer.put("k", json!(1), vec!["t".into()]).await.unwrap();
        writer.invalidate_tag("t").await.unwrap();

        let fresh = TieredCache::new(shared, bus, config(64));
        assert_eq!(fresh.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lagged_receiver_clears_local_tier() {
        let shared: Arc<dyn SharedTier> = Arc::new(InMemorySharedTier::new());
        let bus = Arc::new(InvalidationBus::new(2));
        let cache = TieredCache::new(Arc::clone(&shared), Arc::clone(&bus), config(64));
        cache.put("keep", json!(1), vec!["other".into()]).await.unwrap();
        for i in 0..5 {
            bus.publish(&format!("noise-{i}"));
        }
        cache.drain_invalidations().unwrap();
        assert_eq!(cache.lock_local().unwrap().len(), 0);
        // Still served from the shared tier.
        assert_eq!(cache.get("keep").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn local_tier_is_bounded() {
        let shared: Arc<dyn SharedTier> = Arc::new(InMemorySharedTier::new());
        let cache = TieredCache::new(shared, Arc::new(InvalidationBus::default()), config(16));
        for i in 0..40 {
            cache.put(&format!("k{i}"), json!(i), vec![]).await.unwrap();
        }
        assert_eq!(cache.lock_local().unwrap().len(), 16);
    }
}
