use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use crate::errors::ProviderErrorKind;
use crate::providers::{GeocodeResult, ProviderId};

const DEFAULT_SHARDS: usize = 16;

/// Cache key for a normalized address. Exact: no fuzzy matching beyond
/// case folding and whitespace collapsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(normalized: &str) -> Self {
        let folded = normalized
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(folded.as_bytes());
        Self(base64::engine::general_purpose::STANDARD_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedOutcome {
    Found(GeocodeResult),
    Failed {
        kind: ProviderErrorKind,
        message: String,
    },
}

type CacheKey = (Fingerprint, ProviderId);

struct Slot {
    outcome: CachedOutcome,
    observed_at: Instant,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<CacheKey, Slot>,
    inflight: HashMap<CacheKey, Arc<AsyncMutex<()>>>,
    tick: u64,
}

impl Shard {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            trace!(fingerprint = %key.0, provider = %key.1, "evicting least recently used entry");
            self.entries.remove(&key);
        }
    }
}

/// Sharded (fingerprint, provider) -> outcome cache with TTL and optional
/// LRU bound. Each shard has its own lock, so unrelated fingerprints never
/// contend.
pub struct QueryCache {
    shards: Vec<Mutex<Shard>>,
    capacity_per_shard: Option<usize>,
}

impl QueryCache {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, DEFAULT_SHARDS)
    }

    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let capacity_per_shard = (capacity > 0).then(|| capacity.div_ceil(shards));
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            capacity_per_shard,
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub fn get(&self, fingerprint: &Fingerprint, provider: &ProviderId) -> Option<CachedOutcome> {
        let key = (fingerprint.clone(), provider.clone());
        let mut shard = self.shard(&key).lock();
        let now = Instant::now();
        let expired = match shard.entries.get(&key) {
            None => return None,
            Some(slot) => slot.expires_at <= now,
        };
        if expired {
            shard.entries.remove(&key);
            return None;
        }
        let tick = shard.next_tick();
        let slot = shard.entries.get_mut(&key)?;
        slot.last_used = tick;
        Some(slot.outcome.clone())
    }

    /// Stores an outcome observed at `observed_at`. Returns `false` when a
    /// live entry observed later is already present.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        provider: &ProviderId,
        outcome: CachedOutcome,
        observed_at: Instant,
        ttl: Duration,
    ) -> bool {
        let key = (fingerprint.clone(), provider.clone());
        let mut shard = self.shard(&key).lock();
        let now = Instant::now();
        if let Some(existing) = shard.entries.get(&key) {
            if existing.expires_at > now && existing.observed_at > observed_at {
                trace!(%fingerprint, %provider, "keeping fresher cache entry");
                return false;
            }
        }

        let tick = shard.next_tick();
        let is_new = shard
            .entries
            .insert(
                key,
                Slot {
                    outcome,
                    observed_at,
                    expires_at: now + ttl,
                    last_used: tick,
                },
            )
            .is_none();
        if let Some(capacity) = self.capacity_per_shard {
            if is_new && shard.entries.len() > capacity {
                shard.evict_lru();
            }
        }
        true
    }

    /// Drops every provider's entry for `fingerprint`.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.entries.len();
                shard.entries.retain(|(fp, _), _| fp != fingerprint);
                before - shard.entries.len()
            })
            .sum()
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.entries.len();
                shard.entries.retain(|_, slot| slot.expires_at > now);
                before - shard.entries.len()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes resolutions of one (fingerprint, provider) pair. Holders
    /// must re-check the cache after acquiring.
    pub async fn lock_key(&self, fingerprint: &Fingerprint, provider: &ProviderId) -> KeyGuard<'_> {
        let key = (fingerprint.clone(), provider.clone());
        let lock = {
            let mut shard = self.shard(&key).lock();
            shard
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            cache: self,
            key,
            guard,
        }
    }
}

pub struct KeyGuard<'a> {
    cache: &'a QueryCache,
    key: CacheKey,
    guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut shard = self.cache.shard(&self.key).lock();
        // Only the map and this guard still reference the lock: no waiters.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) <= 2 {
            shard.inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn result(text: &str) -> CachedOutcome {
        CachedOutcome::Found(GeocodeResult {
            suggested_text: text.into(),
            latitude: 4.6,
            longitude: -74.07,
            postal_code: None,
            provider: ProviderId::new("mock"),
            confidence: 0.9,
            fetched_at: Utc::now(),
        })
    }

    #[test]
    fn fingerprint_folds_case_and_whitespace_only() {
        assert_eq!(
            Fingerprint::of("Carrera 7  # 45-10"),
            Fingerprint::of(" carrera 7 # 45-10 ")
        );
        assert_ne!(
            Fingerprint::of("Carrera 7 # 45-10"),
            Fingerprint::of("Carrera 7 #45-10")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily() {
        let cache = QueryCache::new(0);
        let fp = Fingerprint::of("Calle 1");
        let provider = ProviderId::new("mock");
        cache.put(&fp, &provider, result("a"), Instant::now(), Duration::from_secs(10));
        assert!(cache.get(&fp, &provider).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&fp, &provider).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let cache = QueryCache::new(0);
        let provider = ProviderId::new("mock");
        let now = Instant::now();
        cache.put(&Fingerprint::of("a"), &provider, result("a"), now, Duration::from_secs(1));
        cache.put(&Fingerprint::of("b"), &provider, result("b"), now, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = QueryCache::with_shards(2, 1);
        let provider = ProviderId::new("mock");
        let ttl = Duration::from_secs(60);
        let (a, b, c) = (Fingerprint::of("a"), Fingerprint::of("b"), Fingerprint::of("c"));
        cache.put(&a, &provider, result("a"), Instant::now(), ttl);
        cache.put(&b, &provider, result("b"), Instant::now(), ttl);
        assert!(cache.get(&a, &provider).is_some());
        cache.put(&c, &provider, result("c"), Instant::now(), ttl);

        assert!(cache.get(&a, &provider).is_some());
        assert!(cache.get(&b, &provider).is_none());
        assert!(cache.get(&c, &provider).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_write_does_not_replace_fresher_entry() {
        let cache = QueryCache::new(0);
        let fp = Fingerprint::of("Calle 1");
        let provider = ProviderId::new("mock");
        let slow_started = Instant::now();
        tokio::time::advance(Duration::from_millis(50)).await;
        let fast_started = Instant::now();

        assert!(cache.put(&fp, &provider, result("fresh"), fast_started, Duration::from_secs(60)));
        assert!(!cache.put(&fp, &provider, result("stale"), slow_started, Duration::from_secs(60)));
        match cache.get(&fp, &provider) {
            Some(CachedOutcome::Found(found)) => assert_eq!(found.suggested_text, "fresh"),
            other => panic!("unexpected cache content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidate_clears_every_provider() {
        let cache = QueryCache::new(0);
        let fp = Fingerprint::of("Calle 1");
        let ttl = Duration::from_secs(60);
        cache.put(&fp, &ProviderId::new("a"), result("a"), Instant::now(), ttl);
        cache.put(&fp, &ProviderId::new("b"), result("b"), Instant::now(), ttl);
        cache.put(&Fingerprint::of("other"), &ProviderId::new("a"), result("c"), Instant::now(), ttl);

        assert_eq!(cache.invalidate(&fp), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn key_lock_is_released_after_use() {
        let cache = QueryCache::new(0);
        let fp = Fingerprint::of("Calle 1");
        let provider = ProviderId::new("mock");
        {
            let _guard = cache.lock_key(&fp, &provider).await;
        }
        let _again = cache.lock_key(&fp, &provider).await;
        let inflight: usize = cache.shards.iter().map(|s| s.lock().inflight.len()).sum();
        assert_eq!(inflight, 1);
    }
}
