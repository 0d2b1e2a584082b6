//! Result caching in front of every tier.
//!
//! Results are keyed by a [`Fingerprint`] built from the fields that decide
//! what the answer should be (entity, event kind, user) plus a hash of the
//! caller's preferences. Entries expire after a TTL: an expired entry reads
//! as absent and is dropped on the spot. When the cache is full, expired
//! entries are swept first, then the oldest live entry goes.
//!
//! The cache is shared by concurrent resolves. Each entry is written whole
//! under a lock, so a reader sees either the old entry or the new one.

use crate::types::{InferenceRequest, InferenceResult, Preferences};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;

/// TTL and capacity bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Maximum live entries. `0` disables caching.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

// ── Fingerprint ────────────────────────────────────────────────────

/// Deterministic cache key for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &InferenceRequest) -> Self {
        let ctx = &request.context;
        Fingerprint(format!(
            "{}|{}|{}|{:016x}",
            escape(&ctx.entity_id),
            escape(&ctx.event_kind),
            escape(&ctx.user_id),
            hash_preferences(&request.preferences),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep the `|` separator unambiguous.
fn escape(field: &str) -> String {
    field.replace('\\', "\\\\").replace('|', "\\|")
}

/// Hash preferences over a fixed field order, so the key never depends on
/// how the value was built or serialized.
fn hash_preferences(prefs: &Preferences) -> u64 {
    let canonical = format!(
        "{:016x};{};{};{}",
        prefs.confidence_threshold.to_bits(),
        prefs.preferred_backend.as_deref().unwrap_or(""),
        prefs.safety_policy,
        prefs.allow_local_processing,
    );
    fnv1a(canonical.as_bytes())
}

/// FNV-1a, 64-bit.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ── Entries ────────────────────────────────────────────────────────

/// A cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub result: InferenceResult,
    pub confidence: f64,
    pub stored_at: Instant,
    /// Version label of the tier that produced the result.
    pub tier_version: String,
}

impl CacheEntry {
    pub fn new(result: InferenceResult, tier_version: impl Into<String>) -> Self {
        Self::stored_at(result, tier_version, Instant::now())
    }

    pub fn stored_at(
        result: InferenceResult,
        tier_version: impl Into<String>,
        stored_at: Instant,
    ) -> Self {
        Self {
            confidence: result.confidence,
            result,
            stored_at,
            tier_version: tier_version.into(),
        }
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) >= ttl
    }
}

/// Cache diagnostics.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Fingerprint, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded, TTL-expiring result cache.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a live entry.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.get_at(fingerprint, Instant::now())
    }

    pub fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let lookup = inner
            .entries
            .get(fingerprint)
            .map(|e| (!e.expired(now, self.config.ttl)).then(|| e.clone()));
        match lookup {
            Some(Some(entry)) => {
                inner.hits += 1;
                Some(entry)
            }
            Some(None) => {
                trace!(%fingerprint, "cache entry expired");
                inner.entries.remove(fingerprint);
                inner.evictions += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store an entry, replacing any previous one for the same fingerprint.
    pub fn put(&self, fingerprint: Fingerprint, entry: CacheEntry) {
        self.put_at(fingerprint, entry, Instant::now());
    }

    pub fn put_at(&self, fingerprint: Fingerprint, entry: CacheEntry, now: Instant) {
        if self.config.max_entries == 0 {
            return;
        }
        let mut inner = self.lock();
        if !inner.entries.contains_key(&fingerprint)
            && inner.entries.len() >= self.config.max_entries
        {
            let swept = sweep_expired(&mut inner, now, self.config.ttl);
            if swept == 0 {
                evict_oldest(&mut inner);
            }
        }
        inner.entries.insert(fingerprint, entry);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        sweep_expired(&mut inner, now, self.config.ttl)
    }

    pub fn invalidate_all(&self) {
        self.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sweep_expired(inner: &mut Inner, now: Instant, ttl: Duration) -> usize {
    let before = inner.entries.len();
    inner.entries.retain(|_, entry| !entry.expired(now, ttl));
    let removed = before - inner.entries.len();
    if removed > 0 {
        debug!(removed, "swept expired cache entries");
    }
    inner.evictions += removed as u64;
    removed
}

fn evict_oldest(inner: &mut Inner) {
    if let Some(oldest) = inner
        .entries
        .iter()
        .min_by_key(|(_, e)| e.stored_at)
        .map(|(k, _)| k.clone())
    {
        inner.entries.remove(&oldest);
        inner.evictions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SafetyPolicy, TierId};
    use serde_json::json;

    fn result(confidence: f64) -> InferenceResult {
        InferenceResult::new(TierId::Primary, json!({"action": "dim"}), confidence, 0.9, "r")
    }

    fn fp(entity: &str) -> Fingerprint {
        Fingerprint::of(&InferenceRequest::new(entity, "state_changed", "u1"))
    }

    #[test]
    fn put_then_get_returns_entry() {
        let cache = ResultCache::default();
        let now = Instant::now();
        let entry = CacheEntry::stored_at(result(0.8), "primary:model-a", now);
        cache.put_at(fp("light.a"), entry.clone(), now);
        assert_eq!(cache.get_at(&fp("light.a"), now), Some(entry));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_for_unknown_fingerprint() {
        let cache = ResultCache::default();
        assert!(cache.get(&fp("light.b")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(10),
            max_entries: 10,
        });
        let t0 = Instant::now();
        cache.put_at(fp("a"), CacheEntry::stored_at(result(0.8), "v", t0), t0);
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(9)).is_some());
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(10)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_expired_sweeps_only_old_entries() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(10),
            max_entries: 10,
        });
        let t0 = Instant::now();
        cache.put_at(fp("old"), CacheEntry::stored_at(result(0.8), "v", t0), t0);
        let t1 = t0 + Duration::from_secs(8);
        cache.put_at(fp("new"), CacheEntry::stored_at(result(0.8), "v", t1), t1);

        assert_eq!(cache.evict_expired_at(t0 + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at(&fp("new"), t0 + Duration::from_secs(12)).is_some());
    }

    #[test]
    fn full_cache_prefers_sweeping_expired() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(10),
            max_entries: 2,
        });
        let t0 = Instant::now();
        let t5 = t0 + Duration::from_secs(5);
        cache.put_at(fp("a"), CacheEntry::stored_at(result(0.8), "v", t0), t0);
        cache.put_at(fp("b"), CacheEntry::stored_at(result(0.8), "v", t5), t5);

        let t11 = t0 + Duration::from_secs(11);
        cache.put_at(fp("c"), CacheEntry::stored_at(result(0.8), "v", t11), t11);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&fp("a"), t11).is_none());
        assert!(cache.get_at(&fp("b"), t11).is_some());
        assert!(cache.get_at(&fp("c"), t11).is_some());
    }

    #[test]
    fn full_cache_without_expired_evicts_oldest() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(100),
            max_entries: 2,
        });
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let t2 = t0 + Duration::from_secs(2);
        cache.put_at(fp("a"), CacheEntry::stored_at(result(0.8), "v", t0), t0);
        cache.put_at(fp("b"), CacheEntry::stored_at(result(0.8), "v", t1), t1);
        cache.put_at(fp("c"), CacheEntry::stored_at(result(0.8), "v", t2), t2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&fp("a"), t2).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(100),
            max_entries: 1,
        });
        let now = Instant::now();
        cache.put_at(fp("a"), CacheEntry::stored_at(result(0.5), "v1", now), now);
        cache.put_at(fp("a"), CacheEntry::stored_at(result(0.9), "v2", now), now);
        let entry = cache.get_at(&fp("a"), now).unwrap();
        assert_eq!(entry.tier_version, "v2");
        assert_eq!(entry.confidence, 0.9);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(100),
            max_entries: 0,
        });
        cache.put(fp("a"), CacheEntry::new(result(0.8), "v"));
        assert!(cache.is_empty());
    }

    #[test]
    fn fingerprint_ignores_irrelevant_fields() {
        let a = InferenceRequest::new("light.a", "state_changed", "u1")
            .with_states(Some("off"), Some("on"));
        let mut b = InferenceRequest::new("light.a", "state_changed", "u1");
        b.context.timestamp = a.context.timestamp + chrono::Duration::hours(3);
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn fingerprint_tracks_preferences() {
        let base = InferenceRequest::new("light.a", "state_changed", "u1");
        let strict = base.clone().with_preferences(
            Preferences::default().with_safety_policy(SafetyPolicy::Strict),
        );
        let via_json: InferenceRequest =
            serde_json::from_str(&serde_json::to_string(&base).unwrap()).unwrap();
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&strict));
        assert_eq!(Fingerprint::of(&base), Fingerprint::of(&via_json));
    }

    #[test]
    fn fingerprint_separator_is_escaped() {
        let a = InferenceRequest::new("a|b", "c", "u");
        let b = InferenceRequest::new("a", "b|c", "u");
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn hit_rate_computation() {
        let cache = ResultCache::default();
        cache.put(fp("a"), CacheEntry::new(result(0.8), "v"));
        cache.get(&fp("a"));
        cache.get(&fp("b"));
        assert!((cache.hit_rate() - 0.5).abs() < 0.01);
    }
}
