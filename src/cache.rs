//! Response cache keyed by a normalised request fingerprint.
//!
//! The fingerprint is the first 16 hex characters of the SHA-256 of the
//! lower-cased, trimmed message; the cache key prefixes it with the
//! provider (and model, when set). Entries live in the store's
//! `response_cache` table so hits survive restarts.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::Store;
use crate::types::now;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cached response row.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub provider: String,
    pub message_hash: String,
    pub response: String,
    pub tokens_used: Option<i64>,
    pub created_at: f64,
    pub expires_at: f64,
    pub hit_count: i64,
    pub last_hit_at: Option<f64>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        now() > self.expires_at
    }
}

/// Aggregated cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_entries: i64,
    pub size_bytes: i64,
    pub total_tokens_saved: u64,
    pub oldest_entry: Option<f64>,
    pub newest_entry: Option<f64>,
    pub avg_ttl_remaining_s: Option<f64>,
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fingerprint of a message: 16 hex chars of the normalised hash.
pub fn message_fingerprint(message: &str) -> String {
    sha256_hex(&message.trim().to_lowercase())[..16].to_string()
}

/// Full cache key: `provider[:model]:fingerprint`.
pub fn cache_key(provider: &str, message: &str, model: Option<&str>) -> String {
    let fingerprint = message_fingerprint(message);
    match model {
        Some(model) => format!("{}:{}:{}", provider, model, fingerprint),
        None => format!("{}:{}", provider, fingerprint),
    }
}

/// Hash of the exact (trimmed) message, stored for auditing.
pub fn message_hash(message: &str) -> String {
    sha256_hex(message.trim())
}

pub struct CacheManager {
    store: Arc<Store>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<Store>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a cached response. Expired entries are deleted on access.
    /// Hits bump the entry's hit count and `last_hit_at`.
    pub fn get(&self, provider: &str, message: &str, model: Option<&str>) -> Result<Option<CacheEntry>> {
        if !self.config.enabled || !self.config.should_cache_message(message) {
            return Ok(None);
        }

        let key = cache_key(provider, message, model);
        let Some(mut entry) = self.store.cache_get(&key)? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entry.is_expired() {
            self.store.cache_delete(&key)?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let ts = now();
        self.store.cache_record_hit(&key, ts)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(tokens) = entry.tokens_used {
            self.tokens_saved.fetch_add(tokens.max(0) as u64, Ordering::Relaxed);
        }
        entry.hit_count += 1;
        entry.last_hit_at = Some(ts);
        Ok(Some(entry))
    }

    /// Store a response. Skipped (returning `None`) when caching is
    /// disabled, the message matches a negative pattern, or the response is
    /// below the minimum length.
    pub fn put(
        &self,
        provider: &str,
        message: &str,
        response: &str,
        tokens_used: Option<i64>,
        model: Option<&str>,
        ttl_s: Option<f64>,
    ) -> Result<Option<CacheEntry>> {
        if !self.config.enabled
            || !self.config.should_cache_message(message)
            || response.len() < self.config.min_response_length
        {
            return Ok(None);
        }

        let ts = now();
        let ttl = ttl_s.unwrap_or_else(|| self.config.ttl_for(provider));
        let entry = CacheEntry {
            cache_key: cache_key(provider, message, model),
            provider: provider.to_string(),
            message_hash: message_hash(message),
            response: response.to_string(),
            tokens_used,
            created_at: ts,
            expires_at: ts + ttl,
            hit_count: 0,
            last_hit_at: None,
        };
        self.store.cache_put(&entry)?;
        Ok(Some(entry))
    }

    pub fn invalidate(&self, cache_key: &str) -> Result<bool> {
        self.store.cache_delete(cache_key)
    }

    /// Drop all entries, or only one provider's.
    pub fn clear(&self, provider: Option<&str>) -> Result<usize> {
        self.store.cache_clear(provider)
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        self.store.cache_cleanup_expired()
    }

    pub fn enforce_max_entries(&self) -> Result<usize> {
        self.store.cache_enforce_max_entries(self.config.max_entries)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (total_entries, size_bytes, oldest, newest, avg_ttl) = self.store.cache_stats()?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        Ok(CacheStats {
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            total_entries,
            size_bytes,
            total_tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            oldest_entry: oldest,
            newest_entry: newest,
            avg_ttl_remaining_s: avg_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(config: CacheConfig) -> (tempfile::TempDir, CacheManager) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("cache.db")).unwrap());
        (dir, CacheManager::new(store, config))
    }

    fn default_manager() -> (tempfile::TempDir, CacheManager) {
        manager(CacheConfig {
            min_response_length: 3,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_fingerprint_normalisation() {
        // Case and surrounding whitespace do not change the fingerprint.
        assert_eq!(message_fingerprint("Hello World"), message_fingerprint("  hello world  "));
        assert_ne!(message_fingerprint("hello"), message_fingerprint("goodbye"));
        assert_eq!(message_fingerprint("x").len(), 16);
    }

    #[test]
    fn test_cache_key_shape() {
        let fp = message_fingerprint("msg");
        assert_eq!(cache_key("alpha", "msg", None), format!("alpha:{}", fp));
        assert_eq!(
            cache_key("alpha", "msg", Some("big-v2")),
            format!("alpha:big-v2:{}", fp)
        );
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, cache) = default_manager();
        let stored = cache
            .put("alpha", "what is rust", "a systems language", Some(12), None, None)
            .unwrap();
        assert!(stored.is_some());

        let entry = cache.get("alpha", "what is rust", None).unwrap().unwrap();
        assert_eq!(entry.response, "a systems language");
        assert_eq!(entry.tokens_used, Some(12));
        assert_eq!(entry.hit_count, 1);
        assert!(entry.last_hit_at.is_some());

        // Different provider misses.
        assert!(cache.get("beta", "what is rust", None).unwrap().is_none());
    }

    #[test]
    fn test_hit_count_increments_per_hit() {
        let (_dir, cache) = default_manager();
        cache
            .put("alpha", "q", "cached body", None, None, None)
            .unwrap();
        let first = cache.get("alpha", "q", None).unwrap().unwrap();
        let second = cache.get("alpha", "q", None).unwrap().unwrap();
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);
    }

    #[test]
    fn test_negative_patterns_skip_both_ways() {
        let (_dir, cache) = default_manager();
        let stored = cache
            .put("alpha", "what is the weather today", "sunny forever", None, None, None)
            .unwrap();
        assert!(stored.is_none());
        assert!(cache
            .get("alpha", "what is the weather today", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_short_response_not_cached() {
        let (_dir, cache) = default_manager();
        assert!(cache.put("alpha", "q", "ok", None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_expired_entry_deleted_on_access() {
        let (_dir, cache) = default_manager();
        cache
            .put("alpha", "q", "will expire", None, None, Some(-1.0))
            .unwrap();
        assert!(cache.get("alpha", "q", None).unwrap().is_none());
        // Deleted on access, so stats see zero entries.
        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let (_dir, cache) = default_manager();
        cache.put("alpha", "q1", "expired body", None, None, Some(-1.0)).unwrap();
        cache.put("alpha", "q2", "live body", None, None, None).unwrap();
        assert_eq!(cache.cleanup_expired().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_enforce_max_entries_evicts_oldest() {
        let (_dir, cache) = manager(CacheConfig {
            min_response_length: 3,
            max_entries: 2,
            ..CacheConfig::default()
        });
        cache.put("alpha", "q1", "first body", None, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put("alpha", "q2", "second body", None, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put("alpha", "q3", "third body", None, None, None).unwrap();

        assert_eq!(cache.enforce_max_entries().unwrap(), 1);
        assert!(cache.get("alpha", "q1", None).unwrap().is_none());
        assert!(cache.get("alpha", "q3", None).unwrap().is_some());
    }

    #[test]
    fn test_clear_by_provider() {
        let (_dir, cache) = default_manager();
        cache.put("alpha", "q1", "alpha body", None, None, None).unwrap();
        cache.put("beta", "q2", "beta body", None, None, None).unwrap();
        assert_eq!(cache.clear(Some("alpha")).unwrap(), 1);
        assert!(cache.get("beta", "q2", None).unwrap().is_some());
        assert_eq!(cache.clear(None).unwrap(), 1);
    }

    #[test]
    fn test_disabled_cache() {
        let (_dir, cache) = manager(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert!(cache
            .put("alpha", "q", "long enough body", None, None, None)
            .unwrap()
            .is_none());
        assert!(cache.get("alpha", "q", None).unwrap().is_none());
    }

    #[test]
    fn test_stats_hit_rate() {
        let (_dir, cache) = default_manager();
        cache.put("alpha", "q", "cached body", Some(5), None, None).unwrap();
        cache.get("alpha", "q", None).unwrap();
        cache.get("alpha", "missing", None).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.total_tokens_saved, 5);
        assert!(stats.size_bytes > 0);
        assert!(stats.avg_ttl_remaining_s.unwrap() > 0.0);
    }
}
