use std::collections::HashMap;

use crate::enrichment::detail::ProviderDetail;
use crate::protocol::MediaType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub media_type: MediaType,
    pub provider_id: u64,
    pub language: String,
}

impl CacheKey {
    pub fn new(media_type: MediaType, provider_id: u64, language: &str) -> Self {
        Self {
            media_type,
            provider_id,
            language: language.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    detail: ProviderDetail,
    fetched_at: i64,
}

/// TTL-bounded detail cache. Overflow keeps the newest `max_entries`.
#[derive(Debug)]
pub struct ResponseCache {
    ttl_ms: i64,
    max_entries: usize,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new(ttl_ms: i64, max_entries: usize) -> Self {
        Self {
            ttl_ms: ttl_ms.max(0),
            max_entries,
            entries: HashMap::new(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: i64) -> bool {
        now.saturating_sub(entry.fetched_at) >= self.ttl_ms
    }

    /// Returns the cached detail and its fetch time. Expired entries are dropped.
    pub fn get(&mut self, key: &CacheKey, now: i64) -> Option<(ProviderDetail, i64)> {
        let entry = self.entries.get(key)?;
        if self.is_expired(entry, now) {
            self.entries.remove(key);
            return None;
        }
        Some((entry.detail.clone(), entry.fetched_at))
    }

    pub fn insert(&mut self, key: CacheKey, detail: ProviderDetail, now: i64) {
        if self.max_entries == 0 || self.ttl_ms == 0 {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                detail,
                fetched_at: now,
            },
        );
        if self.entries.len() > self.max_entries {
            self.prune(now);
        }
    }

    fn prune(&mut self, now: i64) {
        let ttl_ms = self.ttl_ms;
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.fetched_at) < ttl_ms);
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut by_age: Vec<(CacheKey, i64)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.fetched_at))
            .collect();
        by_age.sort_by(|left, right| right.1.cmp(&left.1));
        for (key, _) in by_age.into_iter().skip(self.max_entries) {
            self.entries.remove(&key);
        }
    }

    /// Empties the cache and returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
