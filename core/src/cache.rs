use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::CacheConfig;

/// A small body kept in memory until its `max-age` runs out.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Arc<[u8]>,
    pub content_type: Option<String>,
    expires_at: Instant,
}

impl CachedResponse {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedResponse>,
    // least recently used at the front
    order: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Bounded LRU store of GET bodies keyed by URL.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Whether a body of `len` bytes may be stored at all.
    pub fn admits(&self, len: u64) -> bool {
        self.config.is_enabled() && len <= self.config.max_object_size
    }

    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        if !self.config.is_enabled() {
            return None;
        }
        let mut state = self.state.lock().ok()?;
        let entry = state.entries.get(url).cloned()?;
        if !entry.is_fresh() {
            state.remove(url);
            debug!(url = %url, "cache entry expired");
            return None;
        }
        state.touch(url);
        Some(entry)
    }

    /// Stores `body` for `max_age`. Returns `false` when the body is too big
    /// or caching is off.
    pub fn put(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        max_age: Duration,
    ) -> bool {
        if !self.admits(body.len() as u64) || max_age.is_zero() {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.remove(url);
        while state.entries.len() >= self.config.max_entries {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        state.entries.insert(
            url.to_string(),
            CachedResponse {
                body: Arc::from(body),
                content_type,
                expires_at: Instant::now() + max_age,
            },
        );
        state.order.push_back(url.to_string());
        debug!(url = %url, entries = state.entries.len(), "response cached");
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.order.clear();
        }
    }
}

/// Reads the freshness lifetime from a `Cache-Control` header value.
///
/// Returns `None` when the response must not be reused.
pub fn freshness(cache_control: Option<&str>) -> Option<Duration> {
    let value = cache_control?;
    let mut max_age = None;
    for directive in value.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if directive == "no-store" || directive == "no-cache" {
            return None;
        }
        if let Some(seconds) = directive.strip_prefix("max-age=") {
            max_age = seconds.trim_matches('"').parse::<u64>().ok();
        }
    }
    max_age
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_object_size: u64) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            max_entries,
            max_object_size,
        })
    }

    #[test]
    fn parses_cache_control() {
        assert_eq!(freshness(Some("public, max-age=60")), Some(Duration::from_secs(60)));
        assert_eq!(freshness(Some("max-age=0")), None);
        assert_eq!(freshness(Some("no-store, max-age=60")), None);
        assert_eq!(freshness(Some("No-Cache")), None);
        assert_eq!(freshness(Some("private")), None);
        assert_eq!(freshness(None), None);
    }

    #[test]
    fn stores_and_serves_fresh_bodies() {
        let cache = cache(4, 16);
        assert!(cache.put("http://a/1", b"hello".to_vec(), None, Duration::from_secs(60)));
        let hit = cache.get("http://a/1").expect("fresh entry");
        assert_eq!(&*hit.body, b"hello");
        assert!(cache.get("http://a/2").is_none());
    }

    #[test]
    fn rejects_oversized_bodies() {
        let cache = cache(4, 4);
        assert!(!cache.put("http://a/1", b"too long".to_vec(), None, Duration::from_secs(60)));
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = cache(2, 16);
        let ttl = Duration::from_secs(60);
        cache.put("http://a/1", b"1".to_vec(), None, ttl);
        cache.put("http://a/2", b"2".to_vec(), None, ttl);
        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get("http://a/1").is_some());
        cache.put("http://a/3", b"3".to_vec(), None, ttl);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("http://a/1").is_some());
        assert!(cache.get("http://a/2").is_none());
        assert!(cache.get("http://a/3").is_some());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = cache(2, 16);
        cache.put("http://a/1", b"1".to_vec(), None, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("http://a/1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ResponseCache::new(CacheConfig::disabled());
        assert!(!cache.put("http://a/1", b"1".to_vec(), None, Duration::from_secs(60)));
        assert!(cache.get("http://a/1").is_none());
    }
}
