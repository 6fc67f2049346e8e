//! Time-bounded cache of successful proxy fetches, shared by every run in
//! the process and keyed by target URL only.

use crate::model::FetchResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CAPACITY: usize = 100;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    result: FetchResult,
    inserted_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self::with_clock(ttl, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
            clock,
        }
    }

    pub async fn get(&self, url: &str) -> Option<FetchResult> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let expired = match entries.get(url) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(url);
        }
        None
    }

    /// Stores `result` if it was successful; failures are never cached.
    pub async fn put(&self, url: &str, result: &FetchResult) {
        if !result.success {
            return;
        }

        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        if entries.len() >= self.capacity {
            let ttl = self.ttl;
            let before = entries.len();
            entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
            log::debug!(
                "Response cache swept {} expired entries",
                before - entries.len()
            );
        }

        entries.insert(
            url.to_string(),
            CacheEntry {
                result: result.clone(),
                inserted_at: now,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;
    use std::sync::Mutex as StdMutex;

    struct ManualClock {
        base: Instant,
        offset: StdMutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: StdMutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    fn ok(url: &str) -> FetchResult {
        FetchResult::success(url, 200, Payload::new("{}"))
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ResponseCache::with_clock(Duration::from_secs(3600), 100, clock.clone());

        cache.put("https://a/", &ok("https://a/")).await;
        clock.advance(Duration::from_secs(3599));
        assert!(cache.get("https://a/").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("https://a/").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ResponseCache::default();
        cache
            .put("https://a/", &FetchResult::failure("https://a/", 500, "boom"))
            .await;
        assert!(cache.get("https://a/").await.is_none());
    }

    #[tokio::test]
    async fn test_sweeps_expired_entries_at_capacity() {
        let clock = Arc::new(ManualClock::new());
        let cache = ResponseCache::with_clock(Duration::from_secs(10), 2, clock.clone());

        cache.put("https://a/", &ok("https://a/")).await;
        cache.put("https://b/", &ok("https://b/")).await;
        clock.advance(Duration::from_secs(11));
        cache.put("https://c/", &ok("https://c/")).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get("https://c/").await.is_some());
    }
}
