use crate::metrics::snapshot::MetricsSnapshot;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct MetricsCollector {
    urls_queued: Arc<AtomicU64>,
    urls_processed: Arc<AtomicU64>,
    urls_reused: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
    requests_total: Arc<AtomicU64>,
    requests_success: Arc<AtomicU64>,
    requests_failed: Arc<AtomicU64>,
    results_stored: Arc<AtomicU64>,
    store_errors: Arc<AtomicU64>,
    total_response_time_ms: Arc<AtomicU64>,
    start_time: Arc<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            urls_queued: Arc::new(AtomicU64::new(0)),
            urls_processed: Arc::new(AtomicU64::new(0)),
            urls_reused: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            requests_total: Arc::new(AtomicU64::new(0)),
            requests_success: Arc::new(AtomicU64::new(0)),
            requests_failed: Arc::new(AtomicU64::new(0)),
            results_stored: Arc::new(AtomicU64::new(0)),
            store_errors: Arc::new(AtomicU64::new(0)),
            total_response_time_ms: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_urls_queued(&self, count: u64) {
        self.urls_queued.fetch_add(count, Ordering::SeqCst);
    }

    pub fn add_urls_processed(&self, count: u64) {
        self.urls_processed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn increment_urls_reused(&self) {
        self.urls_reused.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_results_stored(&self) {
        self.results_stored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_store_errors(&self) {
        self.store_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::SeqCst);
        self.requests_success.fetch_add(1, Ordering::SeqCst);
        self.total_response_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::SeqCst);
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
        self.total_response_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_requests = self.requests_total.load(Ordering::SeqCst);
        let success = self.requests_success.load(Ordering::SeqCst);
        let failed = self.requests_failed.load(Ordering::SeqCst);
        let total_time = self.total_response_time_ms.load(Ordering::SeqCst);

        let success_rate = if total_requests > 0 {
            (success as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        let avg_response_time_ms = if total_requests > 0 {
            total_time / total_requests
        } else {
            0
        };

        let elapsed = self.start_time.elapsed().as_secs_f64();

        MetricsSnapshot {
            urls_queued: self.urls_queued.load(Ordering::SeqCst),
            urls_processed: self.urls_processed.load(Ordering::SeqCst),
            urls_reused: self.urls_reused.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            requests_total: total_requests,
            requests_success: success,
            requests_failed: failed,
            results_stored: self.results_stored.load(Ordering::SeqCst),
            store_errors: self.store_errors.load(Ordering::SeqCst),
            success_rate,
            avg_response_time_ms,
            requests_per_second: if elapsed > 0.0 {
                total_requests as f64 / elapsed
            } else {
                0.0
            },
            elapsed_seconds: elapsed,
        }
    }
}
