//! Ingest runs against an in-memory store and a scripted fetcher.

use async_trait::async_trait;
use futures::StreamExt;
use serp_ranker::error::{Error, Result};
use serp_ranker::model::{FetchResult, Payload, UrlEntry};
use serp_ranker::pipeline::{IngestEvent, IngestPipeline, Phase, RunState, RunSummary};
use serp_ranker::proxy::Fetcher;
use serp_ranker::repository::{MemoryStore, ResultStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

const OWNER: &str = "owner-1";

fn serp(domain: &str) -> Payload {
    Payload::new(format!(
        r#"{{"searchParameters":{{"query":"q"}},"organicResults":[{{"position":1,"url":"https://{}/"}}]}}"#,
        domain
    ))
}

fn url(n: usize) -> String {
    format!("https://www.google.com/search?q=term{}", n)
}

/// Answers from a fixed set of failing URLs; everything else succeeds.
#[derive(Default)]
struct ScriptedFetcher {
    failing: HashSet<String>,
    batch_broken: bool,
    calls: Mutex<Vec<String>>,
    batches: Mutex<usize>,
}

impl ScriptedFetcher {
    fn failing(urls: &[String]) -> Self {
        Self {
            failing: urls.iter().cloned().collect(),
            ..Self::default()
        }
    }

    fn answer(&self, url: &str) -> FetchResult {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.contains(url) {
            FetchResult::failure(url, 503, "proxy unavailable")
        } else {
            FetchResult::success(url, 200, serp("a.example.com"))
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> FetchResult {
        self.answer(url)
    }

    async fn fetch_batch(&self, urls: &[String]) -> Result<Vec<FetchResult>> {
        *self.batches.lock().unwrap() += 1;
        if self.batch_broken {
            return Err(Error::Internal("batch transport broke".to_string()));
        }
        Ok(urls.iter().map(|u| self.answer(u)).collect())
    }
}

/// Blocks the first batch until released.
struct GatedFetcher {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Fetcher for GatedFetcher {
    async fn fetch(&self, url: &str) -> FetchResult {
        FetchResult::success(url, 200, serp("gated.com"))
    }

    async fn fetch_batch(&self, urls: &[String]) -> Result<Vec<FetchResult>> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(urls
            .iter()
            .map(|u| FetchResult::success(u.as_str(), 200, serp("gated.com")))
            .collect())
    }
}

/// Never answers; optionally fails batches so single fetches are used.
struct StalledFetcher {
    batch_broken: bool,
    started: Notify,
}

#[async_trait]
impl Fetcher for StalledFetcher {
    async fn fetch(&self, _url: &str) -> FetchResult {
        self.started.notify_one();
        futures::future::pending().await
    }

    async fn fetch_batch(&self, _urls: &[String]) -> Result<Vec<FetchResult>> {
        if self.batch_broken {
            return Err(Error::Internal("batch transport broke".to_string()));
        }
        self.started.notify_one();
        futures::future::pending().await
    }
}

async fn cancel_stalled_run(batch_broken: bool) {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(StalledFetcher {
        batch_broken,
        started: Notify::new(),
    });
    let pipeline = pipeline(store.clone(), fetcher.clone());
    let entries: Vec<UrlEntry> = (0..4).map(|n| UrlEntry::new(url(n), 1)).collect();

    let events = pipeline.run(entries, OWNER).await;
    fetcher.started.notified().await;
    pipeline.reset(OWNER).await;

    let events: Vec<IngestEvent> =
        tokio::time::timeout(Duration::from_secs(1), events.collect())
            .await
            .expect("cancelled run should finish without waiting for its fetches");
    let summary = finished(&events);
    assert!(summary.cancelled);
    assert_eq!(summary.fetched, 0);
    assert!(store.is_empty().await);
}

fn finished(events: &[IngestEvent]) -> &RunSummary {
    events
        .iter()
        .find_map(|e| match e {
            IngestEvent::Finished(summary) => Some(summary),
            _ => None,
        })
        .expect("run should emit Finished")
}

fn pipeline(store: Arc<MemoryStore>, fetcher: Arc<dyn Fetcher>) -> IngestPipeline {
    IngestPipeline::new(store, fetcher, None).with_batch_size(2)
}

#[tokio::test]
async fn test_fresh_run_fetches_everything() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher::failing(&[url(2)]));
    let entries: Vec<UrlEntry> = (0..5).map(|n| UrlEntry::new(url(n), 100)).collect();

    let (results, summary) = pipeline(store.clone(), fetcher.clone())
        .run_collect(entries, OWNER)
        .await;

    assert_eq!(results.len(), 5);
    assert_eq!(summary.total, 5);
    assert_eq!(summary.fetched, 5);
    assert_eq!(summary.fetch_failed, 1);
    assert_eq!(summary.kept, 0);
    assert!(!summary.cancelled);
    // batches of two: 2 + 2 + 1
    assert_eq!(*fetcher.batches.lock().unwrap(), 3);
    assert_eq!(fetcher.calls(), (0..5).map(url).collect::<Vec<_>>());
    assert_eq!(store.list_current(OWNER).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_second_run_reuses_valid_results() {
    let store = Arc::new(MemoryStore::new());
    let first = Arc::new(ScriptedFetcher::failing(&[url(1)]));
    let entries: Vec<UrlEntry> = (0..3).map(|n| UrlEntry::new(url(n), 100)).collect();
    pipeline(store.clone(), first).run_collect(entries, OWNER).await;

    let second = Arc::new(ScriptedFetcher::default());
    let entries = vec![
        UrlEntry::new(url(0), 100),
        UrlEntry::new(url(1), 100),
        UrlEntry::new(url(2), 750),
    ];
    let (results, summary) = pipeline(store.clone(), second.clone())
        .run_collect(entries, OWNER)
        .await;

    // only the previously failed URL goes back out
    assert_eq!(second.calls(), vec![url(1)]);
    assert_eq!(summary.kept, 2);
    assert_eq!(summary.volume_updated, 1);
    assert_eq!(summary.fetched, 1);
    assert_eq!(results.len(), 3);

    let updated = store.find_latest(&url(2), OWNER).await.unwrap().unwrap();
    assert_eq!(updated.search_volume, 750);
    assert_eq!(store.history(&url(2), OWNER).await.len(), 1);

    // the failed attempt stays in history behind the fresh success
    let history = store.history(&url(1), OWNER).await;
    assert_eq!(history.len(), 2);
    assert!(!history[0].success);
    assert!(history[1].success);
}

#[tokio::test]
async fn test_owners_do_not_share_results() {
    let store = Arc::new(MemoryStore::new());
    let entries = vec![UrlEntry::new(url(0), 10)];
    pipeline(store.clone(), Arc::new(ScriptedFetcher::default()))
        .run_collect(entries.clone(), "alice")
        .await;

    let fetcher = Arc::new(ScriptedFetcher::default());
    let (_, summary) = pipeline(store, fetcher.clone())
        .run_collect(entries, "bob")
        .await;
    assert_eq!(summary.kept, 0);
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test]
async fn test_broken_batch_falls_back_to_single_fetches() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher {
        batch_broken: true,
        ..ScriptedFetcher::default()
    });
    let entries: Vec<UrlEntry> = (0..3).map(|n| UrlEntry::new(url(n), 1)).collect();

    let (results, summary) = pipeline(store.clone(), fetcher.clone())
        .run_collect(entries, OWNER)
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(summary.fetched, 3);
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(store.len().await, 3);
}

#[tokio::test]
async fn test_event_sequence() {
    let store = Arc::new(MemoryStore::new());
    let entries = vec![UrlEntry::new(url(0), 1), UrlEntry::new(url(1), 1)];
    let mut events = pipeline(store, Arc::new(ScriptedFetcher::default()))
        .run(entries, OWNER)
        .await;

    let mut states = Vec::new();
    let mut fetch_progress = Vec::new();
    let mut finished = false;
    while let Some(event) = events.next().await {
        match event {
            IngestEvent::State(state) => states.push(state),
            IngestEvent::Progress(p) if p.phase == Phase::Fetching => {
                fetch_progress.push((p.completed, p.total))
            }
            IngestEvent::Finished(summary) => {
                finished = true;
                assert_eq!(summary.fetched, 2);
            }
            _ => {}
        }
    }

    assert!(finished);
    assert_eq!(
        states,
        vec![RunState::LoadingExisting, RunState::Processing, RunState::Idle]
    );
    assert_eq!(fetch_progress, vec![(2, 2)]);
}

#[tokio::test]
async fn test_reset_discards_in_flight_batch() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(GatedFetcher {
        started: Notify::new(),
        release: Notify::new(),
    });
    let pipeline = pipeline(store.clone(), fetcher.clone());
    let entries: Vec<UrlEntry> = (0..4).map(|n| UrlEntry::new(url(n), 1)).collect();

    let events = pipeline.run(entries, OWNER).await;
    fetcher.started.notified().await;
    assert!(pipeline.is_running(OWNER).await);

    pipeline.reset(OWNER).await;
    fetcher.release.notify_one();

    let events: Vec<IngestEvent> = events.collect().await;
    let stored = events
        .iter()
        .filter(|e| matches!(e, IngestEvent::Result(_)))
        .count();
    assert_eq!(stored, 0);
    let summary = finished(&events);
    assert!(summary.cancelled);
    assert_eq!(summary.fetched, 0);
    assert!(store.is_empty().await);
    assert!(!pipeline.is_running(OWNER).await);
}

#[tokio::test]
async fn test_new_run_supersedes_old_one() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(GatedFetcher {
        started: Notify::new(),
        release: Notify::new(),
    });
    let pipeline = pipeline(store.clone(), fetcher.clone());

    let old = pipeline.run(vec![UrlEntry::new(url(0), 1)], OWNER).await;
    fetcher.started.notified().await;

    let newer = pipeline.run(vec![UrlEntry::new(url(1), 1)], OWNER).await;
    fetcher.release.notify_one();
    let old_events: Vec<IngestEvent> = old.collect().await;
    assert!(finished(&old_events).cancelled);

    fetcher.started.notified().await;
    fetcher.release.notify_one();
    let new_events: Vec<IngestEvent> = newer.collect().await;
    let summary = finished(&new_events);
    assert!(!summary.cancelled);
    assert_eq!(summary.fetched, 1);

    let current = store.list_current(OWNER).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].url, url(1));
}

#[tokio::test]
async fn test_retry_single_url() {
    let store = Arc::new(MemoryStore::new());
    let failing = Arc::new(ScriptedFetcher::failing(&[url(0)]));
    pipeline(store.clone(), failing)
        .run_collect(vec![UrlEntry::new(url(0), 40)], OWNER)
        .await;

    let retried = pipeline(store.clone(), Arc::new(ScriptedFetcher::default()))
        .retry(&UrlEntry::new(url(0), 40), OWNER)
        .await
        .unwrap();
    assert!(retried.success);
    assert!(retried.is_reusable());
    assert_eq!(store.history(&url(0), OWNER).await.len(), 2);
}

#[tokio::test]
async fn test_reset_does_not_wait_for_stalled_batch() {
    cancel_stalled_run(false).await;
}

#[tokio::test]
async fn test_reset_does_not_wait_for_stalled_single_fetch() {
    cancel_stalled_run(true).await;
}
