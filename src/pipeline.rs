//! Per-owner ingest runs: reuse what is already stored, fetch the rest in
//! batches, and persist every outcome as soon as its batch settles.

use crate::error::Result;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::model::{FetchResult, NewResult, StoredResult, UrlEntry};
use crate::proxy::Fetcher;
use crate::repository::ResultStore;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 10;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    LoadingExisting,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Classifying,
    Fetching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed * 100) / self.total).min(100) as u8
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub kept: usize,
    pub volume_updated: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub persist_errors: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub enum IngestEvent {
    State(RunState),
    Progress(Progress),
    Result(StoredResult),
    PersistFailed { url: String, error: String },
    Finished(RunSummary),
}

struct ActiveRun {
    id: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn ResultStore>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<MetricsCollector>,
    batch_size: usize,
    runs: Arc<Mutex<HashMap<String, ActiveRun>>>,
    next_run_id: Arc<AtomicU64>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ResultStore>,
        fetcher: Arc<dyn Fetcher>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            fetcher,
            metrics: metrics.unwrap_or_else(|| Arc::new(MetricsCollector::new())),
            batch_size: DEFAULT_BATCH_SIZE,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_run_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Starts a run for `owner_id`, cancelling any run that owner already
    /// has in flight. Events arrive in the order they happen; the stream
    /// ends after `IngestEvent::Finished`.
    pub async fn run(&self, entries: Vec<UrlEntry>, owner_id: &str) -> ReceiverStream<IngestEvent> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (run_id, token) = self.begin_run(owner_id).await;

        let pipeline = self.clone();
        let owner = owner_id.to_string();
        tokio::spawn(async move {
            let summary = pipeline.execute(entries, &owner, &token, &events_tx).await;
            pipeline.end_run(&owner, run_id).await;
            log::info!(
                "Ingest run for {} finished: {} kept, {} fetched ({} failed), {} save errors{}",
                owner,
                summary.kept,
                summary.fetched,
                summary.fetch_failed,
                summary.persist_errors,
                if summary.cancelled { ", cancelled" } else { "" }
            );
            let _ = events_tx.send(IngestEvent::State(RunState::Idle)).await;
            let _ = events_tx.send(IngestEvent::Finished(summary)).await;
        });

        ReceiverStream::new(events_rx)
    }

    /// Runs to completion and returns every result in emission order.
    pub async fn run_collect(
        &self,
        entries: Vec<UrlEntry>,
        owner_id: &str,
    ) -> (Vec<StoredResult>, RunSummary) {
        let mut events = self.run(entries, owner_id).await;
        let mut results = Vec::new();
        let mut summary = RunSummary::default();
        while let Some(event) = events.next().await {
            match event {
                IngestEvent::Result(result) => results.push(result),
                IngestEvent::Finished(done) => summary = done,
                _ => {}
            }
        }
        (results, summary)
    }

    /// Cancels the owner's in-flight run, if any. Requests already issued
    /// are left to drain but nothing further is persisted for that run.
    pub async fn reset(&self, owner_id: &str) {
        if let Some(run) = self.runs.lock().await.remove(owner_id) {
            log::info!("Cancelling ingest run {} for {}", run.id, owner_id);
            run.token.cancel();
        }
    }

    pub async fn is_running(&self, owner_id: &str) -> bool {
        self.runs.lock().await.contains_key(owner_id)
    }

    /// Fetches and saves a single URL again, outside of any run.
    pub async fn retry(&self, entry: &UrlEntry, owner_id: &str) -> Result<StoredResult> {
        log::info!("Retrying {}", entry.url);
        let fetch = self.fetcher.fetch(&entry.url).await;
        let stored = self
            .store
            .upsert(NewResult {
                fetch,
                owner_id: owner_id.to_string(),
                search_volume: entry.search_volume,
            })
            .await?;
        self.metrics.increment_results_stored();
        Ok(stored)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn watch_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        let (tx, rx) = watch::channel(self.metrics.snapshot());
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                if tx.send(metrics.snapshot()).is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn begin_run(&self, owner_id: &str) -> (u64, CancellationToken) {
        let id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self.runs.lock().await.insert(
            owner_id.to_string(),
            ActiveRun {
                id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            log::info!(
                "Run {} supersedes run {} for {}",
                id,
                previous.id,
                owner_id
            );
            previous.token.cancel();
        }
        (id, token)
    }

    async fn end_run(&self, owner_id: &str, run_id: u64) {
        let mut runs = self.runs.lock().await;
        if runs.get(owner_id).is_some_and(|run| run.id == run_id) {
            runs.remove(owner_id);
        }
    }

    async fn execute(
        &self,
        entries: Vec<UrlEntry>,
        owner_id: &str,
        token: &CancellationToken,
        events: &mpsc::Sender<IngestEvent>,
    ) -> RunSummary {
        let mut summary = RunSummary {
            total: entries.len(),
            ..RunSummary::default()
        };
        log::info!("Starting ingest run for {} with {} URLs", owner_id, entries.len());
        self.metrics.add_urls_queued(entries.len() as u64);

        let _ = events.send(IngestEvent::State(RunState::LoadingExisting)).await;
        let to_fetch = self
            .load_existing(&entries, owner_id, events, &mut summary)
            .await;
        if token.is_cancelled() {
            summary.cancelled = true;
            return summary;
        }

        let _ = events.send(IngestEvent::State(RunState::Processing)).await;
        log::info!(
            "{} URLs reused, {} to fetch in batches of {}",
            summary.kept,
            to_fetch.len(),
            self.batch_size
        );

        let mut completed = 0;
        for batch in to_fetch.chunks(self.batch_size) {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // cancellation drops the pending fetches; anything the scheduler
            // already started drains on its own
            let urls: Vec<String> = batch.iter().map(|e| e.url.clone()).collect();
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                fetched = self.fetcher.fetch_batch(&urls) => Some(fetched),
            };
            match fetched {
                None => {
                    log::info!("Run cancelled with {} fetches in flight", urls.len());
                    summary.cancelled = true;
                    break;
                }
                Some(Ok(results)) => {
                    for (entry, fetch) in batch.iter().zip(results) {
                        self.persist(entry, fetch, owner_id, events, &mut summary)
                            .await;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Batch fetch failed ({}), falling back to single fetches", e);
                    for entry in batch {
                        let fetch = tokio::select! {
                            biased;
                            _ = token.cancelled() => None,
                            fetch = self.fetcher.fetch(&entry.url) => Some(fetch),
                        };
                        match fetch {
                            Some(fetch) => {
                                self.persist(entry, fetch, owner_id, events, &mut summary)
                                    .await
                            }
                            None => {
                                summary.cancelled = true;
                                break;
                            }
                        }
                    }
                    if summary.cancelled {
                        break;
                    }
                }
            }

            completed += batch.len();
            self.metrics.add_urls_processed(batch.len() as u64);
            let _ = events
                .send(IngestEvent::Progress(Progress {
                    phase: Phase::Fetching,
                    completed,
                    total: to_fetch.len(),
                }))
                .await;
        }

        summary
    }

    /// Splits `entries` into reusable stored results (emitted right away)
    /// and the entries that still need a fetch.
    async fn load_existing(
        &self,
        entries: &[UrlEntry],
        owner_id: &str,
        events: &mpsc::Sender<IngestEvent>,
        summary: &mut RunSummary,
    ) -> Vec<UrlEntry> {
        let urls: Vec<String> = entries.iter().map(|e| e.url.clone()).collect();
        let mut existing: HashMap<String, StoredResult> =
            match self.store.find_latest_batch(&urls, owner_id).await {
                Ok(found) => found.into_iter().map(|r| (r.url.clone(), r)).collect(),
                Err(e) => {
                    log::warn!("Could not load stored results, fetching everything: {}", e);
                    HashMap::new()
                }
            };

        let mut to_fetch = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            match existing.remove(&entry.url) {
                Some(mut stored) if stored.is_reusable() => {
                    if stored.search_volume != entry.search_volume {
                        match self
                            .store
                            .update_volume_only(&entry.url, owner_id, entry.search_volume)
                            .await
                        {
                            Ok(()) => summary.volume_updated += 1,
                            Err(e) => {
                                log::error!("Failed to update volume for {}: {}", entry.url, e);
                                self.metrics.increment_store_errors();
                                summary.persist_errors += 1;
                            }
                        }
                        stored.search_volume = entry.search_volume;
                    }
                    summary.kept += 1;
                    self.metrics.increment_urls_reused();
                    let _ = events.send(IngestEvent::Result(stored)).await;
                }
                Some(_) | None => to_fetch.push(entry.clone()),
            }

            let _ = events
                .send(IngestEvent::Progress(Progress {
                    phase: Phase::Classifying,
                    completed: index + 1,
                    total: entries.len(),
                }))
                .await;
        }
        to_fetch
    }

    async fn persist(
        &self,
        entry: &UrlEntry,
        fetch: FetchResult,
        owner_id: &str,
        events: &mpsc::Sender<IngestEvent>,
        summary: &mut RunSummary,
    ) {
        summary.fetched += 1;
        if !fetch.success {
            summary.fetch_failed += 1;
        }

        let record = NewResult {
            fetch,
            owner_id: owner_id.to_string(),
            search_volume: entry.search_volume,
        };
        match self.store.upsert(record).await {
            Ok(stored) => {
                self.metrics.increment_results_stored();
                let _ = events.send(IngestEvent::Result(stored)).await;
            }
            Err(e) => {
                log::error!("Failed to save result for {}: {}", entry.url, e);
                self.metrics.increment_store_errors();
                summary.persist_errors += 1;
                let _ = events
                    .send(IngestEvent::PersistFailed {
                        url: entry.url.clone(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }
}
