//! Per-domain ranking statistics over stored search results.

use crate::error::{Error, Result};
use crate::model::{DomainStats, Ranking, StoredResult, UrlRanking, search_query};
use crate::traffic::estimated_traffic;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_PROGRESS_INTERVAL: usize = 100;

/// Lowercased host of `url` without a leading `www.`; empty when the URL
/// does not parse or has no host.
pub fn normalize_domain(url: &str) -> String {
    let host = match url::Url::parse(url) {
        Ok(parsed) => parsed.host_str().map(str::to_lowercase),
        Err(_) => None,
    };
    match host {
        Some(host) => host
            .strip_prefix("www.")
            .map(str::to_string)
            .unwrap_or(host),
        None => String::new(),
    }
}

#[derive(Default)]
struct DomainAccumulator {
    position_sum: f64,
    count: u64,
    traffic: u64,
    queries: BTreeSet<String>,
    urls: Vec<UrlRanking>,
    url_index: HashMap<String, usize>,
}

impl DomainAccumulator {
    fn add(&mut self, url: &str, ranking: Ranking) {
        self.position_sum += ranking.position;
        self.count += 1;
        self.traffic += ranking.estimated_traffic;
        if !ranking.query.is_empty() {
            self.queries.insert(ranking.query.clone());
        }

        let index = match self.url_index.get(url) {
            Some(index) => *index,
            None => {
                self.urls.push(UrlRanking {
                    url: url.to_string(),
                    rankings: Vec::new(),
                });
                self.url_index.insert(url.to_string(), self.urls.len() - 1);
                self.urls.len() - 1
            }
        };
        self.urls[index].rankings.push(ranking);
    }

    fn finish(mut self, domain: String) -> DomainStats {
        for url in &mut self.urls {
            url.rankings.sort_by(|a, b| a.position.total_cmp(&b.position));
        }
        self.urls.sort_by(|a, b| a.best_position().total_cmp(&b.best_position()));

        DomainStats {
            domain,
            average_position: round2(self.position_sum / self.count as f64),
            occurrences: self.count,
            total_estimated_traffic: self.traffic,
            queries: self.queries,
            url_rankings: self.urls,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Groups organic results by domain. Holds no state between calls, so
/// aggregating the same input twice gives the same output.
#[derive(Debug, Clone)]
pub struct DomainAggregator {
    progress_interval: usize,
}

impl Default for DomainAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainAggregator {
    pub fn new() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn aggregate(&self, results: &[StoredResult]) -> Vec<DomainStats> {
        self.aggregate_with_progress(results, |_| {})
    }

    /// Like [`aggregate`](Self::aggregate), calling `on_progress` with a
    /// percentage every `progress_interval` results and once at the end.
    pub fn aggregate_with_progress<F>(
        &self,
        results: &[StoredResult],
        mut on_progress: F,
    ) -> Vec<DomainStats>
    where
        F: FnMut(u8),
    {
        let mut order: Vec<String> = Vec::new();
        let mut domains: HashMap<String, DomainAccumulator> = HashMap::new();
        let mut skipped = 0usize;

        for (index, result) in results.iter().enumerate() {
            match result.search_payload() {
                Ok(payload) => {
                    let query = if payload.search_parameters.query.is_empty() {
                        search_query(&result.url).unwrap_or_default()
                    } else {
                        payload.search_parameters.query
                    };

                    for entry in payload.organic_results {
                        let domain = normalize_domain(&entry.url);
                        if domain.is_empty() {
                            continue;
                        }
                        let ranking = Ranking {
                            query: query.clone(),
                            position: entry.position,
                            search_volume: result.search_volume,
                            estimated_traffic: estimated_traffic(
                                entry.position,
                                result.search_volume,
                            ),
                        };
                        domains
                            .entry(domain)
                            .or_insert_with_key(|domain| {
                                order.push(domain.clone());
                                DomainAccumulator::default()
                            })
                            .add(&entry.url, ranking);
                    }
                }
                Err(e) => {
                    log::debug!("Skipping {} during aggregation: {}", result.url, e);
                    skipped += 1;
                }
            }

            let done = index + 1;
            if done % self.progress_interval == 0 && done < results.len() {
                on_progress(((done * 100) / results.len()) as u8);
            }
        }
        on_progress(100);

        if skipped > 0 {
            log::info!(
                "Skipped {} of {} results without a usable payload",
                skipped,
                results.len()
            );
        }

        let mut stats: Vec<DomainStats> = order
            .into_iter()
            .filter_map(|domain| {
                let accumulator = domains.remove(&domain)?;
                Some(accumulator.finish(domain))
            })
            .collect();
        stats.sort_by(|a, b| b.total_estimated_traffic.cmp(&a.total_estimated_traffic));
        stats
    }

    /// Runs the aggregation on the blocking pool.
    pub fn spawn(&self, results: Vec<StoredResult>) -> AggregationTask {
        let (progress_tx, progress_rx) = watch::channel(0u8);
        let aggregator = self.clone();
        let handle = tokio::task::spawn_blocking(move || {
            aggregator.aggregate_with_progress(&results, |percent| {
                let _ = progress_tx.send(percent);
            })
        });
        AggregationTask {
            progress: progress_rx,
            handle,
        }
    }
}

pub struct AggregationTask {
    pub progress: watch::Receiver<u8>,
    handle: JoinHandle<Vec<DomainStats>>,
}

impl AggregationTask {
    pub async fn join(self) -> Result<Vec<DomainStats>> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("aggregation task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;
    use chrono::Utc;

    fn stored(url: &str, volume: u64, contents: &str) -> StoredResult {
        StoredResult {
            id: 1,
            url: url.to_string(),
            owner_id: "o".to_string(),
            http_status: 200,
            success: true,
            payload: Some(Payload::new(contents)),
            error: None,
            search_volume: volume,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("https://WWW.Example.com/path"), "example.com");
        assert_eq!(normalize_domain("http://a.example.com:8080/x"), "a.example.com");
        assert_eq!(normalize_domain("not a url"), "");
        assert_eq!(normalize_domain("mailto:someone@example.com"), "");
    }

    #[test]
    fn test_single_result() {
        let results = vec![stored(
            "https://www.google.com/search?q=x",
            1000,
            r#"{"organicResults":[{"position":1,"url":"https://a.example.com/x"}]}"#,
        )];
        let stats = DomainAggregator::new().aggregate(&results);

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].domain, "a.example.com");
        assert_eq!(stats[0].occurrences, 1);
        assert_eq!(stats[0].average_position, 1.0);
        assert_eq!(stats[0].total_estimated_traffic, 300);
        // falls back to the q parameter of the search URL
        assert!(stats[0].queries.contains("x"));
    }

    #[test]
    fn test_grouping_and_ordering() {
        let results = vec![
            stored(
                "https://s/?q=one",
                100,
                r#"{"searchParameters":{"query":"one"},"organicResults":[
                    {"position":3,"url":"https://www.small.com/a"},
                    {"position":1,"url":"https://big.com/a"},
                    {"position":2,"url":"https://big.com/b"}]}"#,
            ),
            stored(
                "https://s/?q=two",
                100,
                r#"{"searchParameters":{"query":"two"},"organicResults":[
                    {"position":4,"url":"https://big.com/a"},
                    {"position":1,"url":"https://small.com/b"}]}"#,
            ),
        ];
        let stats = DomainAggregator::new().aggregate(&results);

        assert_eq!(stats.len(), 2);
        let big = &stats[0];
        assert_eq!(big.domain, "big.com");
        assert_eq!(big.occurrences, 3);
        assert_eq!(big.average_position, 2.33);
        assert_eq!(big.total_estimated_traffic, 30 + 13 + 6);
        assert_eq!(big.queries.len(), 2);
        assert_eq!(big.url_rankings[0].url, "https://big.com/a");
        assert_eq!(big.url_rankings[0].rankings.len(), 2);
        assert_eq!(big.url_rankings[0].rankings[0].position, 1.0);

        let small = &stats[1];
        assert_eq!(small.domain, "small.com");
        assert_eq!(small.url_rankings[0].url, "https://small.com/b");

        for domain in &stats {
            let occurrences: usize = domain.url_rankings.iter().map(|u| u.rankings.len()).sum();
            let traffic: u64 = domain
                .url_rankings
                .iter()
                .flat_map(|u| &u.rankings)
                .map(|r| r.estimated_traffic)
                .sum();
            assert_eq!(domain.occurrences as usize, occurrences);
            assert_eq!(domain.total_estimated_traffic, traffic);
        }
    }

    #[test]
    fn test_bad_payloads_are_skipped() {
        let mut failed = stored("https://s/?q=f", 10, "");
        failed.payload = None;
        let results = vec![
            stored("https://s/?q=a", 10, "<html>not json</html>"),
            stored("https://s/?q=b", 10, r#"{"searchParameters":{"query":"b"}}"#),
            failed,
            stored(
                "https://s/?q=c",
                10,
                r#"{"organicResults":[{"position":1,"url":"::bad::"},{"position":2,"url":"https://ok.com/"}]}"#,
            ),
        ];
        let stats = DomainAggregator::new().aggregate(&results);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].domain, "ok.com");
    }

    #[test]
    fn test_ties_keep_discovery_order() {
        let results = vec![stored(
            "https://s/?q=t",
            0,
            r#"{"organicResults":[
                {"position":1,"url":"https://first.com/"},
                {"position":2,"url":"https://second.com/"},
                {"position":3,"url":"https://third.com/"}]}"#,
        )];
        let stats = DomainAggregator::new().aggregate(&results);
        let domains: Vec<&str> = stats.iter().map(|s| s.domain.as_str()).collect();
        assert_eq!(domains, ["first.com", "second.com", "third.com"]);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let results = vec![stored(
            "https://s/?q=i",
            500,
            r#"{"organicResults":[{"position":1.5,"url":"https://a.com/"},{"position":7,"url":"https://b.com/"}]}"#,
        )];
        let aggregator = DomainAggregator::new();
        assert_eq!(aggregator.aggregate(&results), aggregator.aggregate(&results));
    }

    #[test]
    fn test_progress_reports() {
        let results: Vec<StoredResult> = (0..10)
            .map(|i| stored(&format!("https://s/?q={}", i), 1, "{}"))
            .collect();
        let mut seen = Vec::new();
        DomainAggregator::new()
            .with_progress_interval(3)
            .aggregate_with_progress(&results, |p| seen.push(p));
        assert_eq!(seen, vec![30, 60, 90, 100]);
    }

    #[tokio::test]
    async fn test_spawned_aggregation() {
        let results = vec![stored(
            "https://s/?q=x",
            1000,
            r#"{"organicResults":[{"position":1,"url":"https://a.example.com/x"}]}"#,
        )];
        let task = DomainAggregator::new().spawn(results);
        let progress = task.progress.clone();
        let stats = task.join().await.unwrap();
        assert_eq!(stats[0].total_estimated_traffic, 300);
        assert_eq!(*progress.borrow(), 100);
    }
}
