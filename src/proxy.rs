//! Fetching target URLs through an ordered chain of proxy backends.
//!
//! A fetch walks the chain until one proxy yields a usable body; if every
//! proxy fails, the whole chain is retried after `base_delay * attempt`.
//! Whatever envelope a proxy wraps the body in is flattened into
//! `Payload::contents`. Successful results are cached and cache hits skip
//! the scheduler entirely.

use crate::cache::ResponseCache;
use crate::config::{FetchConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::model::{FetchResult, Payload};
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Never fails: an unreachable URL comes back as an unsuccessful result.
    async fn fetch(&self, url: &str) -> FetchResult;

    /// One result per input URL, in input order.
    async fn fetch_batch(&self, urls: &[String]) -> Result<Vec<FetchResult>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyBackend {
    pub name: String,
    template: String,
}

impl ProxyBackend {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }

    pub fn rewrite(&self, target: &str) -> String {
        self.template
            .replace("{url}", &urlencoding::encode(target))
            .replace("{raw}", target)
    }
}

impl From<ProxyConfig> for ProxyBackend {
    fn from(config: ProxyConfig) -> Self {
        Self::new(config.name, config.template)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedBody {
    Usable(Payload),
    /// The proxy answered but reports a non-OK status from the target.
    UpstreamStatus(u16),
    Unusable(String),
}

/// Flattens a proxy response body into a single contents string.
///
/// Envelopes with a `contents` field pass the string through; any other JSON
/// is re-serialized, and non-JSON bodies are kept verbatim.
pub fn normalize_body(body: &str) -> NormalizedBody {
    if body.trim().is_empty() {
        return NormalizedBody::Unusable("empty response body".to_string());
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) if map.contains_key("contents") => {
            let upstream = map
                .get("status")
                .and_then(|status| status.get("http_code"))
                .and_then(Value::as_u64);
            if let Some(code) = upstream {
                if !(200..300).contains(&code) {
                    return NormalizedBody::UpstreamStatus(code as u16);
                }
            }

            match map.get("contents") {
                Some(Value::String(contents)) => {
                    NormalizedBody::Usable(Payload::new(contents.clone()))
                }
                Some(Value::Null) | None => {
                    NormalizedBody::Unusable("proxy envelope has no contents".to_string())
                }
                Some(other) => NormalizedBody::Usable(Payload::new(other.to_string())),
            }
        }
        Ok(value) => NormalizedBody::Usable(Payload::new(value.to_string())),
        Err(_) => NormalizedBody::Usable(Payload::new(body)),
    }
}

#[derive(Debug)]
struct AttemptFailure {
    status: u16,
    message: String,
}

impl AttemptFailure {
    fn new(status: u16, message: String) -> Self {
        Self { status, message }
    }
}

struct ProxyChain {
    client: Client,
    proxies: Vec<ProxyBackend>,
    max_attempts: u32,
    retry_base_delay: Duration,
    metrics: Arc<MetricsCollector>,
}

impl ProxyChain {
    async fn fetch_uncached(&self, url: &str) -> FetchResult {
        let started = Instant::now();
        let mut last_status = 0;
        let mut last_error = "no proxy backends configured".to_string();

        for attempt in 1..=self.max_attempts {
            for proxy in &self.proxies {
                match self.try_proxy(proxy, url).await {
                    Ok((status, payload)) => {
                        log::debug!("Fetched {} via {}", url, proxy.name);
                        self.metrics.record_success(started.elapsed());
                        return FetchResult::success(url, status, payload);
                    }
                    Err(failure) => {
                        log::debug!("Proxy {} failed for {}: {}", proxy.name, url, failure.message);
                        if failure.status != 0 {
                            last_status = failure.status;
                        }
                        last_error = failure.message;
                    }
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_base_delay * attempt;
                log::warn!(
                    "All proxies failed for {} (attempt {}/{}), retrying in {:?}",
                    url,
                    attempt,
                    self.max_attempts,
                    delay
                );
                sleep(delay).await;
            }
        }

        log::warn!("Giving up on {}: {}", url, last_error);
        self.metrics.record_failure(started.elapsed());
        FetchResult::failure(url, last_status, last_error)
    }

    async fn try_proxy(
        &self,
        proxy: &ProxyBackend,
        url: &str,
    ) -> std::result::Result<(u16, Payload), AttemptFailure> {
        let proxied = proxy.rewrite(url);
        let response = self
            .client
            .get(&proxied)
            .send()
            .await
            .map_err(|e| AttemptFailure::new(0, format!("{}: {}", proxy.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptFailure::new(
                status.as_u16(),
                format!("{} returned HTTP {}", proxy.name, status),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::new(status.as_u16(), format!("{}: {}", proxy.name, e)))?;

        match normalize_body(&body) {
            NormalizedBody::Usable(payload) => Ok((status.as_u16(), payload)),
            NormalizedBody::UpstreamStatus(code) => Err(AttemptFailure::new(
                code,
                format!("{}: upstream returned HTTP {}", proxy.name, code),
            )),
            NormalizedBody::Unusable(reason) => Err(AttemptFailure::new(
                status.as_u16(),
                format!("{}: {}", proxy.name, reason),
            )),
        }
    }
}

pub struct ProxyFetcher {
    chain: Arc<ProxyChain>,
    cache: Arc<ResponseCache>,
    scheduler: Scheduler,
    metrics: Arc<MetricsCollector>,
}

impl ProxyFetcher {
    pub fn new(
        proxies: Vec<ProxyConfig>,
        fetch: &FetchConfig,
        cache: Arc<ResponseCache>,
        scheduler: Scheduler,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .user_agent(fetch.user_agent.clone())
            .build()?;

        let chain = ProxyChain {
            client,
            proxies: proxies.into_iter().map(ProxyBackend::from).collect(),
            max_attempts: fetch.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(fetch.retry_base_delay_ms),
            metrics: metrics.clone(),
        };

        Ok(Self {
            chain: Arc::new(chain),
            cache,
            scheduler,
            metrics,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<FetchResult> {
        if let Some(hit) = self.cache.get(url).await {
            log::debug!("Cache hit for {}", url);
            self.metrics.increment_cache_hits();
            return Ok(hit);
        }

        let chain = self.chain.clone();
        let target = url.to_string();
        let result = self
            .scheduler
            .schedule(move || async move { chain.fetch_uncached(&target).await })
            .await?;

        self.cache.put(url, &result).await;
        Ok(result)
    }
}

#[async_trait]
impl Fetcher for ProxyFetcher {
    async fn fetch(&self, url: &str) -> FetchResult {
        match self.try_fetch(url).await {
            Ok(result) => result,
            Err(e) => FetchResult::failure(url, 0, e.to_string()),
        }
    }

    async fn fetch_batch(&self, urls: &[String]) -> Result<Vec<FetchResult>> {
        let results = join_all(urls.iter().map(|url| self.try_fetch(url))).await;
        let results = results.into_iter().collect::<Result<Vec<_>>>()?;
        if results.len() != urls.len() {
            return Err(Error::Internal(format!(
                "batch returned {} results for {} urls",
                results.len(),
                urls.len()
            )));
        }
        Ok(results)
    }
}
