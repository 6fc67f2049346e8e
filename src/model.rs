//! Records flowing through the ingest pipeline and the aggregation engine.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One validated input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub url: String,
    pub search_volume: u64,
}

impl UrlEntry {
    pub fn new(url: impl Into<String>, search_volume: u64) -> Self {
        Self {
            url: url.into(),
            search_volume,
        }
    }

    pub fn query(&self) -> Option<String> {
        search_query(&self.url)
    }
}

/// The `q` parameter of a search URL, if it carries one.
pub fn search_query(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())
}

/// Normalized proxy response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub contents: String,
}

impl Payload {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contents.trim().is_empty()
    }

    pub fn parse(&self) -> Result<SearchResultPayload> {
        SearchResultPayload::parse(&self.contents)
    }
}

/// Outcome of one fetch through the proxy chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub http_status: u16,
    pub success: bool,
    pub payload: Option<Payload>,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(url: impl Into<String>, http_status: u16, payload: Payload) -> Self {
        Self {
            url: url.into(),
            http_status,
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(url: impl Into<String>, http_status: u16, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_status,
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn has_payload(&self) -> bool {
        self.payload.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// A fetch outcome on its way into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub fetch: FetchResult,
    pub owner_id: String,
    pub search_volume: u64,
}

/// A persisted fetch attempt. The newest record per (url, owner) is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub url: String,
    pub owner_id: String,
    pub http_status: u16,
    pub success: bool,
    pub payload: Option<Payload>,
    pub error: Option<String>,
    pub search_volume: u64,
    pub created_at: DateTime<Utc>,
}

impl StoredResult {
    /// True when the payload parses and carries at least one organic result.
    pub fn has_valid_payload(&self) -> bool {
        self.search_payload()
            .is_ok_and(|payload| !payload.organic_results.is_empty())
    }

    pub fn search_payload(&self) -> Result<SearchResultPayload> {
        match &self.payload {
            Some(payload) => payload.parse(),
            None => Err(Error::Payload(format!("no payload stored for {}", self.url))),
        }
    }

    /// Whether this record can be reused without fetching again.
    pub fn is_reusable(&self) -> bool {
        self.success && self.has_valid_payload()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchParameters {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganicResult {
    pub position: f64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// The search result document embedded in `Payload::contents`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultPayload {
    pub search_parameters: SearchParameters,
    pub organic_results: Vec<OrganicResult>,
}

#[derive(Deserialize)]
struct RawPayload {
    #[serde(default, alias = "searchParameters")]
    search_parameters: Option<RawSearchParameters>,
    #[serde(default, alias = "organicResults")]
    organic_results: Option<Vec<Value>>,
    #[serde(default)]
    result: Option<RawNestedResult>,
}

#[derive(Deserialize)]
struct RawSearchParameters {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Deserialize)]
struct RawNestedResult {
    #[serde(default, alias = "organicResults")]
    organic_results: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct RawOrganicResult {
    position: Option<f64>,
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl SearchResultPayload {
    /// Parses the embedded JSON, accepting camelCase, snake_case and the
    /// nested `result.organic_results` layout. Any shape problem collapses
    /// into a single `Error::Payload`.
    pub fn parse(contents: &str) -> Result<Self> {
        let raw: RawPayload = serde_json::from_str(contents)
            .map_err(|e| Error::Payload(format!("invalid JSON: {}", e)))?;

        let entries = raw
            .organic_results
            .or_else(|| raw.result.and_then(|r| r.organic_results))
            .ok_or_else(|| Error::Payload("missing organic results".to_string()))?;

        let query = raw
            .search_parameters
            .and_then(|p| p.query)
            .unwrap_or_default();

        let organic_results = entries
            .into_iter()
            .filter_map(|value| serde_json::from_value::<RawOrganicResult>(value).ok())
            .filter_map(|entry| {
                let position = entry.position.filter(|p| p.is_finite() && *p >= 1.0)?;
                let url = entry.url.filter(|u| !u.is_empty())?;
                Some(OrganicResult {
                    position,
                    url,
                    title: entry.title,
                    description: entry.description,
                })
            })
            .collect();

        Ok(Self {
            search_parameters: SearchParameters { query },
            organic_results,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub query: String,
    pub position: f64,
    pub search_volume: u64,
    pub estimated_traffic: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRanking {
    pub url: String,
    pub rankings: Vec<Ranking>,
}

impl UrlRanking {
    pub fn best_position(&self) -> f64 {
        self.rankings
            .iter()
            .map(|r| r.position)
            .fold(f64::INFINITY, f64::min)
    }
}

/// Per-domain ranking statistics, recomputed on every aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub domain: String,
    pub average_position: f64,
    pub occurrences: u64,
    pub total_estimated_traffic: u64,
    pub queries: BTreeSet<String>,
    pub url_rankings: Vec<UrlRanking>,
}
