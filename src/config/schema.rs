use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default = "default_owner_id")]
    #[validate(length(min = 1))]
    pub owner_id: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Ordered proxy backends; empty means the built-in list.
    #[serde(default)]
    #[validate(custom = "validate_proxies")]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    #[validate]
    pub fetch: FetchConfig,

    #[serde(default)]
    #[validate]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    #[validate]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub output: Option<OutputConfig>,

    /// Optional path to a parent configuration file to inherit from
    #[serde(default)]
    pub extends: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
            database: DatabaseConfig::default(),
            proxies: Vec::new(),
            fetch: FetchConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            output: None,
            extends: None,
        }
    }
}

impl AppConfig {
    pub fn effective_proxies(&self) -> Vec<ProxyConfig> {
        if self.proxies.is_empty() {
            ProxyConfig::builtin()
        } else {
            self.proxies.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// A proxy that fronts the target URL. `{url}` in the template expands to
/// the percent-encoded target, `{raw}` to the target as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub template: String,
}

impl ProxyConfig {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }

    pub fn builtin() -> Vec<ProxyConfig> {
        vec![
            ProxyConfig::new("passthrough", "https://corsproxy.io/?{url}"),
            ProxyConfig::new("allorigins", "https://api.allorigins.win/get?url={url}"),
            ProxyConfig::new("relay", "https://thingproxy.freeboard.io/fetch/{raw}"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_scheduler_bounds"))]
pub struct SchedulerConfig {
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    #[validate(range(min = 1))]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_initial_rate")]
    pub initial_rate: f64,
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_success_streak")]
    #[validate(range(min = 1))]
    pub success_streak: u32,
    #[serde(default = "default_failure_streak")]
    #[validate(range(min = 1))]
    pub failure_streak: u32,
    #[serde(default = "default_slow_task_ms")]
    pub slow_task_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: default_initial_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            initial_rate: default_initial_rate(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            success_streak: default_success_streak(),
            failure_streak: default_failure_streak(),
            slow_task_ms: default_slow_task_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,
    #[serde(default = "default_lookup_chunk_size")]
    #[validate(range(min = 1))]
    pub lookup_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_pipeline_batch_size(),
            lookup_chunk_size: default_lookup_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    Console,
    Json {
        path: String,
    },
    Csv {
        path: String,
    },
}

fn validate_proxies(proxies: &Vec<ProxyConfig>) -> Result<(), ValidationError> {
    for proxy in proxies {
        if proxy.name.trim().is_empty() {
            return Err(ValidationError::new("proxy_name_empty"));
        }
        if !proxy.template.contains("{url}") && !proxy.template.contains("{raw}") {
            return Err(ValidationError::new("proxy_template_missing_placeholder"));
        }
    }
    Ok(())
}

fn validate_scheduler_bounds(config: &SchedulerConfig) -> Result<(), ValidationError> {
    if config.min_batch_size > config.max_batch_size {
        return Err(ValidationError::new("batch_size_bounds"));
    }
    if !(config.min_rate > 0.0 && config.min_rate <= config.max_rate) {
        return Err(ValidationError::new("rate_bounds"));
    }
    if config.min_delay_ms > config.max_delay_ms {
        return Err(ValidationError::new("delay_bounds"));
    }
    Ok(())
}

fn default_owner_id() -> String {
    "local".to_string()
}

fn default_database_path() -> String {
    "serp-ranker.db".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    "serp-ranker/0.1".to_string()
}

fn default_initial_batch_size() -> usize {
    3
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    5
}

fn default_initial_rate() -> f64 {
    0.2
}

fn default_min_rate() -> f64 {
    0.05
}

fn default_max_rate() -> f64 {
    0.5
}

fn default_min_delay_ms() -> u64 {
    5000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_success_streak() -> u32 {
    5
}

fn default_failure_streak() -> u32 {
    2
}

fn default_slow_task_ms() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_capacity() -> usize {
    100
}

fn default_pipeline_batch_size() -> usize {
    10
}

fn default_lookup_chunk_size() -> usize {
    100
}
