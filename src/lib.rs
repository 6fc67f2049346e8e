pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod input;
pub mod metrics;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod proxy;
pub mod repository;
pub mod scheduler;
pub mod traffic;

pub use aggregate::DomainAggregator;
pub use cache::ResponseCache;
pub use error::{Error, Result};
pub use metrics::collector::MetricsCollector;
pub use metrics::snapshot::MetricsSnapshot;
pub use model::{DomainStats, FetchResult, StoredResult, UrlEntry};
pub use pipeline::{IngestEvent, IngestPipeline, RunState, RunSummary};
pub use proxy::{Fetcher, ProxyFetcher};
pub use repository::{MemoryStore, ResultStore, SqliteStore};
pub use scheduler::Scheduler;
