pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AppConfig, CacheConfig, DatabaseConfig, FetchConfig, OutputConfig, PipelineConfig,
    ProxyConfig, SchedulerConfig,
};
