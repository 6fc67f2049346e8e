//! Sinks for the domain report.

use crate::config::OutputConfig;
use crate::error::Result;
use crate::model::DomainStats;
use async_trait::async_trait;
use indicatif::MultiProgress;
use std::path::PathBuf;
use std::sync::Arc;

pub mod console;
pub mod csv;
pub mod json;

pub use console::ConsoleOutput;
pub use csv::CsvOutput;
pub use json::JsonOutput;

#[async_trait]
pub trait OutputHandler: Send + Sync {
    async fn write(&mut self, stats: &DomainStats) -> Result<()>;
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the configured sink; no configuration means the console.
pub fn create_handler(
    config: Option<&OutputConfig>,
    multi: Option<Arc<MultiProgress>>,
) -> Result<Box<dyn OutputHandler>> {
    Ok(match config {
        None | Some(OutputConfig::Console) => Box::new(ConsoleOutput::new(multi)),
        Some(OutputConfig::Json { path }) => Box::new(JsonOutput::new(PathBuf::from(path))?),
        Some(OutputConfig::Csv { path }) => Box::new(CsvOutput::new(PathBuf::from(path))?),
    })
}
