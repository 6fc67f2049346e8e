use super::OutputHandler;
use crate::error::{Error, Result};
use crate::model::DomainStats;
use async_trait::async_trait;
use std::path::PathBuf;

const HEADERS: [&str; 5] = [
    "domain",
    "average_position",
    "occurrences",
    "total_estimated_traffic",
    "queries",
];

/// Flattened report: one row per domain, queries joined with `; `.
pub struct CsvOutput {
    writer: csv::Writer<std::fs::File>,
    headers_written: bool,
}

impl CsvOutput {
    pub fn new(path: PathBuf) -> Result<Self> {
        let writer = csv::Writer::from_path(path).map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            writer,
            headers_written: false,
        })
    }

    fn write_headers(&mut self) -> Result<()> {
        if !self.headers_written {
            self.writer
                .write_record(HEADERS)
                .map_err(|e| Error::Internal(e.to_string()))?;
            self.headers_written = true;
        }
        Ok(())
    }
}

#[async_trait]
impl OutputHandler for CsvOutput {
    async fn write(&mut self, stats: &DomainStats) -> Result<()> {
        self.write_headers()?;

        let queries = stats
            .queries
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        self.writer
            .write_record([
                stats.domain.clone(),
                format!("{:.2}", stats.average_position),
                stats.occurrences.to_string(),
                stats.total_estimated_traffic.to_string(),
                queries,
            ])
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // an empty report still gets its header row
        self.write_headers()?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_flattened_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");

        let mut output = CsvOutput::new(path.clone()).unwrap();
        output
            .write(&DomainStats {
                domain: "a.com".to_string(),
                average_position: 2.0,
                occurrences: 3,
                total_estimated_traffic: 120,
                queries: BTreeSet::from(["beta".to_string(), "alpha".to_string()]),
                url_rankings: Vec::new(),
            })
            .await
            .unwrap();
        output.close().await.unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines[0],
            "domain,average_position,occurrences,total_estimated_traffic,queries"
        );
        assert_eq!(lines[1], "a.com,2.00,3,120,alpha; beta");
    }

    #[tokio::test]
    async fn test_empty_report_has_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");

        let mut output = CsvOutput::new(path.clone()).unwrap();
        output.close().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap().trim_end(),
            "domain,average_position,occurrences,total_estimated_traffic,queries"
        );
    }
}
