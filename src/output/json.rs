use super::OutputHandler;
use crate::error::Result;
use crate::model::DomainStats;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Writes the report as a single JSON array, one element per domain.
pub struct JsonOutput {
    writer: BufWriter<File>,
    first: bool,
}

impl JsonOutput {
    pub fn new(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        write!(writer, "[")?;

        Ok(Self {
            writer,
            first: true,
        })
    }
}

#[async_trait]
impl OutputHandler for JsonOutput {
    async fn write(&mut self, stats: &DomainStats) -> Result<()> {
        if self.first {
            self.first = false;
        } else {
            write!(self.writer, ",")?;
        }
        serde_json::to_writer(&mut self.writer, stats)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        write!(self.writer, "]")?;
        self.writer.flush()?;
        Ok(())
    }
}
