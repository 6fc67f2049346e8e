use super::{Reconciliation, ResultStore, reconcile};
use crate::error::{Error, Result};
use crate::model::{NewResult, StoredResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Records {
    rows: Vec<StoredResult>,
    next_id: i64,
}

impl Records {
    fn latest(&self, url: &str, owner_id: &str) -> Option<&StoredResult> {
        self.rows
            .iter()
            .filter(|r| r.url == url && r.owner_id == owner_id)
            .max_by_key(|r| (r.created_at, r.id))
    }

    fn latest_mut(&mut self, url: &str, owner_id: &str) -> Option<&mut StoredResult> {
        self.rows
            .iter_mut()
            .filter(|r| r.url == url && r.owner_id == owner_id)
            .max_by_key(|r| (r.created_at, r.id))
    }
}

/// Store backed by a vector; keeps full history like the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record for (url, owner), oldest first.
    pub async fn history(&self, url: &str, owner_id: &str) -> Vec<StoredResult> {
        let records = self.records.lock().await;
        let mut history: Vec<StoredResult> = records
            .rows
            .iter()
            .filter(|r| r.url == url && r.owner_id == owner_id)
            .cloned()
            .collect();
        history.sort_by_key(|r| (r.created_at, r.id));
        history
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.rows.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn find_latest(&self, url: &str, owner_id: &str) -> Result<Option<StoredResult>> {
        let records = self.records.lock().await;
        Ok(records.latest(url, owner_id).cloned())
    }

    async fn find_latest_batch(
        &self,
        urls: &[String],
        owner_id: &str,
    ) -> Result<Vec<StoredResult>> {
        let records = self.records.lock().await;
        Ok(urls
            .iter()
            .filter_map(|url| records.latest(url, owner_id).cloned())
            .collect())
    }

    async fn upsert(&self, record: NewResult) -> Result<StoredResult> {
        let mut records = self.records.lock().await;
        let existing = records.latest(&record.fetch.url, &record.owner_id).cloned();

        match reconcile(existing.as_ref(), &record) {
            Reconciliation::Insert => {
                records.next_id += 1;
                let row = StoredResult {
                    id: records.next_id,
                    url: record.fetch.url,
                    owner_id: record.owner_id,
                    http_status: record.fetch.http_status,
                    success: record.fetch.success,
                    payload: record.fetch.payload,
                    error: record.fetch.error,
                    search_volume: record.search_volume,
                    created_at: Utc::now(),
                };
                records.rows.push(row.clone());
                Ok(row)
            }
            Reconciliation::UpdateVolume => {
                let row = records
                    .latest_mut(&record.fetch.url, &record.owner_id)
                    .map(|row| {
                        row.search_volume = record.search_volume;
                        row.clone()
                    });
                row.ok_or_else(|| Error::Internal("record vanished".to_string()))
            }
            Reconciliation::Keep => existing
                .ok_or_else(|| Error::Internal("record vanished".to_string())),
        }
    }

    async fn update_volume_only(
        &self,
        url: &str,
        owner_id: &str,
        search_volume: u64,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(row) = records.latest_mut(url, owner_id) {
            row.search_volume = search_volume;
        }
        Ok(())
    }

    async fn list_current(&self, owner_id: &str) -> Result<Vec<StoredResult>> {
        let records = self.records.lock().await;
        let mut current: BTreeMap<&str, &StoredResult> = BTreeMap::new();
        for row in records.rows.iter().filter(|r| r.owner_id == owner_id) {
            let newer = current
                .get(row.url.as_str())
                .is_none_or(|seen| (row.created_at, row.id) > (seen.created_at, seen.id));
            if newer {
                current.insert(row.url.as_str(), row);
            }
        }
        Ok(current.into_values().cloned().collect())
    }
}
