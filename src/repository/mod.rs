//! Persistence of fetch attempts.
//!
//! Records are kept per (url, owner); the one with the newest `created_at`
//! is current. Writes go through [`reconcile`] so a failed attempt never
//! replaces a good payload, while a fresh payload always supersedes
//! whatever came before without erasing it.

use crate::error::Result;
use crate::model::{NewResult, StoredResult};
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Lookups larger than this are split into several queries.
pub const LOOKUP_CHUNK_SIZE: usize = 100;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn find_latest(&self, url: &str, owner_id: &str) -> Result<Option<StoredResult>>;

    /// Current record for each of `urls` that has one, in no particular order.
    async fn find_latest_batch(&self, urls: &[String], owner_id: &str)
    -> Result<Vec<StoredResult>>;

    /// Persists `record` according to [`reconcile`] and returns the record
    /// that is current afterwards.
    async fn upsert(&self, record: NewResult) -> Result<StoredResult>;

    async fn update_volume_only(&self, url: &str, owner_id: &str, search_volume: u64)
    -> Result<()>;

    /// Every current record of `owner_id`, ordered by url.
    async fn list_current(&self, owner_id: &str) -> Result<Vec<StoredResult>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Insert,
    UpdateVolume,
    Keep,
}

pub fn reconcile(existing: Option<&StoredResult>, incoming: &NewResult) -> Reconciliation {
    match existing {
        None => Reconciliation::Insert,
        Some(previous) if !previous.success || incoming.fetch.has_payload() => {
            Reconciliation::Insert
        }
        Some(previous) if previous.search_volume != incoming.search_volume => {
            Reconciliation::UpdateVolume
        }
        Some(_) => Reconciliation::Keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FetchResult, Payload};
    use chrono::Utc;

    fn stored(success: bool, volume: u64) -> StoredResult {
        StoredResult {
            id: 1,
            url: "https://a/".to_string(),
            owner_id: "o".to_string(),
            http_status: if success { 200 } else { 0 },
            success,
            payload: success.then(|| Payload::new("{}")),
            error: (!success).then(|| "boom".to_string()),
            search_volume: volume,
            created_at: Utc::now(),
        }
    }

    fn incoming(fetch: FetchResult, volume: u64) -> NewResult {
        NewResult {
            fetch,
            owner_id: "o".to_string(),
            search_volume: volume,
        }
    }

    #[test]
    fn test_reconcile_rules() {
        let ok = FetchResult::success("https://a/", 200, Payload::new("{}"));
        let failed = FetchResult::failure("https://a/", 500, "down");

        assert_eq!(reconcile(None, &incoming(failed.clone(), 1)), Reconciliation::Insert);
        assert_eq!(
            reconcile(Some(&stored(false, 1)), &incoming(ok.clone(), 1)),
            Reconciliation::Insert
        );
        assert_eq!(
            reconcile(Some(&stored(false, 1)), &incoming(failed.clone(), 1)),
            Reconciliation::Insert
        );
        assert_eq!(
            reconcile(Some(&stored(true, 1)), &incoming(ok, 1)),
            Reconciliation::Insert
        );
        assert_eq!(
            reconcile(Some(&stored(true, 1)), &incoming(failed.clone(), 9)),
            Reconciliation::UpdateVolume
        );
        assert_eq!(
            reconcile(Some(&stored(true, 1)), &incoming(failed, 1)),
            Reconciliation::Keep
        );
    }
}
