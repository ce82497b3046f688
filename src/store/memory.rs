//! In-memory store for tests and dry runs.

use super::{PrefixStore, RecordStore};
use crate::error::SyncError;
use crate::prefix::Prefix;
use crate::types::{HashRecord, PrefixAggregate};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Both store modes backed by hash maps.
///
/// Every operation takes the relevant lock once, so each trait method is
/// atomic with respect to the others.
///
/// # Examples
///
/// ```
/// use pwnsync::store::{MemoryStore, RecordStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// let prefix = "00000".parse()?;
/// assert_eq!(store.count_by_prefix_and_checksum(prefix, "ABC").await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    aggregates: RwLock<HashMap<Prefix, PrefixAggregate>>,
    records: RwLock<HashMap<Prefix, Vec<HashRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored aggregate for `prefix`.
    pub async fn aggregate(&self, prefix: Prefix) -> Option<PrefixAggregate> {
        self.aggregates.read().await.get(&prefix).cloned()
    }

    /// Number of stored aggregates.
    pub async fn aggregate_count(&self) -> usize {
        self.aggregates.read().await.len()
    }

    /// Stored records for `prefix`, in insertion order.
    pub async fn records(&self, prefix: Prefix) -> Vec<HashRecord> {
        self.records
            .read()
            .await
            .get(&prefix)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of stored records across all prefixes.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PrefixStore for MemoryStore {
    async fn find_checksum(&self, prefix: Prefix) -> Result<Option<String>, SyncError> {
        Ok(self
            .aggregates
            .read()
            .await
            .get(&prefix)
            .map(|a| a.checksum.clone()))
    }

    async fn insert_aggregate(&self, aggregate: &PrefixAggregate) -> Result<(), SyncError> {
        self.aggregates
            .write()
            .await
            .insert(aggregate.prefix, aggregate.clone());
        Ok(())
    }

    async fn replace_aggregate(
        &self,
        aggregate: &PrefixAggregate,
    ) -> Result<Option<u64>, SyncError> {
        let before = self
            .aggregates
            .write()
            .await
            .insert(aggregate.prefix, aggregate.clone());
        Ok(before.map(|b| b.hashes.len() as u64))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn count_by_prefix_and_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError> {
        Ok(self.records.read().await.get(&prefix).map_or(0, |records| {
            records
                .iter()
                .filter(|r| r.file_checksum == checksum)
                .count() as u64
        }))
    }

    async fn delete_by_prefix_and_not_matching_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError> {
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(&prefix) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|r| r.file_checksum == checksum);
        let deleted = (before - stored.len()) as u64;
        if stored.is_empty() {
            records.remove(&prefix);
        }
        Ok(deleted)
    }

    async fn delete_by_prefix(&self, prefix: Prefix) -> Result<u64, SyncError> {
        Ok(self
            .records
            .write()
            .await
            .remove(&prefix)
            .map_or(0, |r| r.len() as u64))
    }

    async fn insert_bulk(&self, records: &[HashRecord]) -> Result<u64, SyncError> {
        let mut stored = self.records.write().await;
        for record in records {
            stored.entry(record.prefix).or_default().push(record.clone());
        }
        Ok(records.len() as u64)
    }
}
