//! One aggregate document per prefix.

use super::Reconcile;
use crate::error::SyncError;
use crate::status::Status;
use crate::store::PrefixStore;
use crate::types::{timestamp_now, ChangeCounts, FileData, PrefixAggregate};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Reconciles files into per-prefix aggregate documents.
pub struct PrefixReconciler {
    store: Arc<dyn PrefixStore>,
    status: Arc<Status>,
}

impl PrefixReconciler {
    pub fn new(store: Arc<dyn PrefixStore>, status: Arc<Status>) -> Self {
        Self { store, status }
    }
}

#[async_trait]
impl Reconcile for PrefixReconciler {
    async fn reconcile(&self, data: FileData) -> Result<ChangeCounts, SyncError> {
        trace!(
            "Process hashes for {} with checksum {}",
            data.prefix,
            data.checksum
        );
        let hash_count = data.hashes.len() as u64;
        let aggregate = PrefixAggregate::from_file_data(data, &timestamp_now());
        self.status.increase_total_hashes(hash_count);

        let counts = self.store.upsert_by_prefix(&aggregate).await?;
        self.status.record(&counts);
        self.status.increase_files_processed();
        Ok(counts)
    }
}

/// Probe, then insert, skip or replace.
///
/// - no stored document: insert, every hash counts as inserted
/// - same checksum: nothing written, every hash counts as validated
/// - different checksum: replace; the size difference is split into
///   inserted or deleted, the overlap counts as updated
///
/// The replace counts only reflect list sizes, not which suffixes changed.
pub async fn reconcile_aggregate<S>(
    store: &S,
    aggregate: &PrefixAggregate,
) -> Result<ChangeCounts, SyncError>
where
    S: PrefixStore + ?Sized,
{
    let new_size = aggregate.hashes.len() as u64;

    match store.find_checksum(aggregate.prefix).await? {
        None => {
            store.insert_aggregate(aggregate).await?;
            Ok(ChangeCounts {
                inserted: new_size,
                ..ChangeCounts::default()
            })
        }
        Some(checksum) if checksum == aggregate.checksum => Ok(ChangeCounts {
            validated: new_size,
            ..ChangeCounts::default()
        }),
        Some(_) => {
            let before_size = store.replace_aggregate(aggregate).await?.unwrap_or(0);
            Ok(ChangeCounts {
                validated: 0,
                inserted: new_size.saturating_sub(before_size),
                updated: new_size.min(before_size),
                deleted: before_size.saturating_sub(new_size),
            })
        }
    }
}
