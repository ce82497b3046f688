//! One record per hash, tagged with the checksum of its source file.

use super::Reconcile;
use crate::error::SyncError;
use crate::status::Status;
use crate::store::RecordStore;
use crate::types::{timestamp_now, ChangeCounts, FileData};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Reconciles files into per-hash records.
///
/// For each file, records of the prefix that carry the file's checksum are
/// counted while records of any other checksum are deleted. If the count
/// equals the number of parsed hashes the prefix is unchanged and nothing is
/// written. Otherwise all records of the prefix are dropped and the full set
/// is inserted again, which also repairs a generation that was only partly
/// inserted by an interrupted run.
pub struct RecordReconciler {
    store: Arc<dyn RecordStore>,
    status: Arc<Status>,
}

impl RecordReconciler {
    pub fn new(store: Arc<dyn RecordStore>, status: Arc<Status>) -> Self {
        Self { store, status }
    }
}

#[async_trait]
impl Reconcile for RecordReconciler {
    async fn reconcile(&self, data: FileData) -> Result<ChangeCounts, SyncError> {
        let prefix = data.prefix;
        let checksum = data.checksum.as_str();
        let incoming = data.hashes.len() as u64;
        trace!("Process hashes for {} with checksum {}", prefix, checksum);

        let (matching, stale_deleted) = tokio::try_join!(
            self.store.count_by_prefix_and_checksum(prefix, checksum),
            self.store
                .delete_by_prefix_and_not_matching_checksum(prefix, checksum),
        )?;
        trace!(
            "Counted {} records for {} with checksum {}, deleted {} stale",
            matching,
            prefix,
            checksum,
            stale_deleted
        );

        let counts = if matching == incoming {
            ChangeCounts {
                validated: incoming,
                deleted: stale_deleted,
                ..ChangeCounts::default()
            }
        } else {
            // Changed content or a partial previous run: rebuild the prefix.
            let records = data.to_records(&timestamp_now());
            let deleted_existing = self.store.delete_by_prefix(prefix).await?;
            self.store.insert_bulk(&records).await?;
            replace_counts(incoming, stale_deleted, deleted_existing)
        };

        self.status.increase_total_hashes(incoming);
        self.status.record(&counts);
        self.status.increase_files_processed();
        Ok(counts)
    }
}

/// Change attribution for a rebuilt prefix.
///
/// An approximation derived from sizes alone; it can over- or under-count
/// when suffixes are swapped rather than added or removed.
fn replace_counts(incoming: u64, stale_deleted: u64, deleted_existing: u64) -> ChangeCounts {
    let inserted = incoming.abs_diff(deleted_existing);
    let updated = incoming.abs_diff(inserted);
    let delta_deleted = deleted_existing.abs_diff(updated);
    ChangeCounts {
        validated: 0,
        inserted,
        updated,
        deleted: stale_deleted + delta_deleted,
    }
}
