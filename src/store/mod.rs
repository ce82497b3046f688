//! Storage adapters consumed by the reconcilers.
//!
//! Two granularities exist. Prefix mode keeps one [`PrefixAggregate`] per
//! prefix and replaces it wholesale. Record mode keeps one [`HashRecord`] per
//! hash, each tagged with the checksum of the file it came from so that a
//! whole file generation can be counted or removed in one operation.
//!
//! Adapters are shared by every reconcile worker and must be safe for
//! concurrent use at full pool width.

mod memory;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use crate::error::SyncError;
use crate::prefix::Prefix;
use crate::reconcile::prefix::reconcile_aggregate;
use crate::types::{ChangeCounts, HashRecord, PrefixAggregate};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Persistence for prefix mode.
#[async_trait]
pub trait PrefixStore: Send + Sync {
    /// Checksum of the stored document for `prefix`, without loading its hashes.
    async fn find_checksum(&self, prefix: Prefix) -> Result<Option<String>, SyncError>;

    /// Stores a document for a prefix that has none yet.
    async fn insert_aggregate(&self, aggregate: &PrefixAggregate) -> Result<(), SyncError>;

    /// Atomically replaces the document for `aggregate.prefix`.
    ///
    /// Returns the number of hashes the replaced document held, or `None`
    /// when there was nothing to replace (the document is inserted instead).
    async fn replace_aggregate(&self, aggregate: &PrefixAggregate)
        -> Result<Option<u64>, SyncError>;

    /// Makes the stored document match `aggregate` and reports what changed.
    ///
    /// The provided implementation probes the checksum and then inserts,
    /// skips or replaces. Adapters with a native conditional upsert may
    /// override it as long as the reported counts stay the same.
    async fn upsert_by_prefix(&self, aggregate: &PrefixAggregate) -> Result<ChangeCounts, SyncError> {
        reconcile_aggregate(self, aggregate).await
    }
}

/// Persistence for record mode.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Number of records stored for `prefix` that carry `checksum`.
    async fn count_by_prefix_and_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError>;

    /// Deletes records of `prefix` whose checksum differs from `checksum`.
    async fn delete_by_prefix_and_not_matching_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError>;

    /// Deletes every record of `prefix`.
    async fn delete_by_prefix(&self, prefix: Prefix) -> Result<u64, SyncError>;

    /// Inserts records. Returns how many were written.
    async fn insert_bulk(&self, records: &[HashRecord]) -> Result<u64, SyncError>;
}

/// Which adapter to persist into. Resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Process memory. Nothing survives the run; useful for dry runs.
    Memory,
    /// SQLite database file, created if missing.
    Sqlite { path: PathBuf },
}

impl Backend {
    pub async fn open_prefix_store(&self) -> Result<Arc<dyn PrefixStore>, SyncError> {
        Ok(match self {
            Backend::Memory => {
                info!("Using in-memory prefix store, nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
            Backend::Sqlite { path } => Arc::new(SqliteStore::connect(path).await?),
        })
    }

    pub async fn open_record_store(&self) -> Result<Arc<dyn RecordStore>, SyncError> {
        Ok(match self {
            Backend::Memory => {
                info!("Using in-memory record store, nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
            Backend::Sqlite { path } => Arc::new(SqliteStore::connect(path).await?),
        })
    }
}
