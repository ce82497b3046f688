//! Reconciliation of parsed range files against a store.
//!
//! Both strategies decide from a checksum and counts alone whether a prefix is
//! unchanged, and otherwise re-derive the full target state from the file.
//! Re-running either one after a crash or an interrupt converges to the same
//! stored content.

pub mod prefix;
pub mod record;

pub use self::prefix::PrefixReconciler;
pub use self::record::RecordReconciler;

use crate::error::SyncError;
use crate::types::{ChangeCounts, FileData};
use async_trait::async_trait;

/// Final pipeline stage: persists one parsed file.
///
/// Implementations record their outcome on the shared status counters and
/// also return it.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, data: FileData) -> Result<ChangeCounts, SyncError>;
}
