//! pwnsync - Keep a store in sync with the Pwned Passwords range files
//!
//! This library downloads the 1'048'576 range files of the Pwned Passwords
//! dataset into a local cache and reconciles them into a persistent store,
//! touching only the prefixes whose content changed since the last run.
//!
//! # Features
//!
//! - **Bounded Pipelines**: Worker pools connected by bounded channels, so a slow store stalls the downloads instead of filling memory
//! - **Automatic Retry**: Linear backoff for failed range downloads
//! - **Change Detection**: A SHA-1 checksum per range file decides whether a prefix needs rewriting
//! - **Two Storage Layouts**: One aggregate document per prefix, or one record per hash
//! - **Resumable**: Re-running after a crash or an interrupt converges to the same stored content
//!
//! # Example
//!
//! ```no_run
//! use pwnsync::store::MemoryStore;
//! use pwnsync::{CancellationRegistry, Orchestrator, PrefixReconciler, Status, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig {
//!     cache_dir: "ranges".into(),
//!     download: true,
//!     ..SyncConfig::default()
//! };
//! let status = Arc::new(Status::new());
//! let reconciler = PrefixReconciler::new(Arc::new(MemoryStore::new()), status.clone());
//!
//! let orchestrator = Orchestrator::new(config, status, Arc::new(CancellationRegistry::new()));
//! let summary = orchestrator.import(Arc::new(reconciler)).await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod discovery;
pub mod download;
pub mod error;
pub mod ingest;
pub mod orchestrator;
pub mod prefix;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod types;

pub use cancel::CancellationRegistry;
pub use download::Downloader;
pub use error::SyncError;
pub use orchestrator::{Orchestrator, RunSummary};
pub use prefix::{Prefix, PrefixSpace};
pub use reconcile::{PrefixReconciler, Reconcile, RecordReconciler};
pub use status::{CurrentState, Status};
pub use types::{
    ChangeCounts, FileData, HashOccurrence, HashRecord, PrefixAggregate, RetryPolicy, SyncConfig,
};
