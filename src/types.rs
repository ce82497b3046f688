//! Data structures flowing through the sync pipeline.

use crate::prefix::Prefix;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Default upstream range endpoint. Requests go to `<endpoint>/<PREFIX>`.
pub const DEFAULT_RANGE_ENDPOINT: &str = "https://api.pwnedpasswords.com/range";

/// Workers per available core. The pipeline is I/O-bound, so oversubscription is intended.
const WORKERS_PER_CORE: usize = 20;

/// One `SUFFIX:OCCURRENCE` line of a range file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HashOccurrence {
    /// Remainder of the hash after the prefix, uppercase hex.
    pub suffix: String,
    /// How many times the full hash has been seen upstream.
    pub occurrence: u64,
}

impl HashOccurrence {
    pub fn new(suffix: impl Into<String>, occurrence: u64) -> Self {
        Self {
            suffix: suffix.into(),
            occurrence,
        }
    }
}

/// A parsed range file, handed from ingestion to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub prefix: Prefix,
    /// Parsed lines in file order.
    pub hashes: Vec<HashOccurrence>,
    /// Uppercase hex SHA-1 over the prefix and every parsed line.
    pub checksum: String,
}

impl FileData {
    /// Builds one record per hash, all tagged with this file's checksum.
    pub fn to_records(&self, last_update: &str) -> Vec<HashRecord> {
        self.hashes
            .iter()
            .map(|hash| HashRecord {
                prefix: self.prefix,
                suffix: hash.suffix.clone(),
                occurrence: hash.occurrence,
                file_checksum: self.checksum.clone(),
                last_update: last_update.to_string(),
            })
            .collect()
    }
}

/// The prefix-mode document: one per prefix, always replaced wholesale.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrefixAggregate {
    pub prefix: Prefix,
    pub hashes: Vec<HashOccurrence>,
    pub total_occurrences: u64,
    /// Entry with the lowest occurrence; first one wins on ties.
    pub min_hash: Option<HashOccurrence>,
    /// Entry with the highest occurrence; first one wins on ties.
    pub max_hash: Option<HashOccurrence>,
    pub checksum: String,
    /// RFC 3339 timestamp of the sync that produced this document.
    pub last_updated: String,
}

impl PrefixAggregate {
    /// Aggregates a parsed file.
    ///
    /// # Example
    ///
    /// ```
    /// use pwnsync::{FileData, HashOccurrence, PrefixAggregate};
    ///
    /// let data = FileData {
    ///     prefix: "00000".parse().unwrap(),
    ///     hashes: vec![HashOccurrence::new("AAAA", 3), HashOccurrence::new("BBBB", 1)],
    ///     checksum: "C0FFEE".to_string(),
    /// };
    /// let aggregate = PrefixAggregate::from_file_data(data, "2024-01-01T00:00:00Z");
    /// assert_eq!(aggregate.total_occurrences, 4);
    /// assert_eq!(aggregate.min_hash, Some(HashOccurrence::new("BBBB", 1)));
    /// assert_eq!(aggregate.max_hash, Some(HashOccurrence::new("AAAA", 3)));
    /// ```
    pub fn from_file_data(data: FileData, last_updated: &str) -> Self {
        let total_occurrences = data.hashes.iter().map(|h| h.occurrence).sum();
        let min_hash = data
            .hashes
            .iter()
            .reduce(|best, h| if h.occurrence < best.occurrence { h } else { best })
            .cloned();
        let max_hash = data
            .hashes
            .iter()
            .reduce(|best, h| if h.occurrence > best.occurrence { h } else { best })
            .cloned();

        Self {
            prefix: data.prefix,
            hashes: data.hashes,
            total_occurrences,
            min_hash,
            max_hash,
            checksum: data.checksum,
            last_updated: last_updated.to_string(),
        }
    }
}

/// The record-mode row: one per `(prefix, suffix)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub prefix: Prefix,
    pub suffix: String,
    pub occurrence: u64,
    /// Checksum of the file generation this record was inserted from.
    pub file_checksum: String,
    /// RFC 3339 timestamp of the insert.
    pub last_update: String,
}

/// Hash-level outcome of reconciling one file.
///
/// Only `validated` is exact. The other three are derived from list sizes
/// and are best-effort telemetry when a prefix changes content.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub validated: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Retry policy for range downloads.
///
/// One initial attempt, then up to `retries` more, waiting `step * n` before
/// the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub step: Duration,
}

impl RetryPolicy {
    /// Delays before each retry, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let step = self.step;
        (1..=self.retries as u32).map(move |n| step * n)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            step: Duration::from_millis(500),
        }
    }
}

/// Configuration for a sync run.
///
/// # Example
///
/// ```
/// use pwnsync::SyncConfig;
///
/// let config = SyncConfig {
///     cache_dir: "/var/cache/pwned".into(),
///     download: true,
///     ..SyncConfig::default()
/// };
/// assert!(config.workers > 0);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding one `<PREFIX>.txt` per range. Must exist and be writable.
    pub cache_dir: PathBuf,
    /// Base URL of the range API, without trailing slash.
    pub range_endpoint: String,
    /// Workers per pipeline stage.
    ///
    /// Note: This is deliberately far above the core count. Every stage spends
    /// its time waiting on the network, the disk or the store.
    pub workers: usize,
    /// Capacity of every bounded channel between stages.
    pub channel_capacity: usize,
    /// Maximum concurrent requests against the range endpoint.
    pub max_connections_per_host: usize,
    /// Retry policy for failed range downloads.
    pub retry: RetryPolicy,
    /// Timeout for a single range request.
    pub request_timeout: Duration,
    /// Interval between status lines.
    pub status_interval: Duration,
    /// Download every range before importing instead of reading the cache only.
    pub download: bool,
    /// First prefix of the download supply (default: `00000`).
    pub resume_from: Option<Prefix>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            cache_dir: PathBuf::from("."),
            range_endpoint: DEFAULT_RANGE_ENDPOINT.to_string(),
            workers,
            channel_capacity: workers,
            max_connections_per_host: 64,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            status_interval: Duration::from_secs(1),
            download: false,
            resume_from: None,
        }
    }
}

/// Available cores times the per-core oversubscription factor.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        * WORKERS_PER_CORE
}

/// Current time as an RFC 3339 timestamp (second precision, UTC).
pub(crate) fn timestamp_now() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}
