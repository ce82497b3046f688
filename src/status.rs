//! Process-wide progress counters and the periodic status line.

use crate::types::ChangeCounts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Thousands separator used by the status line (Swiss German grouping).
const GROUP_SEPARATOR: char = '\u{2019}';

/// Shared counters, updated by every worker of every stage.
///
/// Created once per run and handed to each component behind an `Arc`.
/// Counters only grow until [`Status::reset`]. Reads are not synchronised
/// with individual increments; a snapshot is only eventually up to date.
#[derive(Debug, Default)]
pub struct Status {
    files_queued: AtomicU64,
    files_read: AtomicU64,
    files_processed: AtomicU64,
    files_failed: AtomicU64,
    total_hashes: AtomicU64,
    validated_hashes: AtomicU64,
    inserted_hashes: AtomicU64,
    updated_hashes: AtomicU64,
    deleted_hashes: AtomicU64,
}

/// Point-in-time copy of [`Status`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentState {
    pub files_queued: u64,
    pub files_read: u64,
    pub files_processed: u64,
    /// Units of work dropped after an error (failed downloads, unreadable files, store errors).
    pub files_failed: u64,
    pub total_hashes: u64,
    pub validated_hashes: u64,
    pub inserted_hashes: u64,
    pub updated_hashes: u64,
    pub deleted_hashes: u64,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase_files_queued(&self) {
        self.files_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increase_files_read(&self) {
        self.files_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increase_files_processed(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increase_files_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increase_total_hashes(&self, by: u64) {
        self.total_hashes.fetch_add(by, Ordering::Relaxed);
    }

    pub fn increase_validated_hashes(&self, by: u64) {
        self.validated_hashes.fetch_add(by, Ordering::Relaxed);
    }

    pub fn increase_inserted_hashes(&self, by: u64) {
        self.inserted_hashes.fetch_add(by, Ordering::Relaxed);
    }

    pub fn increase_updated_hashes(&self, by: u64) {
        self.updated_hashes.fetch_add(by, Ordering::Relaxed);
    }

    pub fn increase_deleted_hashes(&self, by: u64) {
        self.deleted_hashes.fetch_add(by, Ordering::Relaxed);
    }

    /// Adds a reconciliation outcome to the hash counters.
    pub fn record(&self, counts: &ChangeCounts) {
        self.increase_validated_hashes(counts.validated);
        self.increase_inserted_hashes(counts.inserted);
        self.increase_updated_hashes(counts.updated);
        self.increase_deleted_hashes(counts.deleted);
    }

    /// Sets every counter back to zero.
    pub fn reset(&self) {
        for counter in [
            &self.files_queued,
            &self.files_read,
            &self.files_processed,
            &self.files_failed,
            &self.total_hashes,
            &self.validated_hashes,
            &self.inserted_hashes,
            &self.updated_hashes,
            &self.deleted_hashes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CurrentState {
        CurrentState {
            files_queued: self.files_queued.load(Ordering::Relaxed),
            files_read: self.files_read.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            total_hashes: self.total_hashes.load(Ordering::Relaxed),
            validated_hashes: self.validated_hashes.load(Ordering::Relaxed),
            inserted_hashes: self.inserted_hashes.load(Ordering::Relaxed),
            updated_hashes: self.updated_hashes.load(Ordering::Relaxed),
            deleted_hashes: self.deleted_hashes.load(Ordering::Relaxed),
        }
    }

    /// Renders the current snapshot as a status line.
    pub fn status_line(&self) -> String {
        self.snapshot().to_string()
    }

    /// Logs a status line every `interval` until `job` finishes, then once more.
    pub async fn report_while_running<T>(&self, job: &JoinHandle<T>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !job.is_finished() {
            ticker.tick().await;
            info!("{}", self.status_line());
        }
        info!("{}", self.status_line());
    }

    /// Drives a progress bar from the queued-files counter until `job` finishes.
    pub async fn report_progress_while_running<T>(
        &self,
        job: &JoinHandle<T>,
        interval: Duration,
        pb: &indicatif::ProgressBar,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !job.is_finished() {
            ticker.tick().await;
            let state = self.snapshot();
            pb.set_position(state.files_queued);
            if state.files_failed > 0 {
                pb.set_message(format!("| ❌ {} failed", format_count(state.files_failed)));
            }
        }
        let state = self.snapshot();
        pb.set_position(state.files_queued);
        pb.finish_with_message(format!(
            "✅ Downloaded {} ranges, {} failed",
            format_count(state.files_queued),
            format_count(state.files_failed)
        ));
    }
}

impl fmt::Display for CurrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queued Files: {} - Read files: {} - Processed files: {} - Hashes Parsed: {} \
             - Validated: {} - Inserted: {} - Updated: {} - Deleted: {} - Failed: {}",
            format_count(self.files_queued),
            format_count(self.files_read),
            format_count(self.files_processed),
            format_count(self.total_hashes),
            format_count(self.validated_hashes),
            format_count(self.inserted_hashes),
            format_count(self.updated_hashes),
            format_count(self.deleted_hashes),
            format_count(self.files_failed),
        )
    }
}

/// Formats `n` with digits grouped in thousands (`1’048’576`).
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 * 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(GROUP_SEPARATOR);
        }
        out.push(c);
    }
    out
}
