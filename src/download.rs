//! Range download functionality.

use crate::error::SyncError;
use crate::prefix::Prefix;
use crate::types::{RetryPolicy, SyncConfig};
use futures_util::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, trace, warn};

/// Fetches range files into the cache directory.
///
/// Cloning is cheap and every clone shares the HTTP client and the per-host
/// connection cap, so one `Downloader` can be handed to every worker.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    endpoint: String,
    target_dir: PathBuf,
    retry: RetryPolicy,
    host_permits: Arc<Semaphore>,
}

impl Downloader {
    /// Builds a downloader writing into `config.cache_dir`.
    ///
    /// The directory is not checked here, see
    /// [`validate_cache_dir`](crate::discovery::validate_cache_dir).
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.range_endpoint.trim_end_matches('/').to_string(),
            target_dir: config.cache_dir.clone(),
            retry: config.retry,
            host_permits: Arc::new(Semaphore::new(config.max_connections_per_host.max(1))),
        })
    }

    pub fn url_for(&self, prefix: Prefix) -> String {
        format!("{}/{}", self.endpoint, prefix)
    }

    /// Downloads the range of `prefix` to `<cache_dir>/<PREFIX>.txt`.
    ///
    /// Every failure is retried according to the retry policy. The body is
    /// streamed into a `.part` file that replaces the cache file only once
    /// complete, so an exhausted download leaves any previous cache file as it
    /// was.
    pub async fn download(&self, prefix: Prefix) -> Result<PathBuf, SyncError> {
        let url = self.url_for(prefix);
        let target = cache_path(&self.target_dir, prefix);
        let partial = PartialFile(partial_path(&target));

        let result = {
            let (url, target, partial) = (url.as_str(), target.as_path(), partial.0.as_path());
            Retry::spawn(self.retry.delays(), || async move {
                match self.fetch_once(url, partial, target).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("Failed to download {} due to error: {}", url, e);
                        RetryError::to_transient(e)
                    }
                }
            })
            .await
        };

        match result {
            Ok(()) => {
                trace!("Downloaded {} to {}", url, target.display());
                Ok(target)
            }
            Err(e) => Err(SyncError::DownloadFailed(format!(
                "{} after {} retries: {}",
                url, self.retry.retries, e
            ))),
        }
    }

    async fn fetch_once(&self, url: &str, partial: &Path, target: &Path) -> Result<(), SyncError> {
        let _permit = self
            .host_permits
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_length = response.content_length();

        let mut file = BufWriter::new(tokio::fs::File::create(partial).await?);
        let mut byte_stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(piece) = byte_stream.next().await {
            let chunk = piece?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = content_length {
            if written != expected {
                return Err(SyncError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "Size mismatch for {}: expected {} bytes, got {} bytes",
                        url, expected, written
                    ),
                )));
            }
        }

        tokio::fs::rename(partial, target).await?;
        Ok(())
    }
}

/// Cache file of `prefix` inside `dir`.
pub fn cache_path(dir: &Path, prefix: Prefix) -> PathBuf {
    dir.join(format!("{}.txt", prefix))
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension("txt.part")
}

/// Deletes a partial download when dropped.
///
/// Covers exhausted retries as well as a download future dropped mid-body
/// on cancellation. After a successful rename there is nothing left to delete.
struct PartialFile(PathBuf);

impl Drop for PartialFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed partial download {}", self.0.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Unable to remove {}: {}", self.0.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_urls() {
        let config = SyncConfig {
            cache_dir: "/tmp/ranges".into(),
            range_endpoint: "http://localhost:8080/range/".to_string(),
            ..SyncConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap();
        let prefix: Prefix = "0a1b2".parse().unwrap();

        assert_eq!(downloader.url_for(prefix), "http://localhost:8080/range/0A1B2");
        let target = cache_path(&config.cache_dir, prefix);
        assert_eq!(target, PathBuf::from("/tmp/ranges/0A1B2.txt"));
        assert_eq!(partial_path(&target), PathBuf::from("/tmp/ranges/0A1B2.txt.part"));
    }
}
