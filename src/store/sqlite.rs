//! SQLite store for both modes.

use super::{PrefixStore, RecordStore};
use crate::error::SyncError;
use crate::prefix::Prefix;
use crate::types::{HashOccurrence, HashRecord, PrefixAggregate};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// SQLite has a single writer and nearly every reconcile step writes.
const MAX_CONNECTIONS: u32 = 1;
// 5 bound parameters per row, well below SQLite's variable limit.
const INSERT_CHUNK: usize = 1000;

/// Prefix documents and hash records in one SQLite database.
///
/// Aggregates live in the `prefixes` table with their hash list as JSON.
/// Records live in the `hashes` table keyed by `(prefix, suffix)`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    async fn new(options: SqliteConnectOptions) -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Opens (or creates) the database file at `path` and applies migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        info!("Opening SQLite store at {}", path.display());
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options).await
    }

    /// Opens a private in-memory database.
    pub async fn connect_in_memory() -> Result<Self, SyncError> {
        Self::new(Self::base_options().filename(":memory:")).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Loads the full aggregate for `prefix`.
    pub async fn load_aggregate(&self, prefix: Prefix) -> Result<Option<PrefixAggregate>, SyncError> {
        let row = sqlx::query(
            "SELECT hashes, total_occurrences, min_suffix, min_occurrence, max_suffix, \
             max_occurrence, checksum, last_updated FROM prefixes WHERE prefix = ?",
        )
        .bind(prefix.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let hashes: Vec<HashOccurrence> = serde_json::from_str(row.try_get("hashes")?)?;
        Ok(Some(PrefixAggregate {
            prefix,
            hashes,
            total_occurrences: row.try_get::<i64, _>("total_occurrences")? as u64,
            min_hash: extreme(row.try_get("min_suffix")?, row.try_get("min_occurrence")?),
            max_hash: extreme(row.try_get("max_suffix")?, row.try_get("max_occurrence")?),
            checksum: row.try_get("checksum")?,
            last_updated: row.try_get("last_updated")?,
        }))
    }

    /// Loads every record of `prefix`, ordered by suffix.
    pub async fn load_records(&self, prefix: Prefix) -> Result<Vec<HashRecord>, SyncError> {
        let rows = sqlx::query(
            "SELECT suffix, occurrence, file_checksum, last_update FROM hashes \
             WHERE prefix = ? ORDER BY suffix",
        )
        .bind(prefix.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<HashRecord, SyncError> {
                Ok(HashRecord {
                    prefix,
                    suffix: row.try_get("suffix")?,
                    occurrence: row.try_get::<i64, _>("occurrence")? as u64,
                    file_checksum: row.try_get("file_checksum")?,
                    last_update: row.try_get("last_update")?,
                })
            })
            .collect()
    }

    /// Closes the pool after letting SQLite refresh planner statistics.
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA optimize").execute(&self.pool).await {
            debug!("PRAGMA optimize failed on close: {}", e);
        }
        self.pool.close().await;
    }
}

fn extreme(suffix: Option<String>, occurrence: Option<i64>) -> Option<HashOccurrence> {
    Some(HashOccurrence::new(suffix?, occurrence? as u64))
}

const UPSERT_AGGREGATE: &str = "INSERT OR REPLACE INTO prefixes \
    (prefix, hashes, hash_count, total_occurrences, min_suffix, min_occurrence, \
     max_suffix, max_occurrence, checksum, last_updated) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_AGGREGATE: &str = "INSERT INTO prefixes \
    (prefix, hashes, hash_count, total_occurrences, min_suffix, min_occurrence, \
     max_suffix, max_occurrence, checksum, last_updated) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn bind_aggregate<'q>(
    sql: &'q str,
    aggregate: &'q PrefixAggregate,
    hashes_json: String,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(aggregate.prefix.to_string())
        .bind(hashes_json)
        .bind(aggregate.hashes.len() as i64)
        .bind(aggregate.total_occurrences as i64)
        .bind(aggregate.min_hash.as_ref().map(|h| h.suffix.as_str()))
        .bind(aggregate.min_hash.as_ref().map(|h| h.occurrence as i64))
        .bind(aggregate.max_hash.as_ref().map(|h| h.suffix.as_str()))
        .bind(aggregate.max_hash.as_ref().map(|h| h.occurrence as i64))
        .bind(aggregate.checksum.as_str())
        .bind(aggregate.last_updated.as_str())
}

#[async_trait]
impl PrefixStore for SqliteStore {
    async fn find_checksum(&self, prefix: Prefix) -> Result<Option<String>, SyncError> {
        Ok(
            sqlx::query_scalar("SELECT checksum FROM prefixes WHERE prefix = ?")
                .bind(prefix.to_string())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_aggregate(&self, aggregate: &PrefixAggregate) -> Result<(), SyncError> {
        let hashes_json = serde_json::to_string(&aggregate.hashes)?;
        bind_aggregate(INSERT_AGGREGATE, aggregate, hashes_json)
            .execute(&self.pool)
            .await?;
        trace!("Inserted aggregate for {}", aggregate.prefix);
        Ok(())
    }

    async fn replace_aggregate(
        &self,
        aggregate: &PrefixAggregate,
    ) -> Result<Option<u64>, SyncError> {
        let hashes_json = serde_json::to_string(&aggregate.hashes)?;
        let mut tx = self.pool.begin().await?;
        let before: Option<i64> =
            sqlx::query_scalar("SELECT hash_count FROM prefixes WHERE prefix = ?")
                .bind(aggregate.prefix.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        bind_aggregate(UPSERT_AGGREGATE, aggregate, hashes_json)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        trace!("Replaced aggregate for {}", aggregate.prefix);
        Ok(before.map(|n| n as u64))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn count_by_prefix_and_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM hashes WHERE prefix = ? AND file_checksum = ?")
                .bind(prefix.to_string())
                .bind(checksum)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn delete_by_prefix_and_not_matching_checksum(
        &self,
        prefix: Prefix,
        checksum: &str,
    ) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM hashes WHERE prefix = ? AND file_checksum <> ?")
            .bind(prefix.to_string())
            .bind(checksum)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_prefix(&self, prefix: Prefix) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM hashes WHERE prefix = ?")
            .bind(prefix.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_bulk(&self, records: &[HashRecord]) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR REPLACE INTO hashes (prefix, suffix, occurrence, file_checksum, last_update) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.prefix.to_string())
                    .push_bind(record.suffix.as_str())
                    .push_bind(record.occurrence as i64)
                    .push_bind(record.file_checksum.as_str())
                    .push_bind(record.last_update.as_str());
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        trace!("Inserted {} records", inserted);
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeCounts, FileData};

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn file_data(p: &str, hashes: &[(&str, u64)], checksum: &str) -> FileData {
        FileData {
            prefix: prefix(p),
            hashes: hashes
                .iter()
                .map(|(s, o)| HashOccurrence::new(*s, *o))
                .collect(),
            checksum: checksum.to_string(),
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        MIGRATOR.run(store.pool()).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_close_after_pool_is_closed() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        store.pool().close().await;
        // The optimize query fails on a closed pool; closing must still complete.
        store.close().await;
        assert!(store.pool().is_closed());
    }

    #[tokio::test]
    async fn test_aggregate_round_trip() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let aggregate = PrefixAggregate::from_file_data(
            file_data("00000", &[("AAAA", 3), ("BBBB", 1)], "C1"),
            "2024-06-01T00:00:00Z",
        );
        store.insert_aggregate(&aggregate).await.unwrap();

        assert_eq!(
            store.find_checksum(prefix("00000")).await.unwrap().as_deref(),
            Some("C1")
        );
        assert_eq!(
            store.load_aggregate(prefix("00000")).await.unwrap(),
            Some(aggregate)
        );
        assert!(store.find_checksum(prefix("00001")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_by_prefix_state_machine() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let first = PrefixAggregate::from_file_data(
            file_data("ABCDE", &[("AAAA", 3), ("BBBB", 1), ("CCCC", 2)], "C1"),
            "t1",
        );
        let changed = PrefixAggregate::from_file_data(file_data("ABCDE", &[("AAAA", 4)], "C2"), "t2");

        assert_eq!(store.upsert_by_prefix(&first).await.unwrap().inserted, 3);
        assert_eq!(store.upsert_by_prefix(&first).await.unwrap().validated, 3);
        assert_eq!(
            store.upsert_by_prefix(&changed).await.unwrap(),
            ChangeCounts {
                validated: 0,
                inserted: 0,
                updated: 1,
                deleted: 2
            }
        );
        let stored = store.load_aggregate(prefix("ABCDE")).await.unwrap().unwrap();
        assert_eq!(stored.checksum, "C2");
        assert_eq!(stored.hashes.len(), 1);
    }

    #[tokio::test]
    async fn test_record_operations() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let old = file_data("00A00", &[("AAAA", 1), ("BBBB", 2), ("CCCC", 3)], "OLD");
        let other = file_data("00A01", &[("AAAA", 1)], "OTHER");
        store.insert_bulk(&old.to_records("t")).await.unwrap();
        store.insert_bulk(&other.to_records("t")).await.unwrap();

        assert_eq!(
            store
                .count_by_prefix_and_checksum(prefix("00A00"), "OLD")
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            store
                .delete_by_prefix_and_not_matching_checksum(prefix("00A00"), "OLD")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .delete_by_prefix_and_not_matching_checksum(prefix("00A00"), "NEW")
                .await
                .unwrap(),
            3
        );
        assert!(store.load_records(prefix("00A00")).await.unwrap().is_empty());
        assert_eq!(store.load_records(prefix("00A01")).await.unwrap().len(), 1);
        assert_eq!(store.delete_by_prefix(prefix("00A01")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_bulk_spans_chunks() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let hashes: Vec<HashOccurrence> = (0..2500u64)
            .map(|i| HashOccurrence::new(format!("{:035X}", i), i))
            .collect();
        let data = FileData {
            prefix: prefix("FFFFF"),
            hashes,
            checksum: "BIG".to_string(),
        };

        assert_eq!(store.insert_bulk(&data.to_records("t")).await.unwrap(), 2500);
        assert_eq!(
            store
                .count_by_prefix_and_checksum(prefix("FFFFF"), "BIG")
                .await
                .unwrap(),
            2500
        );
    }
}
