use crate::bucket::MetricsBucket;
use crate::error::Result as MetricsResult;
use crate::partition::{PartitionInfo, PartitionManager};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;

/// Long-retention destination of the rollup.
///
/// Inserts must be idempotent on `(bucket_start, bucket_end)`: the rollup
/// is at-least-once and may hand over the same bucket twice.
pub trait ColdStore: Send + Sync {
    /// Store buckets, ignoring ones already present. Returns how many rows
    /// were new.
    fn insert_buckets(&self, buckets: &[MetricsBucket]) -> Result<usize>;

    /// Drop data older than `retention_days`. Returns how many partitions
    /// were removed.
    fn cleanup(&self, retention_days: u32) -> Result<u32>;
}

/// [`ColdStore`] on daily-partitioned SQLite files.
pub struct SqliteColdStore {
    partitions: PartitionManager,
}

impl SqliteColdStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            partitions: PartitionManager::new(data_dir)?,
        })
    }

    /// Buckets whose start lies in `[from, to)`, oldest first.
    pub fn query_buckets(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<MetricsBucket>> {
        let mut out = Vec::new();
        self.partitions.for_each_in_range(from, to, |conn| {
            let mut stmt = conn.prepare(
                "SELECT bucket_start, bucket_end, total_events, total_errors, latency_sum,
                        latency_count, latency_min, latency_max, p50, p95, p99, unique_users,
                        by_source, by_event_type, by_severity
                 FROM metrics_buckets
                 WHERE bucket_start >= ?1 AND bucket_start < ?2
                 ORDER BY bucket_start",
            )?;
            let rows = stmt.query_map(params![from.timestamp(), to.timestamp()], read_row)?;
            for row in rows {
                out.push(row??);
            }
            Ok(())
        })?;
        Ok(out)
    }

    pub fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        Ok(self.partitions.list_partition_info()?)
    }

    /// Whether a bucket with exactly these bounds has been stored.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool> {
        let found = self.partitions.with_partition_for(start, |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM metrics_buckets WHERE bucket_start = ?1 AND bucket_end = ?2",
                    params![start.timestamp(), end.timestamp()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })?;
        Ok(found)
    }
}

impl ColdStore for SqliteColdStore {
    fn insert_buckets(&self, buckets: &[MetricsBucket]) -> Result<usize> {
        let now = Utc::now().timestamp();

        // One transaction per daily partition touched by the batch.
        let mut by_partition: BTreeMap<String, Vec<(&MetricsBucket, [String; 3])>> = BTreeMap::new();
        for bucket in buckets {
            let maps = [
                serde_json::to_string(&bucket.by_source)?,
                serde_json::to_string(&bucket.by_event_type)?,
                serde_json::to_string(&bucket.by_severity)?,
            ];
            by_partition
                .entry(PartitionManager::partition_key(bucket.start))
                .or_default()
                .push((bucket, maps));
        }

        let mut inserted = 0usize;
        for rows in by_partition.values() {
            let Some((first, _)) = rows.first() else {
                continue;
            };
            inserted += self.partitions.with_partition_for(first.start, |conn| {
                let tx = conn.transaction()?;
                let mut n = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO metrics_buckets (
                            bucket_start, bucket_end, total_events, total_errors, latency_sum,
                            latency_count, latency_min, latency_max, p50, p95, p99, unique_users,
                            by_source, by_event_type, by_severity, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    )?;
                    for (bucket, [by_source, by_event_type, by_severity]) in rows {
                        n += stmt.execute(params![
                            bucket.start.timestamp(),
                            bucket.end.timestamp(),
                            bucket.total_events as i64,
                            bucket.total_errors as i64,
                            bucket.latency_sum as i64,
                            bucket.latency_count as i64,
                            bucket.latency_min.map(|v| v as i64),
                            bucket.latency_max.map(|v| v as i64),
                            bucket.latency_p50,
                            bucket.latency_p95,
                            bucket.latency_p99,
                            bucket.unique_users.map(|v| v as i64),
                            by_source,
                            by_event_type,
                            by_severity,
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(n)
            })?;
        }
        if inserted < buckets.len() {
            tracing::debug!(
                skipped = buckets.len() - inserted,
                "cold store already held some buckets"
            );
        }
        Ok(inserted)
    }

    fn cleanup(&self, retention_days: u32) -> Result<u32> {
        Ok(self.partitions.cleanup_older_than(retention_days)?)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<MetricsResult<MetricsBucket>> {
    let ts = |secs: i64| Utc.timestamp_opt(secs, 0).single().unwrap_or_default();
    let opt_u64 = |v: Option<i64>| v.map(|v| v.max(0) as u64);
    let by_source: String = row.get(12)?;
    let by_event_type: String = row.get(13)?;
    let by_severity: String = row.get(14)?;
    let mut bucket = MetricsBucket {
        start: ts(row.get(0)?),
        end: ts(row.get(1)?),
        total_events: row.get::<_, i64>(2)? as u64,
        total_errors: row.get::<_, i64>(3)? as u64,
        latency_sum: row.get::<_, i64>(4)? as u64,
        latency_count: row.get::<_, i64>(5)? as u64,
        latency_min: opt_u64(row.get(6)?),
        latency_max: opt_u64(row.get(7)?),
        latency_p50: row.get(8)?,
        latency_p95: row.get(9)?,
        latency_p99: row.get(10)?,
        unique_users: opt_u64(row.get(11)?),
        ..Default::default()
    };
    let decoded = (|| -> MetricsResult<()> {
        bucket.by_source = serde_json::from_str(&by_source)?;
        bucket.by_event_type = serde_json::from_str(&by_event_type)?;
        bucket.by_severity = serde_json::from_str(&by_severity)?;
        Ok(())
    })();
    Ok(decoded.map(|_| bucket))
}
