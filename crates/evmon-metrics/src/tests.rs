use crate::cache::{CacheOp, MemoryCache, MetricsCache};
use crate::cold::{ColdStore, SqliteColdStore};
use crate::error::{MetricsError, Result};
use crate::rollup::{RollupConfig, RollupTask};
use crate::store::{BucketedMetricsStore, MetricsConfig};
use crate::{MetricsFilter, MetricsReader};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use evmon_common::types::EventRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// Deliberately not on a bucket boundary.
const NOW: i64 = 1_700_000_007;

fn store(cache: Arc<dyn MetricsCache>) -> BucketedMetricsStore {
    BucketedMetricsStore::new(cache, "test", &MetricsConfig::default())
}

fn event(source: &str, event_type: &str, severity: &str, latency_ms: i64) -> EventRecord {
    EventRecord {
        source: Some(source.to_string()),
        event_type: Some(event_type.to_string()),
        severity: Some(severity.to_string()),
        latency_ms,
        ..Default::default()
    }
}

struct FailingCache;

#[async_trait]
impl MetricsCache for FailingCache {
    async fn apply(&self, _ops: &[CacheOp]) -> Result<()> {
        Err(MetricsError::Other("cache down".into()))
    }
    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, i64>> {
        Err(MetricsError::Other("cache down".into()))
    }
    async fn sorted_scores(&self, _key: &str) -> Result<Vec<f64>> {
        Err(MetricsError::Other("cache down".into()))
    }
    async fn unique_count(&self, _keys: &[String]) -> Result<u64> {
        Err(MetricsError::Other("cache down".into()))
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        Err(MetricsError::Other("cache down".into()))
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: std::time::Duration) -> Result<()> {
        Err(MetricsError::Other("cache down".into()))
    }
}

#[tokio::test]
async fn percentiles_use_floor_rank() {
    let s = store(Arc::new(MemoryCache::new()));
    for latency in [50, 10, 40, 20, 30] {
        s.write_at(&event("api", "request", "INFO", latency), at(NOW - 2)).await;
    }

    let b = s.read(5, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.latency_count, 5);
    assert_eq!(b.latency_p50, Some(30.0));
    assert_eq!(b.latency_p95, Some(50.0));
    assert_eq!(b.latency_p99, Some(50.0));
    assert_eq!(b.latency_min, Some(10));
    assert_eq!(b.latency_max, Some(50));
    assert_eq!(b.avg_latency(), 30.0);
}

#[tokio::test]
async fn duplicate_latencies_are_all_kept() {
    let s = store(Arc::new(MemoryCache::new()));
    for _ in 0..4 {
        s.write_at(&event("api", "request", "INFO", 100), at(NOW)).await;
    }
    s.write_at(&event("api", "request", "INFO", 900), at(NOW)).await;

    let b = s.read(1, &MetricsFilter::Global, at(NOW)).await;
    // 4 x 100 and 1 x 900: rank floor(0.5 * 5) = 2 is still 100.
    assert_eq!(b.latency_p50, Some(100.0));
    assert_eq!(b.latency_p95, Some(900.0));
}

#[tokio::test]
async fn empty_window_is_zero_with_null_percentiles() {
    let s = store(Arc::new(MemoryCache::new()));
    let b = s.read(15, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.total_events, 0);
    assert_eq!(b.total_errors, 0);
    assert_eq!(b.latency_count, 0);
    assert!(b.latency_p50.is_none());
    assert!(b.latency_p95.is_none());
    assert!(b.latency_p99.is_none());
    assert!(b.latency_min.is_none());
    assert_eq!(b.error_rate(), 0.0);
    assert_eq!(b.unique_users, Some(0));
}

#[tokio::test]
async fn count_invariants_hold() {
    let s = store(Arc::new(MemoryCache::new()));
    let writes = [
        ("api", "INFO", 0, false),
        ("api", "ERROR", 15, false),
        ("db", "WARNING", 0, true),
        ("db", "CRITICAL", 40, false),
        ("web", "INFO", 5, false),
    ];
    for (source, sev, latency, flag) in writes {
        let mut ev = event(source, "request", sev, latency);
        ev.is_error = flag;
        s.write_at(&ev, at(NOW - 3)).await;
    }

    let b = s.read(1, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.total_events, 5);
    assert_eq!(b.total_errors, 3);
    assert!(b.total_events >= b.latency_count);
    assert_eq!(b.latency_count, 3);
    assert_eq!(b.by_severity.get("CRITICAL"), Some(&1));
    assert_eq!(b.by_source["db"].errors, 2);
    assert_eq!(b.unique_sources(), 3);
    assert_eq!(b.unique_event_types(), 1);
    assert_eq!(b.error_rate(), 60.0);
}

#[tokio::test]
async fn source_and_type_filters() {
    let s = store(Arc::new(MemoryCache::new()));
    s.write_at(&event("api", "login", "ERROR", 100), at(NOW)).await;
    s.write_at(&event("api", "logout", "INFO", 300), at(NOW)).await;
    s.write_at(&event("db", "login", "INFO", 20), at(NOW)).await;

    let api = s
        .read(1, &MetricsFilter::Sources(vec!["api".into()]), at(NOW))
        .await;
    assert_eq!(api.total_events, 2);
    assert_eq!(api.total_errors, 1);
    assert_eq!(api.latency_p50, Some(300.0));
    assert_eq!(api.latency_min, Some(100));
    assert!(api.unique_users.is_none());

    let login = s.read(1, &MetricsFilter::event_type("login"), at(NOW)).await;
    assert_eq!(login.total_events, 2);
    assert_eq!(login.latency_max, Some(100));

    let both = s
        .read(
            1,
            &MetricsFilter::Sources(vec!["api".into(), "db".into()]),
            at(NOW),
        )
        .await;
    assert_eq!(both.total_events, 3);
    assert_eq!(both.by_source.len(), 2);

    let precedence = MetricsFilter::from_parts(Some(vec!["db".into()]), Some(vec!["logout".into()]));
    let db = s.read(1, &precedence, at(NOW)).await;
    assert_eq!(db.total_events, 1);

    let missing = s
        .read(1, &MetricsFilter::Sources(vec!["nope".into()]), at(NOW))
        .await;
    assert_eq!(missing.total_events, 0);
    assert!(missing.latency_p50.is_none());
}

#[tokio::test]
async fn percentiles_come_from_sample_union_across_buckets() {
    let s = store(Arc::new(MemoryCache::new()));
    // Bucket A: 10, 20. Bucket B: 30, 40, 50.
    s.write_at(&event("api", "req", "INFO", 10), at(NOW - 40)).await;
    s.write_at(&event("api", "req", "INFO", 20), at(NOW - 40)).await;
    for l in [30, 40, 50] {
        s.write_at(&event("api", "req", "INFO", l), at(NOW)).await;
    }

    let b = s.read(2, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.total_events, 5);
    assert_eq!(b.latency_p50, Some(30.0));
    assert_eq!(b.latency_min, Some(10));
}

#[tokio::test]
async fn previous_window_reads_preceding_interval() {
    let s = store(Arc::new(MemoryCache::new()));
    s.write_at(&event("api", "req", "ERROR", 0), at(NOW - 7 * 60)).await;
    s.write_at(&event("api", "req", "INFO", 0), at(NOW - 8 * 60)).await;
    s.write_at(&event("api", "req", "INFO", 0), at(NOW - 2 * 60)).await;

    let current = s.read(5, &MetricsFilter::Global, at(NOW)).await;
    let previous = s.previous_window(5, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(current.total_events, 1);
    assert_eq!(previous.total_events, 2);
    assert_eq!(previous.total_errors, 1);
}

#[tokio::test]
async fn boundary_bucket_belongs_to_current_window_only() {
    let s = store(Arc::new(MemoryCache::new()));
    // NOW - 58 shares its bucket with NOW - 60, the start of a 1 minute window.
    for _ in 0..5 {
        s.write_at(&event("api", "req", "INFO", 0), at(NOW - 58)).await;
    }
    // NOW - 68 falls in the last bucket of the previous window.
    s.write_at(&event("api", "req", "INFO", 0), at(NOW - 68)).await;

    let current = s.read(1, &MetricsFilter::Global, at(NOW)).await;
    let previous = s.previous_window(1, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(current.total_events, 5);
    assert_eq!(previous.total_events, 1);
    assert_eq!(previous.end, current.start);
    assert_eq!(current.start, s.align(at(NOW - 60)));
}

#[tokio::test]
async fn unique_users_across_window() {
    let s = store(Arc::new(MemoryCache::new()));
    for (user, offset) in [("u1", 0), ("u2", 0), ("u1", 30), ("u3", 30)] {
        let mut ev = event("api", "req", "INFO", 0);
        ev.user_id = Some(user.to_string());
        s.write_at(&ev, at(NOW - offset)).await;
    }
    let b = s.read(5, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.unique_users, Some(3));
}

#[tokio::test]
async fn failing_cache_degrades_to_empty() {
    let s = store(Arc::new(FailingCache));
    s.write_at(&event("api", "req", "ERROR", 10), at(NOW)).await;

    let b = s.read(5, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.total_events, 0);
    assert!(b.latency_p50.is_none());
    assert!(b.unique_users.is_none());

    assert!(s.buckets_in_range(at(NOW - 60), at(NOW)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn buckets_expire_after_retention() {
    let s = store(Arc::new(MemoryCache::new()));
    s.write_at(&event("api", "req", "INFO", 10), at(NOW)).await;
    assert_eq!(s.read(5, &MetricsFilter::Global, at(NOW)).await.total_events, 1);

    tokio::time::advance(std::time::Duration::from_secs(61 * 60 + 10)).await;
    let b = s.read(5, &MetricsFilter::Global, at(NOW)).await;
    assert_eq!(b.total_events, 0);
    assert!(b.latency_p50.is_none());
}

#[tokio::test(start_paused = true)]
async fn memory_cache_ttl_and_types() {
    let cache = MemoryCache::new();
    cache
        .set_with_ttl("marker", "1", std::time::Duration::from_secs(30))
        .await
        .unwrap();
    assert!(cache.exists("marker").await.unwrap());
    assert_eq!(cache.get_plain("marker").as_deref(), Some("1"));

    let err = cache.hash_get_all("marker").await.unwrap_err();
    assert!(matches!(err, MetricsError::WrongType { .. }));

    tokio::time::advance(std::time::Duration::from_secs(31)).await;
    assert!(!cache.exists("marker").await.unwrap());
    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn memory_cache_accepts_unbounded_ttl() {
    let cache = MemoryCache::new();
    cache
        .set_with_ttl("marker", "1", std::time::Duration::MAX)
        .await
        .unwrap();
    cache
        .apply(&[
            CacheOp::HashIncr {
                key: "h".into(),
                field: "f".into(),
                delta: 1,
            },
            CacheOp::Expire {
                key: "h".into(),
                ttl: std::time::Duration::MAX,
            },
        ])
        .await
        .unwrap();

    tokio::time::advance(std::time::Duration::from_secs(365 * 24 * 3600)).await;
    assert!(cache.exists("marker").await.unwrap());
    assert_eq!(cache.hash_get_all("h").await.unwrap()["f"], 1);
    assert_eq!(cache.purge_expired(), 0);
}

#[tokio::test]
async fn buckets_in_range_skips_empty_buckets() {
    let s = store(Arc::new(MemoryCache::new()));
    s.write_at(&event("api", "req", "INFO", 10), at(NOW - 50)).await;
    s.write_at(&event("api", "req", "INFO", 30), at(NOW - 10)).await;

    let buckets = s.buckets_in_range(at(NOW - 67), at(NOW - 7)).await.unwrap();
    assert_eq!(buckets.len(), 2);
    assert!(buckets.iter().all(|b| b.total_events == 1));
    assert_eq!(buckets[0].end - buckets[0].start, Duration::seconds(10));
    assert_eq!(buckets[0].latency_p50, Some(10.0));
}

#[test]
fn cold_store_insert_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let cold = SqliteColdStore::new(tmp.path()).unwrap();

    let mut bucket = crate::bucket::MetricsBucket::empty(at(NOW - 7), at(NOW + 3));
    bucket.total_events = 4;
    bucket.total_errors = 1;
    bucket.latency_p50 = Some(12.0);
    bucket.by_severity.insert("ERROR".into(), 1);
    bucket.by_source.entry("api".into()).or_default().events = 4;

    assert_eq!(cold.insert_buckets(&[bucket.clone()]).unwrap(), 1);
    assert_eq!(cold.insert_buckets(&[bucket.clone()]).unwrap(), 0);
    assert!(cold.contains(bucket.start, bucket.end).unwrap());

    let rows = cold.query_buckets(at(NOW - 3600), at(NOW + 3600)).unwrap();
    assert_eq!(rows, vec![bucket]);
    assert_eq!(cold.list_partitions().unwrap().len(), 1);
}

#[test]
fn cold_store_batch_spans_daily_partitions() {
    let tmp = TempDir::new().unwrap();
    let cold = SqliteColdStore::new(tmp.path()).unwrap();

    // 1_700_006_400 is midnight UTC.
    let midnight = 1_700_006_400;
    let buckets: Vec<_> = [midnight - 20, midnight - 10, midnight, midnight + 10]
        .into_iter()
        .map(|start| {
            let mut b = crate::bucket::MetricsBucket::empty(at(start), at(start + 10));
            b.total_events = 1;
            b
        })
        .collect();

    assert_eq!(cold.insert_buckets(&buckets[..3]).unwrap(), 3);
    assert_eq!(cold.insert_buckets(&buckets).unwrap(), 1);
    assert_eq!(cold.list_partitions().unwrap().len(), 2);

    let rows = cold.query_buckets(at(midnight - 3600), at(midnight + 3600)).unwrap();
    assert_eq!(rows, buckets);
}

struct BrokenColdStore;

impl ColdStore for BrokenColdStore {
    fn insert_buckets(&self, _buckets: &[crate::bucket::MetricsBucket]) -> anyhow::Result<usize> {
        anyhow::bail!("disk full")
    }
    fn cleanup(&self, _retention_days: u32) -> anyhow::Result<u32> {
        Ok(0)
    }
}

#[tokio::test]
async fn rollup_exports_completed_buckets_once() {
    let tmp = TempDir::new().unwrap();
    let hot = Arc::new(store(Arc::new(MemoryCache::new())));
    let cold = Arc::new(SqliteColdStore::new(tmp.path()).unwrap());
    let task = RollupTask::new(hot.clone(), cold.clone(), RollupConfig::default());

    hot.write_at(&event("api", "req", "INFO", 10), at(NOW - 90)).await;
    // Still inside the lag; must wait for a later run.
    hot.write_at(&event("api", "req", "INFO", 10), at(NOW - 20)).await;

    assert_eq!(task.run_once(at(NOW)).await.unwrap(), 1);
    assert_eq!(task.watermark(), Some(hot.align(at(NOW - 60))));
    assert_eq!(task.run_once(at(NOW)).await.unwrap(), 0);

    assert_eq!(task.run_once(at(NOW + 60)).await.unwrap(), 1);
    let rows = cold.query_buckets(at(NOW - 3600), at(NOW + 3600)).unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn rollup_keeps_watermark_when_cold_store_fails() {
    let hot = Arc::new(store(Arc::new(MemoryCache::new())));
    let task = RollupTask::new(hot.clone(), Arc::new(BrokenColdStore), RollupConfig::default());
    hot.write_at(&event("api", "req", "INFO", 10), at(NOW - 90)).await;

    assert!(task.run_once(at(NOW)).await.is_err());
    assert_eq!(task.watermark(), None);
}
