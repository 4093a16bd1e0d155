use crate::bucket::{DimensionMetrics, MetricsBucket};
use crate::cache::{CacheOp, MetricsCache};
use crate::error::Result;
use crate::{MetricsFilter, MetricsReader};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use evmon_common::types::EventRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_bucket_size_secs")]
    pub bucket_size_secs: u64,
    /// Hot TTL of every bucket key, also the longest window a rule may read.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u32,
}

fn default_bucket_size_secs() -> u64 {
    10
}

fn default_retention_minutes() -> u32 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_size_secs: default_bucket_size_secs(),
            retention_minutes: default_retention_minutes(),
        }
    }
}

const SOURCE: &str = "source";
const TYPE: &str = "type";

/// One bucket as loaded from the cache, before merging.
struct LoadedBucket {
    counts: MetricsBucket,
    samples: Vec<f64>,
    users_key: Option<String>,
}

/// Time-bucketed aggregates kept in a TTL cache.
///
/// Key layout for the bucket starting at epoch second `t`:
///
/// * `{p}:bucket:{t}` hash with `events`, `errors`, `latency_sum`, `latency_count`
/// * `{p}:bucket:{t}:source` and `{p}:bucket:{t}:type` hashes with
///   `{name}|events` style fields
/// * `{p}:bucket:{t}:severity` hash of severity label to count
/// * `{p}:bucket:{t}:users` unique set of user ids
/// * `{p}:latency:{t}`, `{p}:latency:{t}:source:{name}`,
///   `{p}:latency:{t}:type:{name}` sorted sets scored by latency
pub struct BucketedMetricsStore {
    cache: Arc<dyn MetricsCache>,
    prefix: String,
    bucket_secs: i64,
    retention: Duration,
    instance: u64,
    seq: AtomicU64,
}

impl BucketedMetricsStore {
    pub fn new(cache: Arc<dyn MetricsCache>, prefix: &str, config: &MetricsConfig) -> Self {
        Self {
            cache,
            prefix: prefix.to_string(),
            bucket_secs: config.bucket_size_secs.max(1) as i64,
            retention: Duration::from_secs(config.retention_minutes as u64 * 60),
            instance: rand::random(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn bucket_size(&self) -> Duration {
        Duration::from_secs(self.bucket_secs as u64)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Start of the bucket containing `ts`.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        to_datetime(ts.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs)
    }

    /// Record one event into the bucket for the current time.
    pub async fn write(&self, event: &EventRecord) {
        self.write_at(event, Utc::now()).await
    }

    /// Record one event into the bucket containing `at`.
    ///
    /// Failures are logged and dropped; recording metrics never fails the
    /// caller.
    pub async fn write_at(&self, event: &EventRecord, at: DateTime<Utc>) {
        let ops = self.ops_for(event, at);
        if let Err(e) = self.cache.apply(&ops).await {
            tracing::warn!(
                event_type = event.event_type.as_deref().unwrap_or(""),
                error = %e,
                "failed to record event metrics"
            );
        }
    }

    fn ops_for(&self, event: &EventRecord, at: DateTime<Utc>) -> Vec<CacheOp> {
        let t = self.align(at).timestamp();
        let is_error = event.counts_as_error();
        let latency = event.latency();
        let ttl = self.retention + self.bucket_size();
        let mut ops = Vec::with_capacity(24);
        let mut touched = Vec::with_capacity(8);

        let bucket = self.bucket_key(t);
        push_counts(&mut ops, &bucket, "", is_error, latency);
        touched.push(bucket);

        let member = latency.map(|l| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            format!("{l}:{:x}:{seq}", self.instance)
        });
        if let (Some(l), Some(member)) = (latency, member.as_ref()) {
            let key = self.latency_key(t);
            ops.push(CacheOp::SortedAdd {
                key: key.clone(),
                member: member.clone(),
                score: l as f64,
            });
            touched.push(key);
        }

        for (dimension, name) in [(SOURCE, &event.source), (TYPE, &event.event_type)] {
            let Some(name) = name.as_deref().filter(|n| !n.is_empty()) else {
                continue;
            };
            let key = self.dimension_key(t, dimension);
            push_counts(&mut ops, &key, &format!("{name}|"), is_error, latency);
            touched.push(key);
            if let (Some(l), Some(member)) = (latency, member.as_ref()) {
                let key = self.dimension_latency_key(t, dimension, name);
                ops.push(CacheOp::SortedAdd {
                    key: key.clone(),
                    member: member.clone(),
                    score: l as f64,
                });
                touched.push(key);
            }
        }

        if let Some(sev) = event.severity.as_deref().filter(|s| !s.is_empty()) {
            let key = self.dimension_key(t, "severity");
            ops.push(CacheOp::HashIncr {
                key: key.clone(),
                field: sev.to_uppercase(),
                delta: 1,
            });
            touched.push(key);
        }

        if let Some(user) = event.user_id.as_deref().filter(|u| !u.is_empty()) {
            let key = self.dimension_key(t, "users");
            ops.push(CacheOp::UniqueAdd {
                key: key.clone(),
                element: user.to_string(),
            });
            touched.push(key);
        }

        ops.extend(touched.into_iter().map(|key| CacheOp::Expire { key, ttl }));
        ops
    }

    /// Every non-empty bucket starting in `[start, end)`, each with its own
    /// percentiles. Used by the rollup; unlike reads, errors propagate.
    pub async fn buckets_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricsBucket>> {
        let mut out = Vec::new();
        let mut t = ceil_align(start.timestamp(), self.bucket_secs);
        while t < end.timestamp() {
            let loaded = self.load_bucket(t, &MetricsFilter::Global).await?;
            if loaded.counts.total_events > 0 {
                let mut bucket = loaded.counts;
                bucket.apply_samples(&loaded.samples);
                if let Some(key) = loaded.users_key {
                    bucket.unique_users = Some(self.cache.unique_count(&[key]).await?);
                }
                out.push(bucket);
            }
            t += self.bucket_secs;
        }
        Ok(out)
    }

    async fn load_bucket(&self, t: i64, filter: &MetricsFilter) -> Result<LoadedBucket> {
        let start = to_datetime(t);
        let mut counts = MetricsBucket::empty(start, to_datetime(t + self.bucket_secs));
        let mut samples = Vec::new();
        let mut users_key = None;

        match filter {
            MetricsFilter::Global => {
                let base = self.cache.hash_get_all(&self.bucket_key(t)).await?;
                let mut totals = DimensionMetrics::default();
                for (field, value) in base {
                    totals.set_field(&field, value);
                }
                counts.total_events = totals.events;
                counts.total_errors = totals.errors;
                counts.latency_sum = totals.latency_sum;
                counts.latency_count = totals.latency_count;
                counts.by_source =
                    parse_dimension(self.cache.hash_get_all(&self.dimension_key(t, SOURCE)).await?);
                counts.by_event_type =
                    parse_dimension(self.cache.hash_get_all(&self.dimension_key(t, TYPE)).await?);
                counts.by_severity = self
                    .cache
                    .hash_get_all(&self.dimension_key(t, "severity"))
                    .await?
                    .into_iter()
                    .map(|(sev, n)| (sev, n.max(0) as u64))
                    .collect();
                samples = self.cache.sorted_scores(&self.latency_key(t)).await?;
                users_key = Some(self.dimension_key(t, "users"));
            }
            MetricsFilter::Sources(names) | MetricsFilter::EventTypes(names) => {
                let dimension = if matches!(filter, MetricsFilter::Sources(_)) {
                    SOURCE
                } else {
                    TYPE
                };
                let all = parse_dimension(
                    self.cache.hash_get_all(&self.dimension_key(t, dimension)).await?,
                );
                for name in names {
                    let Some(m) = all.get(name) else { continue };
                    counts.total_events += m.events;
                    counts.total_errors += m.errors;
                    counts.latency_sum += m.latency_sum;
                    counts.latency_count += m.latency_count;
                    let breakdown = if dimension == SOURCE {
                        &mut counts.by_source
                    } else {
                        &mut counts.by_event_type
                    };
                    breakdown.entry(name.clone()).or_default().add(m);
                    if m.latency_count > 0 {
                        samples.extend(
                            self.cache
                                .sorted_scores(&self.dimension_latency_key(t, dimension, name))
                                .await?,
                        );
                    }
                }
                samples.sort_by(|a, b| a.total_cmp(b));
            }
        }

        Ok(LoadedBucket {
            counts,
            samples,
            users_key,
        })
    }

    fn bucket_key(&self, t: i64) -> String {
        format!("{}:bucket:{t}", self.prefix)
    }

    fn dimension_key(&self, t: i64, dimension: &str) -> String {
        format!("{}:bucket:{t}:{dimension}", self.prefix)
    }

    fn latency_key(&self, t: i64) -> String {
        format!("{}:latency:{t}", self.prefix)
    }

    fn dimension_latency_key(&self, t: i64, dimension: &str, name: &str) -> String {
        format!("{}:latency:{t}:{dimension}:{name}", self.prefix)
    }
}

#[async_trait]
impl MetricsReader for BucketedMetricsStore {
    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.align(ts)
    }

    async fn read_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &MetricsFilter,
    ) -> MetricsBucket {
        let mut merged = MetricsBucket::empty(start, end);
        let mut samples = Vec::new();
        let mut users_keys = Vec::new();

        let end_secs = ceil_secs(end);
        let mut t = start.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs;
        while t < end_secs {
            match self.load_bucket(t, filter).await {
                Ok(loaded) => {
                    merged.merge_counts(&loaded.counts);
                    samples.extend(loaded.samples);
                    users_keys.extend(loaded.users_key);
                }
                Err(e) => {
                    tracing::warn!(
                        bucket = t,
                        filter = %filter,
                        error = %e,
                        "failed to load metrics bucket, counting it as empty"
                    );
                }
            }
            t += self.bucket_secs;
        }

        samples.sort_by(|a, b| a.total_cmp(b));
        merged.apply_samples(&samples);

        if *filter == MetricsFilter::Global {
            merged.unique_users = match self.cache.unique_count(&users_keys).await {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to count unique users");
                    None
                }
            };
        }
        merged
    }
}

fn push_counts(
    ops: &mut Vec<CacheOp>,
    key: &str,
    field_prefix: &str,
    is_error: bool,
    latency: Option<u64>,
) {
    let mut incr = |field: &str, delta: i64| {
        ops.push(CacheOp::HashIncr {
            key: key.to_string(),
            field: format!("{field_prefix}{field}"),
            delta,
        })
    };
    incr("events", 1);
    if is_error {
        incr("errors", 1);
    }
    if let Some(l) = latency {
        incr("latency_sum", l as i64);
        incr("latency_count", 1);
    }
}

fn parse_dimension(raw: HashMap<String, i64>) -> HashMap<String, DimensionMetrics> {
    let mut out: HashMap<String, DimensionMetrics> = HashMap::new();
    for (field, value) in raw {
        if let Some((name, metric)) = field.rsplit_once('|') {
            out.entry(name.to_string()).or_default().set_field(metric, value);
        }
    }
    out
}

fn to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Smallest whole second not before `ts`.
fn ceil_secs(ts: DateTime<Utc>) -> i64 {
    if ts.timestamp_subsec_nanos() > 0 {
        ts.timestamp() + 1
    } else {
        ts.timestamp()
    }
}

fn ceil_align(secs: i64, size: i64) -> i64 {
    let floor = secs.div_euclid(size) * size;
    if floor < secs {
        floor + size
    } else {
        floor
    }
}
