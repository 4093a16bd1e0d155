pub mod bucket;
pub mod cache;
pub mod cold;
pub mod error;
pub mod partition;
pub mod redis_cache;
pub mod rollup;
pub mod store;

pub use bucket::{DimensionMetrics, MetricsBucket, SourceMetrics, TypeMetrics};
pub use cache::{CacheOp, MemoryCache, MetricsCache};
pub use cold::{ColdStore, SqliteColdStore};
pub use redis_cache::RedisCache;
pub use rollup::{RollupConfig, RollupTask};
pub use store::{BucketedMetricsStore, MetricsConfig};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Which slice of the traffic a read aggregates.
///
/// Only one dimension is filterable per read. When a rule names both, the
/// source filter wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum MetricsFilter {
    #[default]
    Global,
    Sources(Vec<String>),
    EventTypes(Vec<String>),
}

impl MetricsFilter {
    /// Build a filter from optional source and event-type lists. Empty lists
    /// count as absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use evmon_metrics::MetricsFilter;
    ///
    /// let f = MetricsFilter::from_parts(Some(vec!["api".into()]), Some(vec!["login".into()]));
    /// assert_eq!(f, MetricsFilter::Sources(vec!["api".into()]));
    /// assert_eq!(MetricsFilter::from_parts(Some(vec![]), None), MetricsFilter::Global);
    /// ```
    pub fn from_parts(sources: Option<Vec<String>>, event_types: Option<Vec<String>>) -> Self {
        match (sources, event_types) {
            (Some(s), _) if !s.is_empty() => MetricsFilter::Sources(s),
            (_, Some(t)) if !t.is_empty() => MetricsFilter::EventTypes(t),
            _ => MetricsFilter::Global,
        }
    }

    pub fn event_type(name: &str) -> Self {
        MetricsFilter::EventTypes(vec![name.to_string()])
    }
}

impl std::fmt::Display for MetricsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsFilter::Global => write!(f, "global"),
            MetricsFilter::Sources(s) => write!(f, "source={}", s.join(",")),
            MetricsFilter::EventTypes(t) => write!(f, "type={}", t.join(",")),
        }
    }
}

/// Read side of the hot metrics store, as seen by rule evaluation.
///
/// Reads never fail: buckets that cannot be loaded contribute zero.
#[async_trait]
pub trait MetricsReader: Send + Sync {
    /// Merge every bucket overlapping `[start, end)`.
    async fn read_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &MetricsFilter,
    ) -> MetricsBucket;

    /// Start of the storage bucket containing `ts`. Readers without
    /// buckets return `ts` unchanged.
    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts
    }

    /// The last `window_minutes` up to `now`, starting at the bucket that
    /// contains `now - w`.
    async fn read(&self, window_minutes: u32, filter: &MetricsFilter, now: DateTime<Utc>) -> MetricsBucket {
        let start = self.bucket_start(now - Duration::minutes(window_minutes as i64));
        self.read_range(start, now, filter).await
    }

    /// The window of equal length ending where [`MetricsReader::read`]
    /// starts. The two never share a bucket.
    async fn previous_window(
        &self,
        window_minutes: u32,
        filter: &MetricsFilter,
        now: DateTime<Utc>,
    ) -> MetricsBucket {
        let w = Duration::minutes(window_minutes as i64);
        let end = self.bucket_start(now - w);
        self.read_range(end - w, end, filter).await
    }
}

#[cfg(test)]
mod tests;
