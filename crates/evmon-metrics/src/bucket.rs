use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counts and latency aggregates for one source or one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionMetrics {
    pub events: u64,
    pub errors: u64,
    pub latency_sum: u64,
    pub latency_count: u64,
}

pub type SourceMetrics = DimensionMetrics;
pub type TypeMetrics = DimensionMetrics;

impl DimensionMetrics {
    pub fn avg_latency(&self) -> f64 {
        if self.latency_count > 0 {
            self.latency_sum as f64 / self.latency_count as f64
        } else {
            0.0
        }
    }

    /// Error percentage in `[0, 100]`.
    pub fn error_rate(&self) -> f64 {
        if self.events > 0 {
            self.errors as f64 * 100.0 / self.events as f64
        } else {
            0.0
        }
    }

    pub fn add(&mut self, other: &DimensionMetrics) {
        self.events += other.events;
        self.errors += other.errors;
        self.latency_sum += other.latency_sum;
        self.latency_count += other.latency_count;
    }

    pub(crate) fn set_field(&mut self, field: &str, value: i64) {
        let value = value.max(0) as u64;
        match field {
            "events" => self.events = value,
            "errors" => self.errors = value,
            "latency_sum" => self.latency_sum = value,
            "latency_count" => self.latency_count = value,
            _ => {}
        }
    }
}

/// Aggregate of all events that landed in `[start, end)`.
///
/// A bucket read over a window is the merge of every fixed-size bucket the
/// window covers. Percentiles, min and max are computed from the union of
/// the raw latency samples and stay `None` when there were none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_events: u64,
    pub total_errors: u64,
    pub latency_sum: u64,
    pub latency_count: u64,
    pub latency_min: Option<u64>,
    pub latency_max: Option<u64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub by_source: HashMap<String, SourceMetrics>,
    pub by_event_type: HashMap<String, TypeMetrics>,
    pub by_severity: HashMap<String, u64>,
    /// Distinct user estimate; only known for unfiltered reads.
    pub unique_users: Option<u64>,
}

impl MetricsBucket {
    pub fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    pub fn avg_latency(&self) -> f64 {
        if self.latency_count > 0 {
            self.latency_sum as f64 / self.latency_count as f64
        } else {
            0.0
        }
    }

    /// Error percentage in `[0, 100]`.
    pub fn error_rate(&self) -> f64 {
        if self.total_events > 0 {
            self.total_errors as f64 * 100.0 / self.total_events as f64
        } else {
            0.0
        }
    }

    pub fn unique_sources(&self) -> u64 {
        self.by_source.values().filter(|m| m.events > 0).count() as u64
    }

    pub fn unique_event_types(&self) -> u64 {
        self.by_event_type.values().filter(|m| m.events > 0).count() as u64
    }

    /// Sum counts and breakdowns of `other` into `self`.
    ///
    /// Latency-derived fields are left alone; they are recomputed from the
    /// sample union with [`MetricsBucket::apply_samples`].
    pub fn merge_counts(&mut self, other: &MetricsBucket) {
        self.total_events += other.total_events;
        self.total_errors += other.total_errors;
        self.latency_sum += other.latency_sum;
        self.latency_count += other.latency_count;
        for (name, m) in &other.by_source {
            self.by_source.entry(name.clone()).or_default().add(m);
        }
        for (name, m) in &other.by_event_type {
            self.by_event_type.entry(name.clone()).or_default().add(m);
        }
        for (sev, count) in &other.by_severity {
            *self.by_severity.entry(sev.clone()).or_default() += count;
        }
    }

    /// Fill min, max and percentiles from latency samples sorted ascending.
    pub fn apply_samples(&mut self, sorted: &[f64]) {
        self.latency_min = sorted.first().map(|v| *v as u64);
        self.latency_max = sorted.last().map(|v| *v as u64);
        self.latency_p50 = percentile(sorted, 0.50);
        self.latency_p95 = percentile(sorted, 0.95);
        self.latency_p99 = percentile(sorted, 0.99);
    }
}

/// Value at sorted rank `floor(p * N)`, without interpolation.
///
/// # Examples
///
/// ```
/// use evmon_metrics::bucket::percentile;
///
/// let samples = [10.0, 20.0, 30.0, 40.0, 50.0];
/// assert_eq!(percentile(&samples, 0.50), Some(30.0));
/// assert_eq!(percentile(&samples, 0.95), Some(50.0));
/// assert_eq!(percentile(&[], 0.50), None);
/// ```
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).floor() as usize;
    Some(sorted[rank.min(sorted.len() - 1)])
}
