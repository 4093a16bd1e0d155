use crate::error::AlertError;
use evmon_metrics::MetricsBucket;
use std::str::FromStr;

const EQUALS_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Equals,
    NotEquals,
}

impl FromStr for CompareOp {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GREATER_THAN" | "gt" => Ok(Self::GreaterThan),
            "GREATER_THAN_OR_EQUAL" | "gte" => Ok(Self::GreaterEqual),
            "LESS_THAN" | "lt" => Ok(Self::LessThan),
            "LESS_THAN_OR_EQUAL" | "lte" => Ok(Self::LessEqual),
            "EQUALS" | "eq" => Ok(Self::Equals),
            "NOT_EQUALS" | "ne" => Ok(Self::NotEquals),
            _ => Err(AlertError::UnknownCondition(s.to_string())),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessEqual => write!(f, "<="),
            Self::Equals => write!(f, "=="),
            Self::NotEquals => write!(f, "!="),
        }
    }
}

impl CompareOp {
    /// # Examples
    ///
    /// ```
    /// use evmon_alert::condition::CompareOp;
    ///
    /// assert!(CompareOp::GreaterThan.check(5.1, 5.0));
    /// assert!(CompareOp::Equals.check(0.30001, 0.3));
    /// assert!(!CompareOp::NotEquals.check(0.30001, 0.3));
    /// ```
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessEqual => value <= threshold,
            Self::Equals => (value - threshold).abs() < EQUALS_EPSILON,
            Self::NotEquals => (value - threshold).abs() >= EQUALS_EPSILON,
        }
    }
}

/// A value a simple threshold can be checked against, extracted from one
/// merged bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    ErrorRate,
    TotalErrors,
    AvgLatency,
    P50Latency,
    P95Latency,
    P99Latency,
    MaxLatency,
    MinLatency,
    TotalEvents,
    EventsPerSecond,
    EventsPerMinute,
    EventsPerHour,
    EventsPerDay,
    /// `EVENTS_LAST_*`: the window total, the window itself comes from the
    /// rule's `timeWindowMinutes`.
    EventsInWindow,
    UniqueSources,
    UniqueEventTypes,
    UniqueUsers,
    SystemHealth,
}

impl FromStr for MetricKind {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ERROR_RATE" => Self::ErrorRate,
            "TOTAL_ERRORS" => Self::TotalErrors,
            "AVG_LATENCY" => Self::AvgLatency,
            "P50_LATENCY" => Self::P50Latency,
            "P95_LATENCY" => Self::P95Latency,
            "P99_LATENCY" => Self::P99Latency,
            "MAX_LATENCY" => Self::MaxLatency,
            "MIN_LATENCY" => Self::MinLatency,
            "TOTAL_EVENTS" => Self::TotalEvents,
            "EVENTS_PER_SECOND" => Self::EventsPerSecond,
            "EVENTS_PER_MINUTE" => Self::EventsPerMinute,
            "EVENTS_PER_HOUR" => Self::EventsPerHour,
            "EVENTS_PER_DAY" => Self::EventsPerDay,
            "EVENTS_LAST_1_MINUTE" | "EVENTS_LAST_5_MINUTES" | "EVENTS_LAST_15_MINUTES"
            | "EVENTS_LAST_1_HOUR" | "EVENTS_LAST_24_HOURS" => Self::EventsInWindow,
            "UNIQUE_SOURCES" => Self::UniqueSources,
            "UNIQUE_EVENT_TYPES" => Self::UniqueEventTypes,
            "UNIQUE_USERS"
            | "ACTIVE_USERS_LAST_1_HOUR"
            | "ACTIVE_USERS_LAST_24_HOURS"
            | "TOTAL_UNIQUE_USERS" => Self::UniqueUsers,
            "SYSTEM_HEALTH" => Self::SystemHealth,
            _ => return Err(AlertError::UnknownMetric(s.to_string())),
        })
    }
}

impl MetricKind {
    /// Read this metric from `bucket`, which covers `window_minutes`.
    ///
    /// `None` means the bucket carries no signal for the metric (no latency
    /// samples, or a unique count unknown for a filtered read) and the rule
    /// should not be evaluated.
    pub fn extract(&self, bucket: &MetricsBucket, window_minutes: u32) -> Option<f64> {
        let total = bucket.total_events as f64;
        let minutes = window_minutes.max(1) as f64;
        match self {
            Self::ErrorRate => Some(bucket.error_rate()),
            Self::TotalErrors => Some(bucket.total_errors as f64),
            Self::AvgLatency => Some(bucket.avg_latency()),
            Self::P50Latency => bucket.latency_p50,
            Self::P95Latency => bucket.latency_p95,
            Self::P99Latency => bucket.latency_p99,
            Self::MaxLatency => bucket.latency_max.map(|v| v as f64),
            Self::MinLatency => bucket.latency_min.map(|v| v as f64),
            Self::TotalEvents | Self::EventsInWindow => Some(total),
            Self::EventsPerSecond => Some(total / (minutes * 60.0)),
            Self::EventsPerMinute => Some(total / minutes),
            Self::EventsPerHour => Some(total * 60.0 / minutes),
            Self::EventsPerDay => Some(total * 1440.0 / minutes),
            Self::UniqueSources => Some(bucket.unique_sources() as f64),
            Self::UniqueEventTypes => Some(bucket.unique_event_types() as f64),
            Self::UniqueUsers => bucket.unique_users.map(|v| v as f64),
            Self::SystemHealth => Some((100.0 - bucket.error_rate()).max(0.0)),
        }
    }
}

/// Metrics compared between the current and the previous window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMetric {
    ErrorRateChange,
    LatencyChange,
    ThroughputChange,
    SpikeDetection,
}

impl ChangeMetric {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ERROR_RATE_CHANGE" => Some(Self::ErrorRateChange),
            "LATENCY_CHANGE" => Some(Self::LatencyChange),
            "THROUGHPUT_CHANGE" => Some(Self::ThroughputChange),
            "SPIKE_DETECTION" => Some(Self::SpikeDetection),
            _ => None,
        }
    }

    /// The plain metric whose change is measured.
    pub fn base(&self) -> MetricKind {
        match self {
            Self::ErrorRateChange => MetricKind::ErrorRate,
            Self::LatencyChange => MetricKind::AvgLatency,
            Self::ThroughputChange => MetricKind::EventsPerMinute,
            Self::SpikeDetection => MetricKind::TotalEvents,
        }
    }
}

impl std::fmt::Display for ChangeMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorRateChange => write!(f, "ERROR_RATE_CHANGE"),
            Self::LatencyChange => write!(f, "LATENCY_CHANGE"),
            Self::ThroughputChange => write!(f, "THROUGHPUT_CHANGE"),
            Self::SpikeDetection => write!(f, "SPIKE_DETECTION"),
        }
    }
}
