use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of an event or alert rule, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use evmon_common::types::Severity;
///
/// let sev: Severity = "error".parse().unwrap();
/// assert_eq!(sev, Severity::Error);
/// assert_eq!(sev.to_string(), "ERROR");
/// assert!(Severity::Critical > Severity::Warning);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warning")]
    Warning,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical")]
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// One application event as delivered by the ingestion feed.
///
/// Only the fields the metrics store aggregates are modelled; anything else
/// on the wire is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Free-form severity label; `ERROR` and `CRITICAL` count as errors.
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Latency in milliseconds, 0 when unknown.
    #[serde(default, alias = "latency")]
    pub latency_ms: i64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Whether the event should be counted in `totalErrors`.
    ///
    /// # Examples
    ///
    /// ```
    /// use evmon_common::types::EventRecord;
    ///
    /// let ev = EventRecord { severity: Some("critical".into()), ..Default::default() };
    /// assert!(ev.counts_as_error());
    /// assert!(!EventRecord::default().counts_as_error());
    /// ```
    pub fn counts_as_error(&self) -> bool {
        if self.is_error {
            return true;
        }
        matches!(
            self.severity.as_deref().map(str::parse::<Severity>),
            Some(Ok(Severity::Error | Severity::Critical))
        )
    }

    /// Latency to feed into latency statistics, `None` when unknown.
    pub fn latency(&self) -> Option<u64> {
        if self.latency_ms > 0 {
            Some(self.latency_ms as u64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    #[serde(alias = "ACTIVE")]
    Active,
    #[serde(alias = "INACTIVE")]
    Inactive,
}

/// Read-only view of an alerting rule owned by the rule-management side.
///
/// `config` is schema-free; its shape decides which handler evaluates the
/// rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default, alias = "ruleConfig")]
    pub config: Map<String, Value>,
}

impl AlertRule {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// The `metricType` config entry, if it is a string.
    pub fn metric_type(&self) -> Option<&str> {
        self.config.get("metricType").and_then(Value::as_str)
    }

    pub fn has_conditions(&self) -> bool {
        self.config.contains_key("conditions")
    }
}

/// An alert emitted by the evaluator towards the alert sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiredAlert {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub threshold: f64,
    pub current_value: f64,
    pub details: String,
    pub fired_at: DateTime<Utc>,
}
