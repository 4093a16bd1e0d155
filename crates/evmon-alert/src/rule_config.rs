//! Typed views over the schema-free rule configuration map.
//!
//! Numbers are accepted either as JSON numbers or numeric strings, and
//! filters either as a list or a single string, since rule authors write
//! both.

use crate::condition::ChangeMetric;
use crate::error::{AlertError, Result};
use evmon_common::types::AlertRule;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;

pub const EVENT_RATIO: &str = "EVENT_RATIO";

/// Which handler family a rule belongs to, decided from its structure alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleShape {
    Composite,
    EventRatio,
    RateOfChange,
    Simple,
    Unknown,
}

impl RuleShape {
    pub fn of(rule: &AlertRule) -> Self {
        if rule.has_conditions() {
            return RuleShape::Composite;
        }
        match rule.metric_type() {
            Some(EVENT_RATIO) => RuleShape::EventRatio,
            Some(m) if ChangeMetric::parse(m).is_some() => RuleShape::RateOfChange,
            Some(_) => RuleShape::Simple,
            None => RuleShape::Unknown,
        }
    }
}

/// Deserialize the whole configuration map into `T`.
pub fn parse<T: DeserializeOwned>(rule: &AlertRule) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(rule.config.clone()))?)
}

pub fn require_threshold(value: Option<f64>) -> Result<f64> {
    value.ok_or(AlertError::MissingField("thresholdValue"))
}

/// Longest cooldown a rule may ask for (30 days).
pub const MAX_COOLDOWN_MINUTES: u64 = 30 * 24 * 60;

/// Fields that decide which metrics a rule reads and how long it stays
/// quiet after firing. Shared by every rule shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleScope {
    /// Unparseable values fall back to the default window.
    #[serde(default, deserialize_with = "lenient_u32_or_none")]
    pub time_window_minutes: Option<u32>,
    #[serde(default, deserialize_with = "string_list")]
    pub source_filter: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_list")]
    pub event_type_filter: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_u64_or_none")]
    pub cooldown_minutes: Option<u64>,
}

impl RuleScope {
    /// Cooldown to apply after the rule fires, `default_minutes` when the
    /// rule sets none.
    pub fn cooldown(&self, default_minutes: u64) -> Result<Duration> {
        let minutes = self.cooldown_minutes.unwrap_or(default_minutes);
        if minutes > MAX_COOLDOWN_MINUTES {
            return Err(AlertError::OutOfRange {
                field: "cooldownMinutes",
                value: minutes,
                max: MAX_COOLDOWN_MINUTES,
            });
        }
        Ok(Duration::from_secs(minutes * 60))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub metric_type: String,
    pub condition: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub threshold_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub min_events_to_evaluate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeConfig {
    #[serde(default)]
    pub operator: Option<String>,
    pub conditions: Vec<SubCondition>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub min_events_to_evaluate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCondition {
    pub metric_type: String,
    pub condition: String,
    #[serde(default, alias = "thresholdValue", deserialize_with = "lenient_f64")]
    pub value: Option<f64>,
    #[serde(default, deserialize_with = "string_list")]
    pub source_filter: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_list")]
    pub event_type_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatioConfig {
    pub numerator_event_type: String,
    pub denominator_event_type: String,
    pub condition: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub threshold_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub min_denominator_events: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateOfChangeConfig {
    pub metric_type: String,
    pub condition: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub threshold_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s.map(|s| s.to_ascii_uppercase()).as_deref() {
            None | Some("AND") => Ok(LogicalOp::And),
            Some("OR") => Ok(LogicalOp::Or),
            Some(other) => Err(AlertError::UnknownOperator(other.to_string())),
        }
    }
}

impl std::fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Num(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    match Option::<Lenient>::deserialize(d)? {
        None => Ok(None),
        Some(Lenient::Num(n)) => Ok(Some(n)),
        Some(Lenient::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("'{s}' is not a number"))),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(lenient_f64(d)?.map(|n| n.max(0.0) as u64))
}

fn lenient_u64_or_none<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64().map(|n| n.max(0.0) as u64),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_u32_or_none<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    Ok(lenient_u64_or_none(d)?.map(|n| n.min(u32::MAX as u64) as u32))
}

fn string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<String>>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(d)? {
        None => None,
        Some(OneOrMany::One(s)) if s.is_empty() => None,
        Some(OneOrMany::One(s)) => Some(vec![s]),
        Some(OneOrMany::Many(v)) if v.is_empty() => None,
        Some(OneOrMany::Many(v)) => Some(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(config: Value) -> AlertRule {
        serde_json::from_value(json!({ "id": "r", "config": config })).unwrap()
    }

    #[test]
    fn shape_is_structural() {
        assert_eq!(RuleShape::of(&rule(json!({"conditions": []}))), RuleShape::Composite);
        assert_eq!(
            RuleShape::of(&rule(json!({"metricType": "EVENT_RATIO"}))),
            RuleShape::EventRatio
        );
        assert_eq!(
            RuleShape::of(&rule(json!({"metricType": "SPIKE_DETECTION"}))),
            RuleShape::RateOfChange
        );
        assert_eq!(
            RuleShape::of(&rule(json!({"metricType": "ERROR_RATE"}))),
            RuleShape::Simple
        );
        assert_eq!(RuleShape::of(&rule(json!({}))), RuleShape::Unknown);
    }

    #[test]
    fn cooldown_falls_back_and_is_capped() {
        let unset: RuleScope = parse(&rule(json!({}))).unwrap();
        assert_eq!(unset.cooldown(5).unwrap(), Duration::from_secs(300));

        let max: RuleScope = parse(&rule(json!({ "cooldownMinutes": MAX_COOLDOWN_MINUTES }))).unwrap();
        assert_eq!(max.cooldown(5).unwrap(), Duration::from_secs(MAX_COOLDOWN_MINUTES * 60));

        let huge: RuleScope = parse(&rule(json!({ "cooldownMinutes": 2e17 }))).unwrap();
        assert!(matches!(
            huge.cooldown(5),
            Err(AlertError::OutOfRange { field: "cooldownMinutes", .. })
        ));
    }

    #[test]
    fn numbers_and_filters_are_lenient() {
        let r = rule(json!({
            "metricType": "ERROR_RATE",
            "condition": "GREATER_THAN",
            "thresholdValue": "2.5",
            "timeWindowMinutes": "15",
            "sourceFilter": "api",
            "eventTypeFilter": []
        }));
        let cfg: ThresholdConfig = parse(&r).unwrap();
        assert_eq!(cfg.threshold_value, Some(2.5));
        let scope: RuleScope = parse(&r).unwrap();
        assert_eq!(scope.time_window_minutes, Some(15));
        assert_eq!(scope.source_filter, Some(vec!["api".to_string()]));
        assert_eq!(scope.event_type_filter, None);
    }

    #[test]
    fn bad_threshold_is_an_error() {
        let r = rule(json!({
            "metricType": "ERROR_RATE",
            "condition": "GREATER_THAN",
            "thresholdValue": "lots"
        }));
        assert!(parse::<ThresholdConfig>(&r).is_err());
    }

    #[test]
    fn bad_window_falls_back_to_default() {
        let scope: RuleScope = parse(&rule(json!({"timeWindowMinutes": "soon"}))).unwrap();
        assert_eq!(scope.time_window_minutes, None);
    }

    #[test]
    fn operator_defaults_to_and() {
        assert_eq!(LogicalOp::parse(None).unwrap(), LogicalOp::And);
        assert_eq!(LogicalOp::parse(Some("or")).unwrap(), LogicalOp::Or);
        assert!(LogicalOp::parse(Some("XOR")).is_err());
    }
}
