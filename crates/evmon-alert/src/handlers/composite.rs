use crate::condition::{CompareOp, MetricKind};
use crate::error::{AlertError, Result};
use crate::rule_config::{self, CompositeConfig, LogicalOp, RuleShape};
use crate::{EvalContext, EvaluationResult, RuleHandler};
use async_trait::async_trait;
use evmon_common::types::AlertRule;
use evmon_metrics::MetricsBucket;
use std::borrow::Cow;

/// Several threshold conditions joined by AND or OR.
///
/// Every condition is evaluated so the details show all of them. The
/// headline value and threshold are those of the first condition.
pub struct CompositeHandler;

struct Outcome {
    value: Option<f64>,
    threshold: f64,
    passed: bool,
}

#[async_trait]
impl RuleHandler for CompositeHandler {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn can_handle(&self, rule: &AlertRule) -> bool {
        RuleShape::of(rule) == RuleShape::Composite
    }

    async fn evaluate(
        &self,
        rule: &AlertRule,
        bucket: &MetricsBucket,
        ctx: &EvalContext<'_>,
    ) -> Result<Option<EvaluationResult>> {
        let cfg: CompositeConfig = rule_config::parse(rule)?;
        let logic = LogicalOp::parse(cfg.operator.as_deref())?;
        if cfg.conditions.is_empty() {
            return Err(AlertError::MissingField("conditions"));
        }

        let min_events = cfg.min_events_to_evaluate.unwrap_or(1);
        if bucket.total_events < min_events {
            return Ok(None);
        }

        let mut outcomes = Vec::with_capacity(cfg.conditions.len());
        let mut parts = Vec::with_capacity(cfg.conditions.len());
        for cond in &cfg.conditions {
            let metric: MetricKind = cond.metric_type.parse()?;
            let op: CompareOp = cond.condition.parse()?;
            let threshold = cond.value.ok_or(AlertError::MissingField("value"))?;

            let key = ctx
                .key
                .with_overrides(cond.source_filter.as_ref(), cond.event_type_filter.as_ref());
            if cond.event_type_filter.is_some() && key.source_filter.is_some() {
                tracing::debug!(
                    rule_id = %rule.id,
                    metric_type = %cond.metric_type,
                    "condition event type filter ignored, source filter takes precedence"
                );
            }
            let sub_bucket = if key == *ctx.key {
                Cow::Borrowed(bucket)
            } else {
                Cow::Owned(ctx.reader.read(key.window_minutes, &key.filter(), ctx.now).await)
            };

            let value = metric.extract(&sub_bucket, key.window_minutes);
            let passed = value.is_some_and(|v| op.check(v, threshold));
            let shown = value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
            let mark = if passed { "✓" } else { "✗" };
            parts.push(format!("{}({shown}) {op} {threshold} {mark}", cond.metric_type));
            outcomes.push(Outcome {
                value,
                threshold,
                passed,
            });
        }

        let crossed = match logic {
            LogicalOp::And => outcomes.iter().all(|o| o.passed),
            LogicalOp::Or => outcomes.iter().any(|o| o.passed),
        };
        if !crossed {
            return Ok(None);
        }

        let headline = &outcomes[0];
        Ok(Some(EvaluationResult {
            current_value: headline.value.unwrap_or(0.0),
            threshold: headline.threshold,
            details: format!("COMPOSITE[{logic}]: {}", parts.join(" | ")),
        }))
    }
}
