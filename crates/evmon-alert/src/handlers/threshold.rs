use crate::condition::{CompareOp, MetricKind};
use crate::error::Result;
use crate::rule_config::{self, RuleShape, ThresholdConfig};
use crate::{EvalContext, EvaluationResult, RuleHandler};
use async_trait::async_trait;
use evmon_common::types::AlertRule;
use evmon_metrics::MetricsBucket;

/// One metric against one threshold.
pub struct SimpleThresholdHandler;

#[async_trait]
impl RuleHandler for SimpleThresholdHandler {
    fn name(&self) -> &'static str {
        "simple_threshold"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, rule: &AlertRule) -> bool {
        RuleShape::of(rule) == RuleShape::Simple
    }

    async fn evaluate(
        &self,
        rule: &AlertRule,
        bucket: &MetricsBucket,
        ctx: &EvalContext<'_>,
    ) -> Result<Option<EvaluationResult>> {
        let cfg: ThresholdConfig = rule_config::parse(rule)?;
        let metric: MetricKind = cfg.metric_type.parse()?;
        let op: CompareOp = cfg.condition.parse()?;
        let threshold = rule_config::require_threshold(cfg.threshold_value)?;

        let min_events = cfg.min_events_to_evaluate.unwrap_or(1);
        if bucket.total_events < min_events {
            tracing::debug!(
                rule_id = %rule.id,
                events = bucket.total_events,
                min_events,
                "too few events to evaluate"
            );
            return Ok(None);
        }

        let Some(value) = metric.extract(bucket, ctx.key.window_minutes) else {
            tracing::debug!(rule_id = %rule.id, metric = %cfg.metric_type, "no signal for metric");
            return Ok(None);
        };

        if !op.check(value, threshold) {
            return Ok(None);
        }
        Ok(Some(EvaluationResult {
            current_value: value,
            threshold,
            details: format!("{}: {value:.2} {op} {threshold}", cfg.metric_type),
        }))
    }
}
