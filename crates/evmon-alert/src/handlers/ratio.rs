use crate::condition::CompareOp;
use crate::error::Result;
use crate::rule_config::{self, RatioConfig, RuleShape};
use crate::{EvalContext, EvaluationResult, RuleHandler};
use async_trait::async_trait;
use evmon_common::types::AlertRule;
use evmon_metrics::{MetricsBucket, MetricsFilter};

const DEFAULT_MIN_DENOMINATOR: u64 = 5;

/// Ratio of two event types' counts over the rule window, e.g. failed
/// payments per checkout.
pub struct EventRatioHandler;

#[async_trait]
impl RuleHandler for EventRatioHandler {
    fn name(&self) -> &'static str {
        "event_ratio"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn can_handle(&self, rule: &AlertRule) -> bool {
        RuleShape::of(rule) == RuleShape::EventRatio
    }

    fn uses_group_bucket(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        rule: &AlertRule,
        _bucket: &MetricsBucket,
        ctx: &EvalContext<'_>,
    ) -> Result<Option<EvaluationResult>> {
        let cfg: RatioConfig = rule_config::parse(rule)?;
        let op: CompareOp = cfg.condition.parse()?;
        let threshold = rule_config::require_threshold(cfg.threshold_value)?;
        let min_denominator = cfg.min_denominator_events.unwrap_or(DEFAULT_MIN_DENOMINATOR);
        let window = ctx.key.window_minutes;

        let denominator = ctx
            .reader
            .read(window, &MetricsFilter::event_type(&cfg.denominator_event_type), ctx.now)
            .await
            .total_events;
        if denominator < min_denominator.max(1) {
            tracing::debug!(
                rule_id = %rule.id,
                denominator,
                min_denominator,
                "denominator below minimum, ratio not evaluated"
            );
            return Ok(None);
        }
        let numerator = ctx
            .reader
            .read(window, &MetricsFilter::event_type(&cfg.numerator_event_type), ctx.now)
            .await
            .total_events;

        let ratio = numerator as f64 / denominator as f64;
        if !op.check(ratio, threshold) {
            return Ok(None);
        }
        Ok(Some(EvaluationResult {
            current_value: ratio,
            threshold,
            details: format!(
                "EVENT_RATIO: {}/{} = {numerator}/{denominator} = {ratio:.4} {op} {threshold}",
                cfg.numerator_event_type, cfg.denominator_event_type
            ),
        }))
    }
}
