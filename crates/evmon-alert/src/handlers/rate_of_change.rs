use crate::condition::{ChangeMetric, CompareOp};
use crate::error::{AlertError, Result};
use crate::rule_config::{self, RateOfChangeConfig, RuleShape};
use crate::{EvalContext, EvaluationResult, RuleHandler};
use async_trait::async_trait;
use evmon_common::types::AlertRule;
use evmon_metrics::MetricsBucket;

/// Percent change reported when the previous window was zero and the
/// current one is not.
pub const SPIKE_FROM_ZERO_PERCENT: f64 = 999.0;

/// Percent change of a base metric between the previous and the current
/// window of equal length.
pub struct RateOfChangeHandler;

/// Percent change from `previous` to `current`.
///
/// # Examples
///
/// ```
/// use evmon_alert::handlers::rate_of_change::percent_change;
///
/// assert_eq!(percent_change(150.0, 100.0), 50.0);
/// assert_eq!(percent_change(5.0, 0.0), 999.0);
/// assert_eq!(percent_change(0.0, 0.0), 0.0);
/// ```
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current > 0.0 {
            SPIKE_FROM_ZERO_PERCENT
        } else {
            0.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}

#[async_trait]
impl RuleHandler for RateOfChangeHandler {
    fn name(&self) -> &'static str {
        "rate_of_change"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn can_handle(&self, rule: &AlertRule) -> bool {
        RuleShape::of(rule) == RuleShape::RateOfChange
    }

    async fn evaluate(
        &self,
        rule: &AlertRule,
        bucket: &MetricsBucket,
        ctx: &EvalContext<'_>,
    ) -> Result<Option<EvaluationResult>> {
        let cfg: RateOfChangeConfig = rule_config::parse(rule)?;
        let change = ChangeMetric::parse(&cfg.metric_type)
            .ok_or_else(|| AlertError::UnknownMetric(cfg.metric_type.clone()))?;
        let op: CompareOp = cfg.condition.parse()?;
        let threshold = rule_config::require_threshold(cfg.threshold_value)?;
        let window = ctx.key.window_minutes;

        let previous_bucket = ctx
            .reader
            .previous_window(window, &ctx.key.filter(), ctx.now)
            .await;

        let base = change.base();
        let current = base.extract(bucket, window).unwrap_or(0.0);
        let previous = base.extract(&previous_bucket, window).unwrap_or(0.0);
        let pct = percent_change(current, previous);

        if !op.check(pct, threshold) {
            return Ok(None);
        }

        let details = if previous == 0.0 && current > 0.0 {
            format!("{change}: SPIKE DETECTED (0 → {current:.2})")
        } else {
            let arrow = if pct >= 0.0 { "↑" } else { "↓" };
            format!(
                "{change}: {:.1}% {arrow} ({previous:.2} → {current:.2}) {op} {threshold}%",
                pct.abs()
            )
        };
        Ok(Some(EvaluationResult {
            current_value: pct,
            threshold,
            details,
        }))
    }
}
