use async_trait::async_trait;
use evmon_alert::evaluator::AlertSink;
use evmon_common::types::FiredAlert;

/// Writes every fired alert to the log. Stands in for a notification
/// pipeline.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn fire(&self, alert: &FiredAlert) -> anyhow::Result<()> {
        tracing::warn!(
            rule_id = %alert.rule_id,
            rule_name = %alert.rule_name,
            severity = %alert.severity,
            current_value = alert.current_value,
            threshold = alert.threshold,
            details = %alert.details,
            fired_at = %alert.fired_at.to_rfc3339(),
            "ALERT"
        );
        Ok(())
    }
}
