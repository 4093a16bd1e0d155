//! Adaptive rule evaluation over the bucketed metrics store.
//!
//! Events only flip a dirty flag and bump the [`monitor::EventRateMonitor`];
//! the [`evaluator::AdaptiveRuleEvaluator`] heartbeat decides when to run a
//! pass, groups rules by [`key::EvaluationKey`] so each group costs one
//! read, and dispatches every rule to the [`RuleHandler`] the
//! [`handlers::HandlerRegistry`] picks for it.

pub mod condition;
pub mod cooldown;
pub mod error;
pub mod evaluator;
pub mod handlers;
pub mod key;
pub mod monitor;
pub mod rule_config;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evmon_common::types::AlertRule;
use evmon_metrics::{MetricsBucket, MetricsReader};

use crate::error::Result;
use crate::key::EvaluationKey;

/// A threshold crossing reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub current_value: f64,
    pub threshold: f64,
    pub details: String,
}

/// What a handler may consult besides the group's bucket.
pub struct EvalContext<'a> {
    /// For handlers that need windows other than the group's own.
    pub reader: &'a dyn MetricsReader,
    /// The key the group bucket was read with.
    pub key: &'a EvaluationKey,
    pub now: DateTime<Utc>,
}

/// One evaluation strategy.
///
/// The registry tries handlers in ascending [`RuleHandler::priority`] and
/// uses the first whose [`RuleHandler::can_handle`] accepts the rule.
#[async_trait]
pub trait RuleHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> i32;

    /// Pure structural check on the rule configuration.
    fn can_handle(&self, rule: &AlertRule) -> bool;

    /// Whether `evaluate` looks at the group bucket at all. Groups whose
    /// rules all answer `false` skip the shared read.
    fn uses_group_bucket(&self) -> bool {
        true
    }

    /// `Ok(None)` means no alert. `Err` means the rule is malformed and is
    /// skipped for this pass.
    async fn evaluate(
        &self,
        rule: &AlertRule,
        bucket: &MetricsBucket,
        ctx: &EvalContext<'_>,
    ) -> Result<Option<EvaluationResult>>;
}
