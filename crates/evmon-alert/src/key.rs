use crate::error::Result;
use crate::rule_config::{self, RuleScope};
use evmon_common::types::AlertRule;
use evmon_metrics::MetricsFilter;

/// What a rule needs fetched: window length plus the optional source and
/// event-type filters. Rules with equal keys share one metrics read per
/// evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvaluationKey {
    pub window_minutes: u32,
    pub source_filter: Option<Vec<String>>,
    pub event_type_filter: Option<Vec<String>>,
}

impl EvaluationKey {
    /// Empty filter lists are treated as no filter.
    pub fn new(
        window_minutes: u32,
        source_filter: Option<Vec<String>>,
        event_type_filter: Option<Vec<String>>,
    ) -> Self {
        Self {
            window_minutes: window_minutes.max(1),
            source_filter: source_filter.filter(|s| !s.is_empty()),
            event_type_filter: event_type_filter.filter(|t| !t.is_empty()),
        }
    }

    pub fn global(window_minutes: u32) -> Self {
        Self::new(window_minutes, None, None)
    }

    /// Key for `rule`. The window defaults to `max_window` and is capped
    /// there, since older buckets have already expired.
    pub fn from_rule(rule: &AlertRule, max_window: u32) -> Result<Self> {
        let scope: RuleScope = rule_config::parse(rule)?;
        Ok(Self::from_scope(&scope, max_window))
    }

    pub fn from_scope(scope: &RuleScope, max_window: u32) -> Self {
        let window = scope
            .time_window_minutes
            .unwrap_or(max_window)
            .min(max_window);
        Self::new(
            window,
            scope.source_filter.clone(),
            scope.event_type_filter.clone(),
        )
    }

    /// Same window, with each filter replaced when `Some` and inherited
    /// otherwise.
    ///
    /// Filters are merged independently, so an event type override under
    /// an inherited source filter has no effect on [`filter`](Self::filter):
    /// sources still win.
    pub fn with_overrides(
        &self,
        source_filter: Option<&Vec<String>>,
        event_type_filter: Option<&Vec<String>>,
    ) -> Self {
        Self::new(
            self.window_minutes,
            source_filter.cloned().or_else(|| self.source_filter.clone()),
            event_type_filter
                .cloned()
                .or_else(|| self.event_type_filter.clone()),
        )
    }

    /// The store filter this key reads with; sources take precedence.
    pub fn filter(&self) -> MetricsFilter {
        MetricsFilter::from_parts(self.source_filter.clone(), self.event_type_filter.clone())
    }

    pub fn is_global(&self) -> bool {
        self.source_filter.is_none() && self.event_type_filter.is_none()
    }
}

impl std::fmt::Display for EvaluationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window={}min", self.window_minutes)?;
        if let Some(s) = &self.source_filter {
            write!(f, ", sources={}", s.join(","))?;
        }
        if let Some(t) = &self.event_type_filter {
            write!(f, ", types={}", t.join(","))?;
        }
        if self.is_global() {
            write!(f, ", global")?;
        }
        Ok(())
    }
}
