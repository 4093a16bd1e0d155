pub mod composite;
pub mod rate_of_change;
pub mod ratio;
pub mod threshold;

use crate::RuleHandler;
use evmon_common::types::AlertRule;
use std::sync::Arc;

pub use composite::CompositeHandler;
pub use rate_of_change::RateOfChangeHandler;
pub use ratio::EventRatioHandler;
pub use threshold::SimpleThresholdHandler;

/// Priority-ordered set of handlers.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn RuleHandler>>,
}

impl HandlerRegistry {
    pub fn new(mut handlers: Vec<Arc<dyn RuleHandler>>) -> Self {
        handlers.sort_by_key(|h| h.priority());
        tracing::debug!(
            handlers = ?handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            "handler registry built"
        );
        Self { handlers }
    }

    /// Composite, event ratio, rate of change, then simple threshold.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(SimpleThresholdHandler),
            Arc::new(CompositeHandler),
            Arc::new(EventRatioHandler),
            Arc::new(RateOfChangeHandler),
        ])
    }

    /// The first handler, by priority, that accepts `rule`.
    pub fn find(&self, rule: &AlertRule) -> Option<&Arc<dyn RuleHandler>> {
        self.handlers.iter().find(|h| h.can_handle(rule))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
