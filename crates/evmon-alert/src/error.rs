/// Reasons a single rule cannot be evaluated.
///
/// These never abort an evaluation pass: the evaluator logs them against
/// the rule id and moves on to the next rule.
///
/// # Examples
///
/// ```rust
/// use evmon_alert::error::AlertError;
///
/// let err = AlertError::UnknownMetric("LOAD_AVG".to_string());
/// assert!(err.to_string().contains("LOAD_AVG"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// The rule configuration does not match the shape its handler expects.
    #[error("Alert: invalid rule configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    /// A required configuration field is absent.
    #[error("Alert: rule configuration is missing '{0}'")]
    MissingField(&'static str),

    #[error("Alert: unknown metric type '{0}'")]
    UnknownMetric(String),

    #[error("Alert: unknown condition '{0}'")]
    UnknownCondition(String),

    #[error("Alert: unknown composite operator '{0}'")]
    UnknownOperator(String),

    #[error("Alert: '{field}' of {value} exceeds the maximum of {max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

pub type Result<T> = std::result::Result<T, AlertError>;
