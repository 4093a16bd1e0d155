/// Errors raised by the metrics cache, the bucket store and the cold store.
///
/// Reads through [`crate::MetricsReader`] never surface these; they are
/// logged and the affected bucket contributes nothing.
///
/// # Examples
///
/// ```rust
/// use evmon_metrics::error::MetricsError;
///
/// let err = MetricsError::WrongType { key: "evmon:bucket:60".to_string() };
/// assert!(err.to_string().contains("evmon:bucket:60"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The Redis connection or command failed.
    #[error("Metrics: Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key holds a value of a different kind than the operation expects.
    #[error("Metrics: key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    #[error("Metrics: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Breakdown columns in the cold store are JSON encoded.
    #[error("Metrics: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
