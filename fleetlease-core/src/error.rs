use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A store round trip failed; the surrounding transaction was rolled back.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Telemetry store error: {0}")]
    Telemetry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected before touching the pool: the pool must never go empty
    /// because a refresh produced nothing.
    #[error("Refusing to replace the proxy pool with an empty candidate set")]
    EmptyProxyReplacement,

    #[error("Proxy refresh already in progress")]
    RefreshInProgress,

    #[error("Proxy source failed: {0}")]
    ProxySource(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True for failures of the backing store (as opposed to rejected input
    /// or invariant guards).
    pub fn is_transactional(&self) -> bool {
        matches!(self, CoreError::Database(_))
    }
}

#[cfg(feature = "redis-telemetry")]
impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Telemetry(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
