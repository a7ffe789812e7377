use http::StatusCode;
use thiserror::Error;

/// Errors raised by the cache engine and its adapters.
///
/// Population and refresh failures never escape to unrelated requests: the
/// store logs them, removes the affected entry, and answers the waiting
/// callers with a generic failure response.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("upstream returned an empty body")]
    EmptyUpstreamResponse,

    #[error("upstream returned non-success status {0}")]
    NonSuccessStatus(StatusCode),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("adapter read failed: {0}")]
    AdapterRead(String),

    #[error("adapter write failed: {0}")]
    AdapterWrite(String),

    #[error("serialized entry is {size} bytes, backend maximum is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed cache envelope: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[cfg(feature = "redis-adapter")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl CacheError {
    /// Returns `true` for failures that come from the upstream fetch rather
    /// than from the adapter or the envelope codec.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            CacheError::EmptyUpstreamResponse
                | CacheError::NonSuccessStatus(_)
                | CacheError::UpstreamTransport(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}
