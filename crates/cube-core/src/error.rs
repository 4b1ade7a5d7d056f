use thiserror::Error;

/// Errors raised anywhere in the cube cache proxy.
///
/// Payloads are plain strings so a single failure can be cloned out to every
/// caller waiting on the same cache key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CubeError {
    #[error("Rejected query: {0}")]
    RejectedQuery(String),

    #[error("Source delegation failed: {0}")]
    SourceDelegationFailure(String),

    #[error("Result of {rows} rows exceeds the per-table limit of {limit} rows")]
    CacheCapacityExceeded { rows: usize, limit: usize },

    #[error("Cache was invalidated while the result was being built")]
    InvalidatedDuringBuild,

    #[error("Invalidation probe failed: {0}")]
    InvalidationProbeFailure(String),

    #[error("Snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Snapshot write failed: {0}")]
    SnapshotWriteFailure(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Arrow error: {0}")]
    ArrowError(String),
}

impl CubeError {
    /// Shorthand for building a `RejectedQuery`
    pub fn rejected(reason: impl Into<String>) -> Self {
        CubeError::RejectedQuery(reason.into())
    }

    /// Whether this error is reported back to the requesting client.
    ///
    /// Everything else is operational and only shows up in logs and metrics.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            CubeError::RejectedQuery(_) | CubeError::SourceDelegationFailure(_)
        )
    }
}

impl From<std::io::Error> for CubeError {
    fn from(err: std::io::Error) -> Self {
        CubeError::IoError(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for CubeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        CubeError::ArrowError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_visibility() {
        assert!(CubeError::rejected("DROP TABLE").is_caller_visible());
        assert!(CubeError::SourceDelegationFailure("timeout".into()).is_caller_visible());
        assert!(!CubeError::CacheCapacityExceeded { rows: 10, limit: 5 }.is_caller_visible());
        assert!(!CubeError::SnapshotCorrupt("bad magic".into()).is_caller_visible());
        assert!(!CubeError::InvalidationProbeFailure("down".into()).is_caller_visible());
        assert!(!CubeError::InvalidatedDuringBuild.is_caller_visible());
    }

    #[test]
    fn test_io_conversion() {
        let err: CubeError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CubeError::IoError(ref msg) if msg.contains("gone")));
    }
}
