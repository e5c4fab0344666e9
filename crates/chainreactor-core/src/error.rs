//! Error types for the chainreactor pipeline.

use thiserror::Error;

/// Errors that can occur while indexing, projecting, or triggering.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Chain source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out after {ms}ms during {operation}")]
    Timeout { operation: String, ms: u64 },

    #[error("No common ancestor within {lookback} blocks for block {hash} at height {height}")]
    ReorgDepthExceeded {
        height: u64,
        hash: String,
        lookback: u64,
    },

    #[error("Reconciler halted, recovery required: {reason}")]
    Halted { reason: String },

    #[error("Cursor version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ReactorError {
    /// Returns `true` if the operation can be retried from durable state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Source(_) | Self::Storage(_) | Self::Timeout { .. } | Self::VersionConflict { .. }
        )
    }

    /// Returns `true` if the error requires operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReorgDepthExceeded { .. } | Self::Halted { .. })
    }
}

impl From<serde_json::Error> for ReactorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Run `fut` with a deadline, mapping expiry to [`ReactorError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, ms: u64, fut: F) -> Result<T, ReactorError>
where
    F: std::future::Future<Output = Result<T, ReactorError>>,
{
    match tokio::time::timeout(std::time::Duration::from_millis(ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(ReactorError::Timeout {
            operation: operation.to_string(),
            ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ReactorError::Storage("busy".into()).is_transient());
        assert!(ReactorError::VersionConflict { expected: 1, found: 2 }.is_transient());
        assert!(!ReactorError::Halted { reason: "x".into() }.is_transient());
        assert!(ReactorError::Halted { reason: "x".into() }.is_fatal());
        assert!(!ReactorError::Decode("bad".into()).is_fatal());
    }

    #[tokio::test]
    async fn timeout_maps_to_error() {
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok::<_, ReactorError>(1)
        };
        let err = with_timeout("slow op", 10, slow).await.unwrap_err();
        assert!(matches!(err, ReactorError::Timeout { ms: 10, .. }));
    }
}
