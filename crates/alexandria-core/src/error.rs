//! Crate Error Taxonomy
//!
//! One error enum for the whole engine, mapped onto the abstract kinds the
//! transport layer needs: Validation, NotFound, Conflict, Upstream, Timeout,
//! Internal, Degraded. Background task handlers consult [`CoreError::is_transient`]
//! to decide between rescheduling with backoff and dead-lettering.

use chrono::Utc;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad input shape or constraint violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Forbidden state transition (taxonomy cycle, duplicate slug, status order)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A gateway failed (fetch, embedding, reranker, trainer)
    #[error("Upstream failure ({source_name}): {message}")]
    Upstream {
        /// Which gateway failed
        source_name: &'static str,
        /// What it reported
        message: String,
        /// Whether the queue should retry with backoff
        transient: bool,
    },

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable code for the transport envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Upstream { .. } => "upstream_error",
            CoreError::Timeout(_) => "timeout",
            CoreError::Database(_) | CoreError::Io(_) | CoreError::Serialization(_) => {
                "internal_error"
            }
            CoreError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status a transport layer should map this to.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 422,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Upstream { .. } => 502,
            CoreError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Whether a background task hitting this error should be rescheduled
    /// with backoff rather than dead-lettered immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Upstream { transient, .. } => *transient,
            CoreError::Timeout(_) => true,
            // SQLITE_BUSY and friends resolve on retry
            CoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
            }
            _ => false,
        }
    }

    /// Normalized envelope for the request boundary: `{detail, error_code, timestamp}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "detail": self.to_string(),
            "error_code": self.error_code(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

/// Failure reported by an external gateway (fetcher, embedder, reranker, trainer).
///
/// Kept separate from [`CoreError`] so gateway implementations do not depend
/// on the engine's error surface; callers lift it with [`CoreError::from_gateway`].
#[derive(Debug, Clone)]
pub struct GatewayError {
    /// Human-readable failure description
    pub message: String,
    /// True when a retry may succeed (network hiccup, model warming up)
    pub transient: bool,
}

impl GatewayError {
    /// A failure worth retrying
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that will not resolve on its own
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

impl CoreError {
    /// Lift a gateway failure into the engine error space.
    pub fn from_gateway(source_name: &'static str, err: GatewayError) -> Self {
        CoreError::Upstream {
            source_name,
            message: err.message,
            transient: err.transient,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CoreError::Validation("x".into()).status_code(), 422);
        assert_eq!(CoreError::NotFound("x".into()).status_code(), 404);
        assert_eq!(CoreError::Conflict("x".into()).status_code(), 409);
        assert_eq!(CoreError::Timeout("x".into()).status_code(), 504);
        assert_eq!(CoreError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_transient_upstream_retries() {
        let err = CoreError::from_gateway("embedding", GatewayError::transient("503"));
        assert!(err.is_transient());

        let err = CoreError::from_gateway("embedding", GatewayError::permanent("bad model"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = CoreError::NotFound("resource abc".into()).to_envelope();
        assert_eq!(envelope["error_code"], "not_found");
        assert!(envelope["detail"].as_str().unwrap().contains("abc"));
        assert!(envelope["timestamp"].is_string());
    }
}
