//! Error taxonomy for the ingestion service
//!
//! Database errors are split into transient and permanent at the point
//! where sqlx surfaces them; everything downstream (retry policy,
//! breaker, supervisor) acts on that classification rather than
//! re-inspecting error strings.

use thiserror::Error;

use crate::retry::Retryable;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Database error, pre-classified for retry and breaker handling.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// Connection resets, pool exhaustion, serialization failures,
    /// deadlocks. Worth retrying; counted against the breaker once the
    /// retry budget is exhausted.
    #[error("transient database error: {message}")]
    Transient { message: String },

    /// Constraint violations outside the upsert, schema errors,
    /// authentication failures. Retrying cannot help; the supervisor
    /// shuts the service down.
    #[error("permanent database error: {message}")]
    Permanent { message: String },
}

impl DbError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Classify an sqlx error.
    ///
    /// SQLSTATE classes 08 (connection), 40 (serialization/deadlock),
    /// 53 (insufficient resources) and 57 (operator intervention) are
    /// transient; 23 (integrity), 28 (authentication), 42 (syntax or
    /// access) and 3D/3F (bad catalog/schema) are permanent. Unknown
    /// states default to permanent so that misconfigurations surface
    /// loudly instead of retrying forever.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                Self::transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                let transient = db
                    .code()
                    .map(|code| {
                        code.starts_with("08")
                            || code == "40001"
                            || code == "40P01"
                            || code.starts_with("53")
                            || code.starts_with("57")
                    })
                    .unwrap_or(false);
                if transient {
                    Self::transient(err.to_string())
                } else {
                    Self::permanent(err.to_string())
                }
            }
            _ => Self::permanent(err.to_string()),
        }
    }
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        matches!(self, DbError::Transient { .. })
    }
}

/// Top-level service error.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Broker poll or client failure
    #[error("broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    /// Offset commit failure. Double ingestion is tolerable, commit
    /// loss is not, so this is always fatal.
    #[error("offset commit failed: {0}")]
    OffsetCommit(String),

    #[error(transparent)]
    Database(#[from] DbError),

    /// Startup precondition failure (exit code 2)
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("metrics server error: {0}")]
    Metrics(String),

    /// Shutdown was requested; not a failure
    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether the error must take the process down.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::OffsetCommit(_)
            | IngestError::Database(DbError::Permanent { .. })
            | IngestError::Startup(_)
            | IngestError::Metrics(_)
            | IngestError::Internal(_) => true,
            IngestError::Database(DbError::Transient { .. })
            | IngestError::Broker(_)
            | IngestError::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = DbError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::from_sqlx(sqlx::Error::Io(io));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        let err = DbError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fatality() {
        assert!(IngestError::OffsetCommit("broker gone".into()).is_fatal());
        assert!(IngestError::Database(DbError::permanent("bad schema")).is_fatal());
        assert!(!IngestError::Database(DbError::transient("deadlock")).is_fatal());
        assert!(!IngestError::Cancelled.is_fatal());
    }
}
