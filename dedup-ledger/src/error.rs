//! Error types for the dedup ledger.

use thiserror::Error;

/// Result type for ledger operations
pub type DedupResult<T> = Result<T, DedupError>;

/// Errors that can occur while checking or recording processed messages
#[derive(Error, Debug)]
pub enum DedupError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Consumer group validation failed (empty, too long)
    #[error("Invalid consumer group: {0}")]
    InvalidConsumerGroup(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DedupError {
    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Database(sqlx_err) => {
                matches!(
                    sqlx_err,
                    sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
                )
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(DedupError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(DedupError::Database(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn validation_and_row_errors_are_not_transient() {
        assert!(!DedupError::InvalidConsumerGroup("empty".to_string()).is_transient());
        assert!(!DedupError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!DedupError::Other(anyhow::anyhow!("handler failed")).is_transient());
    }
}
