//! Error types for the outbox engine.

use thiserror::Error;
use uuid::Uuid;

use crate::publisher::PublishError;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event not found in the live store
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    /// Routing rule for an event type could not be parsed
    #[error("Invalid routing rule for event type '{event_type}': {reason}")]
    InvalidRoutingRule { event_type: String, reason: String },

    /// A routing rule names a cluster no publisher is configured for
    #[error("Routing rule for event type '{event_type}' references unknown cluster '{cluster}'")]
    UnknownCluster { event_type: String, cluster: String },

    /// Malformed configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to publish an event to a broker cluster
    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
