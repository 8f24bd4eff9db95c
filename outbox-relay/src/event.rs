//! Data model for the outbox tables.
//!
//! One row per emitted domain event plus the two terminal snapshot forms:
//! dead-lettered (exhausted permanent retries) and archived (sent and past
//! retention).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker-side delivery coordinates captured when a publish is acknowledged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// An event stored in the outbox table.
///
/// Rows are created within the writing service's database transaction,
/// alongside the business mutation, and are mutated only by the dispatcher
/// (lease, terminal, failure fields) or by an administrative mark-unsent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Type of aggregate this event relates to (e.g., "order", "payment")
    pub aggregate_type: String,

    /// ID of the entity this event relates to
    pub aggregate_id: Uuid,

    /// Fully qualified event type, the routing key (e.g., "order.created")
    pub event_type: String,

    /// Event payload as JSON, opaque to the engine
    pub payload: serde_json::Value,

    /// Correlation id carried into broker headers and the consumer-side
    /// dedup ledger
    pub correlation_id: Uuid,

    /// Timestamp when the event was created, immutable after insert
    pub created_at: DateTime<Utc>,

    /// Timestamp of terminal delivery (None = not yet sent)
    pub sent_at: Option<DateTime<Utc>>,

    /// Lease expiry; None when unclaimed. A row is claimable iff `sent_at`
    /// is None and the lease is absent or expired.
    pub in_progress_until: Option<DateTime<Utc>>,

    /// Number of permanent-category publish failures recorded so far
    pub permanent_failure_count: i32,

    /// Last error message from a failed publish attempt
    pub last_error: Option<String>,

    /// Broker delivery coordinates recorded at mark-sent, preserved by the
    /// archival job
    pub delivery: Option<DeliveryMetadata>,
}

impl OutboxEvent {
    /// Build a fresh pending event.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            correlation_id,
            created_at: Utc::now(),
            sent_at: None,
            in_progress_until: None,
            permanent_failure_count: 0,
            last_error: None,
            delivery: None,
        }
    }

    /// Whether this row may be handed out by a claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.sent_at.is_none()
            && self
                .in_progress_until
                .map_or(true, |lease| lease < now)
    }
}

/// Immutable snapshot of an event that exceeded the permanent-retry ceiling.
///
/// Created exactly once per doomed event when the dispatcher quarantines it;
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub permanent_failure_count: i32,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Immutable snapshot of a successfully sent event relocated by the
/// archival job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub delivery: Option<DeliveryMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_event_is_claimable() {
        let event = OutboxEvent::new(
            "order",
            Uuid::new_v4(),
            "order.created",
            serde_json::json!({"total": 42}),
            Uuid::new_v4(),
        );
        assert!(event.is_claimable(Utc::now()));
    }

    #[test]
    fn leased_event_is_not_claimable_until_expiry() {
        let now = Utc::now();
        let mut event = OutboxEvent::new(
            "order",
            Uuid::new_v4(),
            "order.created",
            serde_json::json!({}),
            Uuid::new_v4(),
        );
        event.in_progress_until = Some(now + Duration::seconds(30));
        assert!(!event.is_claimable(now));
        assert!(event.is_claimable(now + Duration::seconds(31)));
    }

    #[test]
    fn sent_event_is_never_claimable() {
        let now = Utc::now();
        let mut event = OutboxEvent::new(
            "order",
            Uuid::new_v4(),
            "order.created",
            serde_json::json!({}),
            Uuid::new_v4(),
        );
        event.sent_at = Some(now);
        assert!(!event.is_claimable(now + Duration::days(1)));
    }
}
