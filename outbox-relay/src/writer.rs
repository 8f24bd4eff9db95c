//! Writer interface for producing services.
//!
//! The write happens inside the caller's transaction so the business
//! mutation and the event row commit or roll back together. Serialization
//! happens before any SQL runs: a bad payload fails the write without
//! inserting a partial row.

use std::sync::Arc;

use serde::Serialize;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::event::OutboxEvent;
use crate::store::postgres::PgEventStore;

/// Outbox writer bound to the production store.
#[derive(Clone)]
pub struct OutboxWriter {
    store: Arc<PgEventStore>,
}

impl OutboxWriter {
    pub fn new(store: Arc<PgEventStore>) -> Self {
        Self { store }
    }

    /// Insert an event inside the caller's transaction. A fresh
    /// correlation id is generated so consumer-side dedup always has a key.
    pub async fn write<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: &T,
    ) -> OutboxResult<OutboxEvent> {
        let event = build_event(aggregate_type, aggregate_id, event_type, payload, None)?;
        self.store.insert(tx, &event).await?;
        Ok(event)
    }

    /// Like [`write`](Self::write) but with an explicit correlation id,
    /// for callers propagating one from an inbound request or message.
    pub async fn write_with_correlation<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: &T,
        correlation_id: Uuid,
    ) -> OutboxResult<OutboxEvent> {
        let event = build_event(
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
            Some(correlation_id),
        )?;
        self.store.insert(tx, &event).await?;
        Ok(event)
    }
}

/// Serialize the payload and assemble a pending event. Fails before any
/// database work when the payload cannot be serialized.
pub(crate) fn build_event<T: Serialize>(
    aggregate_type: &str,
    aggregate_id: Uuid,
    event_type: &str,
    payload: &T,
    correlation_id: Option<Uuid>,
) -> OutboxResult<OutboxEvent> {
    let payload = serde_json::to_value(payload)?;
    Ok(OutboxEvent::new(
        aggregate_type,
        aggregate_id,
        event_type,
        payload,
        correlation_id.unwrap_or_else(Uuid::new_v4),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct OrderPlaced {
        order_id: Uuid,
        total_cents: i64,
    }

    #[test]
    fn build_event_serializes_payload_and_generates_correlation() {
        let aggregate_id = Uuid::new_v4();
        let event = build_event(
            "order",
            aggregate_id,
            "order.placed",
            &OrderPlaced {
                order_id: aggregate_id,
                total_cents: 1299,
            },
            None,
        )
        .unwrap();

        assert_eq!(event.aggregate_type, "order");
        assert_eq!(event.event_type, "order.placed");
        assert_eq!(event.payload["total_cents"], 1299);
        assert!(event.sent_at.is_none());
        assert_eq!(event.permanent_failure_count, 0);
        assert_ne!(event.correlation_id, Uuid::nil());
    }

    #[test]
    fn explicit_correlation_id_is_preserved() {
        let correlation = Uuid::new_v4();
        let event = build_event(
            "order",
            Uuid::new_v4(),
            "order.placed",
            &serde_json::json!({"n": 1}),
            Some(correlation),
        )
        .unwrap();
        assert_eq!(event.correlation_id, correlation);
    }

    #[test]
    fn unserializable_payload_fails_without_an_event() {
        let result = build_event(
            "order",
            Uuid::new_v4(),
            "order.placed",
            &f64::NAN,
            None,
        );
        assert!(result.is_err());
    }
}
