//! PostgreSQL backend.
//!
//! The claim uses `FOR UPDATE SKIP LOCKED` inside a CTE feeding an
//! `UPDATE … RETURNING`, so candidate rows are locked, leased and returned
//! by a single statement: a concurrent claimer either sees the lease or
//! skips the locked row, and never blocks.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::event::{DeadLetterEvent, DeliveryMetadata, OutboxEvent};
use crate::store::{
    ClaimStrategy, EventFilter, EventStore, FailureDisposition, Page, SortDirection,
};

const EVENT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, \
     correlation_id, created_at, sent_at, in_progress_until, permanent_failure_count, \
     last_error, delivery_partition, delivery_offset, delivery_timestamp";

/// SQLx-based event store over PostgreSQL.
pub struct PgEventStore {
    pool: PgPool,
    lease: ChronoDuration,
}

impl PgEventStore {
    /// Create a store with the given pool and claim-lease duration.
    pub fn new(pool: PgPool, lease_duration: Duration) -> Self {
        Self {
            pool,
            lease: ChronoDuration::milliseconds(lease_duration.as_millis() as i64),
        }
    }

    /// Insert a new event inside the caller's transaction.
    ///
    /// Must run in the same transaction as the business mutation; that
    /// atomicity is the point of the pattern.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                correlation_id,
                created_at,
                sent_at,
                in_progress_until,
                permanent_failure_count,
                last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.correlation_id)
        .bind(event.created_at)
        .bind(event.sent_at)
        .bind(event.in_progress_until)
        .bind(event.permanent_failure_count)
        .bind(&event.last_error)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }

    fn map_event(row: &PgRow) -> Result<OutboxEvent, sqlx::Error> {
        let partition: Option<i32> = row.try_get("delivery_partition")?;
        let offset: Option<i64> = row.try_get("delivery_offset")?;
        let timestamp: Option<DateTime<Utc>> = row.try_get("delivery_timestamp")?;
        let delivery = match (partition, offset, timestamp) {
            (Some(partition), Some(offset), Some(timestamp)) => Some(DeliveryMetadata {
                partition,
                offset,
                timestamp,
            }),
            _ => None,
        };

        Ok(OutboxEvent {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            in_progress_until: row.try_get("in_progress_until")?,
            permanent_failure_count: row.try_get("permanent_failure_count")?,
            last_error: row.try_get("last_error")?,
            delivery,
        })
    }
}

#[async_trait]
impl ClaimStrategy for PgEventStore {
    async fn claim(&self, now: DateTime<Utc>, batch_size: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let lease_until = now + self.lease;

        let rows = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM outbox_events
                WHERE sent_at IS NULL
                  AND (in_progress_until IS NULL OR in_progress_until < $1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events AS o
            SET in_progress_until = $3
            FROM candidate
            WHERE o.id = candidate.id
            RETURNING o.id, o.aggregate_type, o.aggregate_id, o.event_type, o.payload,
                      o.correlation_id, o.created_at, o.sent_at, o.in_progress_until,
                      o.permanent_failure_count, o.last_error, o.delivery_partition,
                      o.delivery_offset, o.delivery_timestamp
            "#,
        )
        .bind(now)
        .bind(batch_size)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim outbox events")?;

        let mut events: Vec<OutboxEvent> = rows
            .iter()
            .map(Self::map_event)
            .collect::<Result<_, _>>()
            .context("Failed to parse claimed events")?;

        // UPDATE … RETURNING does not promise row order
        events.sort_by_key(|e| e.created_at);

        debug!(count = events.len(), "Claimed outbox events");

        Ok(events)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn mark_sent(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        delivery: Option<DeliveryMetadata>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET sent_at = $2,
                in_progress_until = NULL,
                delivery_partition = $3,
                delivery_offset = $4,
                delivery_timestamp = $5
            WHERE id = $1
              AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(delivery.map(|d| d.partition))
        .bind(delivery.map(|d| d.offset))
        .bind(delivery.map(|d| d.timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to mark event as sent")?;

        // Zero rows means a concurrent reclaim already delivered the event
        // after this poller's lease expired; the guard keeps sent_at a
        // one-shot transition.
        if result.rows_affected() == 0 {
            warn!(event_id = %id, "Event already sent or gone when marking as sent");
        }

        Ok(())
    }

    async fn record_transient_failure(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET last_error = $2
            WHERE id = $1
              AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to record transient failure")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }

        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        ceiling: i32,
    ) -> OutboxResult<FailureDisposition> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin permanent-failure transaction")?;

        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET permanent_failure_count = permanent_failure_count + 1,
                last_error = $2,
                in_progress_until = NULL
            WHERE id = $1
              AND sent_at IS NULL
            RETURNING permanent_failure_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to record permanent failure")?;

        let failure_count: i32 = match row {
            Some(row) => row.try_get("permanent_failure_count")?,
            None => return Err(OutboxError::EventNotFound(id)),
        };

        if failure_count < ceiling {
            tx.commit()
                .await
                .context("Failed to commit permanent-failure transaction")?;
            return Ok(FailureDisposition::Retrying { failure_count });
        }

        sqlx::query(
            r#"
            INSERT INTO outbox_dead_letter_events (
                id, aggregate_type, aggregate_id, event_type, payload,
                correlation_id, created_at, permanent_failure_count,
                final_error, failed_at
            )
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   correlation_id, created_at, permanent_failure_count,
                   $2, $3
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to copy event into dead-letter store")?;

        sqlx::query("DELETE FROM outbox_events WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete dead-lettered event from live store")?;

        tx.commit()
            .await
            .context("Failed to commit dead-letter transaction")?;

        warn!(
            event_id = %id,
            failure_count,
            ceiling,
            "Event moved to dead-letter store"
        );

        Ok(FailureDisposition::DeadLettered)
    }

    async fn mark_unsent(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET sent_at = NULL,
                in_progress_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as unsent")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }

        debug!(event_id = %id, "Event marked unsent");

        Ok(())
    }

    async fn list(&self, filter: &EventFilter, page: &Page) -> OutboxResult<Vec<OutboxEvent>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE TRUE"
        ));

        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(aggregate_type) = &filter.aggregate_type {
            qb.push(" AND aggregate_type = ").push_bind(aggregate_type);
        }
        if let Some(aggregate_id) = filter.aggregate_id {
            qb.push(" AND aggregate_id = ").push_bind(aggregate_id);
        }
        if filter.pending_only {
            qb.push(" AND sent_at IS NULL");
        }

        // Sort column comes from a closed enum, never from user input
        qb.push(" ORDER BY ").push(page.sort.column());
        qb.push(match page.direction {
            SortDirection::Ascending => " ASC",
            SortDirection::Descending => " DESC",
        });
        qb.push(" LIMIT ").push_bind(page.limit);
        qb.push(" OFFSET ").push_bind(page.offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list outbox events")?;

        let events = rows
            .iter()
            .map(Self::map_event)
            .collect::<Result<_, _>>()
            .context("Failed to parse listed events")?;

        Ok(events)
    }

    async fn archive_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        // Single statement: delete-and-insert through a CTE so the pass is
        // all-or-nothing.
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM outbox_events
                WHERE sent_at IS NOT NULL
                  AND sent_at < $1
                RETURNING id, aggregate_type, aggregate_id, event_type, payload,
                          correlation_id, created_at, sent_at, delivery_partition,
                          delivery_offset, delivery_timestamp
            )
            INSERT INTO outbox_archive_events (
                id, aggregate_type, aggregate_id, event_type, payload,
                correlation_id, created_at, sent_at, archived_at,
                delivery_partition, delivery_offset, delivery_timestamp
            )
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   correlation_id, created_at, sent_at, $2,
                   delivery_partition, delivery_offset, delivery_timestamp
            FROM moved
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to archive sent events")?;

        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, limit: i64) -> OutboxResult<Vec<DeadLetterEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   correlation_id, created_at, permanent_failure_count,
                   final_error, failed_at
            FROM outbox_dead_letter_events
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch dead-letter events")?;

        let events = rows
            .iter()
            .map(|row| {
                Ok(DeadLetterEvent {
                    id: row.try_get("id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    correlation_id: row.try_get("correlation_id")?,
                    created_at: row.try_get("created_at")?,
                    permanent_failure_count: row.try_get("permanent_failure_count")?,
                    final_error: row.try_get("final_error")?,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse dead-letter events")?;

        Ok(events)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_type, aggregate_id, event_type, payload,
                correlation_id, created_at, sent_at, in_progress_until,
                permanent_failure_count, last_error
            )
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   correlation_id, NOW(), NULL, NULL, 0, NULL
            FROM outbox_dead_letter_events
            WHERE id = $1
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to requeue dead-lettered event")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }

        debug!(event_id = %id, "Dead-lettered event requeued");

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE sent_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}
