//! Persistence seam for the outbox engine.
//!
//! [`ClaimStrategy`] carries the backend-specific row-claiming discipline;
//! [`EventStore`] carries the rest of the row lifecycle. Backends:
//! [`postgres::PgEventStore`] for production and [`memory::MemoryEventStore`]
//! for tests and embedded use. Both satisfy the identical claim contract:
//! concurrent claims never overlap and never block on each other's
//! in-flight rows.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::event::{DeadLetterEvent, DeliveryMetadata, OutboxEvent};

/// Atomically lease a batch of claimable rows.
#[async_trait]
pub trait ClaimStrategy: Send + Sync {
    /// Claim at most `batch_size` claimable rows, oldest `created_at`
    /// first, setting each row's lease before returning. Rows another
    /// in-flight claim holds are skipped, never waited on.
    async fn claim(&self, now: DateTime<Utc>, batch_size: i64) -> OutboxResult<Vec<OutboxEvent>>;
}

/// Outcome of recording a permanent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still below the ceiling; the row stays live and claimable
    Retrying { failure_count: i32 },
    /// Ceiling reached; the row was copied to the dead-letter store and
    /// deleted from the live table in the same transaction
    DeadLettered,
}

/// Filters for the administrative listing.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub pending_only: bool,
}

/// Whitelisted sort columns for the administrative listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    EventType,
    AggregateType,
}

impl SortField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::EventType => "event_type",
            Self::AggregateType => "aggregate_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Paging and ordering for the administrative listing.
#[derive(Debug, Clone)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
    pub sort: SortField,
    pub direction: SortDirection,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            sort: SortField::CreatedAt,
            direction: SortDirection::Ascending,
        }
    }
}

/// Lifecycle operations over the outbox tables.
///
/// Rows are mutated only through these operations: the dispatcher drives
/// the lease/terminal/failure fields, the archival job relocates terminal
/// rows, and the administrative surface resets them.
#[async_trait]
pub trait EventStore: ClaimStrategy {
    /// Record terminal delivery: set `sent_at`, clear the lease, keep the
    /// broker's delivery coordinates for the archival job.
    async fn mark_sent(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        delivery: Option<DeliveryMetadata>,
    ) -> OutboxResult<()>;

    /// Record a transient failure. The failure counter is untouched and
    /// the lease is left in place; the row becomes claimable again at
    /// lease expiry.
    async fn record_transient_failure(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Record a permanent failure: increment the counter, clear the lease
    /// so the row is immediately claimable, and dead-letter the row in the
    /// same transaction once the post-increment count reaches `ceiling`.
    async fn record_permanent_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        ceiling: i32,
    ) -> OutboxResult<FailureDisposition>;

    /// Administrative reset: clear `sent_at` and any lease so the row is
    /// claimable again.
    async fn mark_unsent(&self, id: Uuid) -> OutboxResult<()>;

    /// Administrative listing with filters, paging and whitelisted sorting.
    async fn list(&self, filter: &EventFilter, page: &Page) -> OutboxResult<Vec<OutboxEvent>>;

    /// Relocate every row with `sent_at` earlier than `cutoff` into the
    /// archive table and delete it from the live table, atomically.
    /// Returns the number of rows archived. Never touches unsent rows.
    async fn archive_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<u64>;

    /// Most recent dead-lettered events.
    async fn dead_letters(&self, limit: i64) -> OutboxResult<Vec<DeadLetterEvent>>;

    /// Re-enqueue a dead-lettered event as a fresh pending row with reset
    /// counters. The dead-letter record itself stays in place.
    async fn requeue_dead_letter(&self, id: Uuid) -> OutboxResult<()>;

    /// Pending count and oldest pending age in seconds (0 when none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}
