//! Administrative surface: inspection and recovery tooling over the event
//! store, intended for operators rather than the hot path.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::archive::Archiver;
use crate::error::OutboxResult;
use crate::event::{DeadLetterEvent, OutboxEvent};
use crate::store::{EventFilter, EventStore, Page};

/// Operator-facing operations over an event store.
pub struct AdminService<S: EventStore> {
    store: Arc<S>,
    archiver: Archiver<S>,
}

impl<S: EventStore> AdminService<S> {
    pub fn new(store: Arc<S>) -> Self {
        // Out-of-band passes always carry an explicit retention, so the
        // archiver's configured retention stays disabled.
        let archiver = Archiver::new(Arc::clone(&store), 0, Duration::from_secs(86_400));
        Self { store, archiver }
    }

    /// List events with optional filters, paging and whitelisted sorting.
    pub async fn list_events(
        &self,
        filter: &EventFilter,
        page: &Page,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        self.store.list(filter, page).await
    }

    /// Most recent dead-lettered events.
    pub async fn dead_letters(&self, limit: i64) -> OutboxResult<Vec<DeadLetterEvent>> {
        self.store.dead_letters(limit).await
    }

    /// Re-enqueue a sent event by clearing `sent_at` and any lease.
    pub async fn mark_unsent(&self, id: Uuid) -> OutboxResult<()> {
        self.store.mark_unsent(id).await?;
        info!(event_id = %id, "Event marked unsent by operator");
        Ok(())
    }

    /// Re-enqueue a dead-lettered event as a fresh pending row; the
    /// dead-letter record stays in place.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> OutboxResult<()> {
        self.store.requeue_dead_letter(id).await?;
        info!(event_id = %id, "Dead-lettered event requeued by operator");
        Ok(())
    }

    /// Out-of-band archival pass with an explicit retention override,
    /// delegated to [`Archiver::run_once`]. Returns the number of rows
    /// archived; a non-positive retention is a no-op.
    pub async fn run_archival(&self, retention_days: i64) -> OutboxResult<u64> {
        let count = self.archiver.run_once(Some(retention_days)).await?;
        info!(
            archived_count = count,
            retention_days, "Out-of-band archival pass completed"
        );
        Ok(count)
    }
}
