//! In-memory backend.
//!
//! Backs unit tests and embedded single-process deployments. The claim
//! discipline is a mutex-guarded scan that skips leased rows, satisfying
//! the same contract as the SQL backends: disjoint concurrent claims, no
//! blocking on another claimer's rows.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::event::{ArchivedEvent, DeadLetterEvent, DeliveryMetadata, OutboxEvent};
use crate::store::{
    ClaimStrategy, EventFilter, EventStore, FailureDisposition, Page, SortDirection, SortField,
};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, OutboxEvent>,
    dead_letters: Vec<DeadLetterEvent>,
    archive: Vec<ArchivedEvent>,
}

/// Mutex-guarded event store.
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
    lease: ChronoDuration,
}

impl MemoryEventStore {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease: ChronoDuration::milliseconds(lease_duration.as_millis() as i64),
        }
    }

    /// Insert a pending event.
    pub fn insert(&self, event: OutboxEvent) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.events.insert(event.id, event);
    }

    /// Fetch a live row by id.
    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.events.get(&id).cloned()
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archived snapshots, for assertions.
    pub fn archived(&self) -> Vec<ArchivedEvent> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.archive.clone()
    }
}

#[async_trait]
impl ClaimStrategy for MemoryEventStore {
    async fn claim(&self, now: DateTime<Utc>, batch_size: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let mut claimable: Vec<Uuid> = inner
            .events
            .values()
            .filter(|e| e.is_claimable(now))
            .map(|e| e.id)
            .collect();
        claimable.sort_by_key(|id| inner.events[id].created_at);
        claimable.truncate(batch_size.max(0) as usize);

        let lease_until = now + self.lease;
        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let event = inner.events.get_mut(&id).expect("claimable row present");
            event.in_progress_until = Some(lease_until);
            claimed.push(event.clone());
        }

        Ok(claimed)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn mark_sent(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        delivery: Option<DeliveryMetadata>,
    ) -> OutboxResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(event) = inner.events.get_mut(&id) {
            if event.sent_at.is_none() {
                event.sent_at = Some(now);
                event.in_progress_until = None;
                event.delivery = delivery;
            }
        }
        Ok(())
    }

    async fn record_transient_failure(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match inner.events.get_mut(&id) {
            Some(event) if event.sent_at.is_none() => {
                event.last_error = Some(error.to_string());
                Ok(())
            }
            _ => Err(OutboxError::EventNotFound(id)),
        }
    }

    async fn record_permanent_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        ceiling: i32,
    ) -> OutboxResult<FailureDisposition> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let failure_count = match inner.events.get_mut(&id) {
            Some(event) if event.sent_at.is_none() => {
                event.permanent_failure_count += 1;
                event.last_error = Some(error.to_string());
                event.in_progress_until = None;
                event.permanent_failure_count
            }
            _ => return Err(OutboxError::EventNotFound(id)),
        };

        if failure_count < ceiling {
            return Ok(FailureDisposition::Retrying { failure_count });
        }

        let event = inner.events.remove(&id).expect("row present");
        inner.dead_letters.push(DeadLetterEvent {
            id: event.id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            correlation_id: event.correlation_id,
            created_at: event.created_at,
            permanent_failure_count: event.permanent_failure_count,
            final_error: error.to_string(),
            failed_at: now,
        });

        Ok(FailureDisposition::DeadLettered)
    }

    async fn mark_unsent(&self, id: Uuid) -> OutboxResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match inner.events.get_mut(&id) {
            Some(event) => {
                event.sent_at = None;
                event.in_progress_until = None;
                Ok(())
            }
            None => Err(OutboxError::EventNotFound(id)),
        }
    }

    async fn list(&self, filter: &EventFilter, page: &Page) -> OutboxResult<Vec<OutboxEvent>> {
        let inner = self.inner.lock().expect("store mutex poisoned");

        let mut events: Vec<OutboxEvent> = inner
            .events
            .values()
            .filter(|e| {
                filter
                    .event_type
                    .as_ref()
                    .map_or(true, |t| &e.event_type == t)
                    && filter
                        .aggregate_type
                        .as_ref()
                        .map_or(true, |t| &e.aggregate_type == t)
                    && filter.aggregate_id.map_or(true, |id| e.aggregate_id == id)
                    && (!filter.pending_only || e.sent_at.is_none())
            })
            .cloned()
            .collect();

        events.sort_by(|a, b| {
            let ordering = match page.sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::EventType => a.event_type.cmp(&b.event_type),
                SortField::AggregateType => a.aggregate_type.cmp(&b.aggregate_type),
            };
            match page.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });

        let start = (page.offset.max(0) as usize).min(events.len());
        let end = (start + page.limit.max(0) as usize).min(events.len());
        Ok(events[start..end].to_vec())
    }

    async fn archive_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let doomed: Vec<Uuid> = inner
            .events
            .values()
            .filter(|e| e.sent_at.map_or(false, |sent| sent < cutoff))
            .map(|e| e.id)
            .collect();

        for id in &doomed {
            let event = inner.events.remove(id).expect("row present");
            let sent_at = event.sent_at.expect("archived row is sent");
            inner.archive.push(ArchivedEvent {
                id: event.id,
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                event_type: event.event_type,
                payload: event.payload,
                correlation_id: event.correlation_id,
                created_at: event.created_at,
                sent_at,
                archived_at: now,
                delivery: event.delivery,
            });
        }

        Ok(doomed.len() as u64)
    }

    async fn dead_letters(&self, limit: i64) -> OutboxResult<Vec<DeadLetterEvent>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut letters = inner.dead_letters.clone();
        letters.sort_by(|a, b| match b.failed_at.cmp(&a.failed_at) {
            Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        });
        letters.truncate(limit.max(0) as usize);
        Ok(letters)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> OutboxResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let letter = inner
            .dead_letters
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or(OutboxError::EventNotFound(id))?;

        inner.events.entry(id).or_insert_with(|| OutboxEvent {
            id: letter.id,
            aggregate_type: letter.aggregate_type,
            aggregate_id: letter.aggregate_id,
            event_type: letter.event_type,
            payload: letter.payload,
            correlation_id: letter.correlation_id,
            created_at: Utc::now(),
            sent_at: None,
            in_progress_until: None,
            permanent_failure_count: 0,
            last_error: None,
            delivery: None,
        });

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now();
        let pending: Vec<&OutboxEvent> = inner
            .events
            .values()
            .filter(|e| e.sent_at.is_none())
            .collect();
        let age = pending
            .iter()
            .map(|e| (now - e.created_at).num_seconds())
            .max()
            .unwrap_or(0)
            .max(0);
        Ok((pending.len() as i64, age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn event_at(created_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = OutboxEvent::new(
            "order",
            Uuid::new_v4(),
            "order.created",
            serde_json::json!({"n": 1}),
            Uuid::new_v4(),
        );
        event.created_at = created_at;
        event
    }

    #[tokio::test]
    async fn claim_returns_oldest_first_up_to_batch_size() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let oldest = event_at(now - ChronoDuration::minutes(3));
        let middle = event_at(now - ChronoDuration::minutes(2));
        let newest = event_at(now - ChronoDuration::minutes(1));
        let oldest_id = oldest.id;
        let middle_id = middle.id;
        store.insert(newest);
        store.insert(oldest);
        store.insert(middle);

        let claimed = store.claim(now, 2).await.unwrap();
        assert_eq!(
            claimed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![oldest_id, middle_id]
        );
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let now = Utc::now();
        for i in 0..50 {
            store.insert(event_at(now - ChronoDuration::seconds(100 - i)));
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.claim(now, 10).await }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            let claimed = handle.await.unwrap().unwrap();
            for event in claimed {
                assert!(seen.insert(event.id), "row claimed twice: {}", event.id);
                total += 1;
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn claimed_row_is_not_claimable_until_lease_expires() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        store.insert(event_at(now - ChronoDuration::minutes(1)));

        let first = store.claim(now, 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.claim(now, 10).await.unwrap();
        assert!(second.is_empty(), "leased row was reclaimed");

        let after_expiry = now + ChronoDuration::seconds(31);
        let third = store.claim(after_expiry, 10).await.unwrap();
        assert_eq!(third.len(), 1, "expired lease should be reclaimable");
    }

    #[tokio::test]
    async fn sent_at_transitions_at_most_once() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let event = event_at(now - ChronoDuration::minutes(1));
        let id = event.id;
        store.insert(event);

        store.mark_sent(id, now, None).await.unwrap();
        let first_sent = store.get(id).unwrap().sent_at;

        store
            .mark_sent(id, now + ChronoDuration::minutes(5), None)
            .await
            .unwrap();
        assert_eq!(store.get(id).unwrap().sent_at, first_sent);
    }

    #[tokio::test]
    async fn mark_unsent_makes_row_claimable_again() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let event = event_at(now - ChronoDuration::minutes(1));
        let id = event.id;
        store.insert(event);

        store.claim(now, 10).await.unwrap();
        store.mark_sent(id, now, None).await.unwrap();
        assert!(store.claim(now, 10).await.unwrap().is_empty());

        store.mark_unsent(id).await.unwrap();
        let row = store.get(id).unwrap();
        assert!(row.sent_at.is_none());
        assert!(row.in_progress_until.is_none());

        let reclaimed = store.claim(now, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn permanent_failures_dead_letter_at_ceiling() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let event = event_at(now);
        let id = event.id;
        store.insert(event);

        for attempt in 1..3 {
            let disposition = store
                .record_permanent_failure(id, "bad payload", now, 3)
                .await
                .unwrap();
            assert_eq!(
                disposition,
                FailureDisposition::Retrying {
                    failure_count: attempt
                }
            );
            assert!(store.get(id).is_some());
        }

        let disposition = store
            .record_permanent_failure(id, "bad payload", now, 3)
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered);
        assert!(store.get(id).is_none());

        let letters = store.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].permanent_failure_count, 3);
        assert_eq!(letters[0].final_error, "bad payload");
    }

    #[tokio::test]
    async fn transient_failure_keeps_counter_and_lease() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let event = event_at(now - ChronoDuration::minutes(1));
        let id = event.id;
        store.insert(event);

        store.claim(now, 10).await.unwrap();
        store
            .record_transient_failure(id, "broker unavailable")
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.permanent_failure_count, 0);
        assert_eq!(row.last_error.as_deref(), Some("broker unavailable"));
        assert!(row.in_progress_until.is_some(), "lease should survive");
    }

    #[tokio::test]
    async fn archival_respects_retention_boundary_and_skips_unsent() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();

        let mut old_sent = event_at(now - ChronoDuration::days(9));
        old_sent.sent_at = Some(now - ChronoDuration::days(8));
        let old_sent_id = old_sent.id;

        let mut recent_sent = event_at(now - ChronoDuration::days(7));
        recent_sent.sent_at = Some(now - ChronoDuration::days(6));
        let recent_sent_id = recent_sent.id;

        let old_unsent = event_at(now - ChronoDuration::days(30));
        let old_unsent_id = old_unsent.id;

        store.insert(old_sent);
        store.insert(recent_sent);
        store.insert(old_unsent);

        let cutoff = now - ChronoDuration::days(7);
        let archived = store.archive_sent_before(cutoff, now).await.unwrap();
        assert_eq!(archived, 1);

        assert!(store.get(old_sent_id).is_none());
        assert!(store.get(recent_sent_id).is_some());
        assert!(store.get(old_unsent_id).is_some());

        let snapshots = store.archived();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, old_sent_id);
    }

    #[tokio::test]
    async fn requeue_dead_letter_inserts_fresh_row_and_keeps_snapshot() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();
        let event = event_at(now);
        let id = event.id;
        store.insert(event);

        store
            .record_permanent_failure(id, "doomed", now, 1)
            .await
            .unwrap();
        assert!(store.get(id).is_none());

        store.requeue_dead_letter(id).await.unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.permanent_failure_count, 0);
        assert!(row.sent_at.is_none());
        assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let store = MemoryEventStore::new(Duration::from_secs(30));
        let now = Utc::now();

        let mut a = event_at(now - ChronoDuration::minutes(3));
        a.event_type = "order.created".to_string();
        let mut b = event_at(now - ChronoDuration::minutes(2));
        b.event_type = "order.cancelled".to_string();
        let mut c = event_at(now - ChronoDuration::minutes(1));
        c.event_type = "order.created".to_string();
        c.sent_at = Some(now);

        store.insert(a);
        store.insert(b);
        store.insert(c);

        let filter = EventFilter {
            event_type: Some("order.created".to_string()),
            ..Default::default()
        };
        let listed = store.list(&filter, &Page::default()).await.unwrap();
        assert_eq!(listed.len(), 2);

        let pending = EventFilter {
            event_type: Some("order.created".to_string()),
            pending_only: true,
            ..Default::default()
        };
        let listed = store.list(&pending, &Page::default()).await.unwrap();
        assert_eq!(listed.len(), 1);

        let page = Page {
            limit: 1,
            offset: 1,
            sort: SortField::CreatedAt,
            direction: SortDirection::Ascending,
        };
        let listed = store.list(&EventFilter::default(), &page).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
