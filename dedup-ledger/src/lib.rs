//! # Dedup Ledger
//!
//! Consumer-side duplicate suppression backed by a persistent
//! `processed_messages` ledger keyed by `(correlation_id, consumer_group)`.
//!
//! The relay delivers at-least-once: a crash between publish and
//! `mark_sent`, or an expired claim lease, replays the event. Consumers
//! that must not apply an event twice record each correlation id in the
//! ledger and skip replays. The unique key includes the consumer group so
//! independent consumers each process the event once.
//!
//! ## Usage
//!
//! ```ignore
//! use dedup_ledger::{DedupFilter, DedupOutcome, PgMessageLedger};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::PgPool, correlation_id: uuid::Uuid) -> anyhow::Result<()> {
//! let filter = DedupFilter::new(Arc::new(PgMessageLedger::new(pool)));
//!
//! match filter
//!     .check_and_process(correlation_id, "notification-consumer", || async {
//!         // Business logic here
//!         Ok(())
//!     })
//!     .await?
//! {
//!     DedupOutcome::Processed => println!("Processed"),
//!     DedupOutcome::Duplicate => println!("Skipped replay"),
//!     DedupOutcome::ConcurrentDuplicate => println!("Lost an insert race"),
//!     DedupOutcome::Failed(err) => eprintln!("Handler failed: {}", err),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Two consumers in the same group racing on the same correlation id both
//! pass the pre-check, but `INSERT ... ON CONFLICT DO NOTHING` admits only
//! one row. The loser's handler has already run; it reports
//! [`DedupOutcome::ConcurrentDuplicate`] so callers can tell a benign
//! replay from a genuine race (which usually means handlers must stay
//! idempotent themselves, or partition assignment is unstable).
//!
//! Run a periodic [`DedupFilter::purge`] to keep the ledger bounded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod error;
mod metrics;

pub use error::{DedupError, DedupResult};
pub use metrics::DedupMetrics;

/// A processed-message record in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub correlation_id: Uuid,
    pub consumer_group: String,
    pub processed_at: DateTime<Utc>,
}

/// Outcome of a deduplicated processing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Message was processed for the first time
    Processed,

    /// Message was already in the ledger; the handler did not run
    Duplicate,

    /// Handler ran, but a concurrent consumer recorded the message first
    ConcurrentDuplicate,

    /// Handler returned an error; the message was not recorded
    Failed(String),
}

impl DedupOutcome {
    /// True unless the handler itself failed
    pub fn is_ok(&self) -> bool {
        !matches!(self, DedupOutcome::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DedupOutcome::Failed(_))
    }
}

/// Persistent set of processed `(correlation_id, consumer_group)` keys.
#[async_trait]
pub trait MessageLedger: Send + Sync {
    /// Check whether a key is already recorded.
    async fn contains(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool>;

    /// Record a key. Returns `false` if it was already present; a
    /// conflict is an expected outcome, never an error.
    async fn insert(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> DedupResult<bool>;

    /// Remove a key, re-admitting the message for processing. Returns
    /// `false` if the key was not present.
    async fn remove(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool>;

    /// Delete records processed before the cutoff. Returns the number
    /// removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DedupResult<u64>;
}

/// PostgreSQL-backed ledger over the `processed_messages` table.
#[derive(Clone)]
pub struct PgMessageLedger {
    pool: PgPool,
}

impl PgMessageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLedger for PgMessageLedger {
    async fn contains(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_messages
                WHERE correlation_id = $1 AND consumer_group = $2
            ) AS exists
            "#,
        )
        .bind(correlation_id)
        .bind(consumer_group)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check processed-message ledger")?;

        let exists: bool = row.try_get("exists")?;
        Ok(exists)
    }

    async fn insert(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> DedupResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (correlation_id, consumer_group, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (correlation_id, consumer_group) DO NOTHING
            "#,
        )
        .bind(correlation_id)
        .bind(consumer_group)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record processed message")?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_messages
            WHERE correlation_id = $1 AND consumer_group = $2
            "#,
        )
        .bind(correlation_id)
        .bind(consumer_group)
        .execute(&self.pool)
        .await
        .context("Failed to remove processed-message record")?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DedupResult<u64> {
        let result = sqlx::query("DELETE FROM processed_messages WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge processed-message ledger")?;

        Ok(result.rows_affected())
    }
}

/// In-memory ledger for tests and single-process consumers.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<HashMap<(Uuid, String), DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageLedger for MemoryLedger {
    async fn contains(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.contains_key(&(correlation_id, consumer_group.to_string())))
    }

    async fn insert(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> DedupResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (correlation_id, consumer_group.to_string());
        if inner.contains_key(&key) {
            return Ok(false);
        }
        inner.insert(key, now);
        Ok(true)
    }

    async fn remove(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .remove(&(correlation_id, consumer_group.to_string()))
            .is_some())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DedupResult<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.len();
        inner.retain(|_, processed_at| *processed_at >= cutoff);
        Ok((before - inner.len()) as u64)
    }
}

/// Duplicate-suppression filter over a [`MessageLedger`].
///
/// Thread-safe; share across tasks with `Arc<DedupFilter<_>>`.
pub struct DedupFilter<L: MessageLedger> {
    ledger: Arc<L>,
    metrics: Option<DedupMetrics>,
}

impl<L: MessageLedger> DedupFilter<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self {
            ledger,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DedupMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check whether a message was already processed by this group.
    pub async fn is_duplicate(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
    ) -> DedupResult<bool> {
        Self::validate_consumer_group(consumer_group)?;
        self.ledger.contains(correlation_id, consumer_group).await
    }

    /// Record a message as processed. Returns `false` on conflict.
    pub async fn mark_processed(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
    ) -> DedupResult<bool> {
        Self::validate_consumer_group(consumer_group)?;
        let inserted = self
            .ledger
            .insert(correlation_id, consumer_group, Utc::now())
            .await?;

        if inserted {
            debug!(
                correlation_id = %correlation_id,
                consumer_group = %consumer_group,
                "Message recorded in ledger"
            );
        }

        Ok(inserted)
    }

    /// Remove a message record, re-admitting it for processing. Intended
    /// for operator-driven reprocessing after a requeue on the producer
    /// side.
    pub async fn mark_unprocessed(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
    ) -> DedupResult<bool> {
        Self::validate_consumer_group(consumer_group)?;
        let removed = self.ledger.remove(correlation_id, consumer_group).await?;

        if removed {
            info!(
                correlation_id = %correlation_id,
                consumer_group = %consumer_group,
                "Message record removed from ledger"
            );
        }

        Ok(removed)
    }

    /// Run the handler only if the message has not been processed by this
    /// group before.
    ///
    /// Check, process, then record. Two consumers racing on the same key
    /// can both pass the check; only one insert wins, and the loser gets
    /// [`DedupOutcome::ConcurrentDuplicate`] after its handler already
    /// ran. A failed handler leaves no record, so the message stays
    /// eligible for retry.
    pub async fn check_and_process<F, Fut>(
        &self,
        correlation_id: Uuid,
        consumer_group: &str,
        f: F,
    ) -> DedupResult<DedupOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        Self::validate_consumer_group(consumer_group)?;

        if self.ledger.contains(correlation_id, consumer_group).await? {
            debug!(
                correlation_id = %correlation_id,
                consumer_group = %consumer_group,
                "Duplicate message skipped"
            );
            if let Some(metrics) = &self.metrics {
                metrics.duplicates.inc();
            }
            return Ok(DedupOutcome::Duplicate);
        }

        if let Err(e) = f().await {
            warn!(
                correlation_id = %correlation_id,
                consumer_group = %consumer_group,
                error = ?e,
                "Message handler failed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.failures.inc();
            }
            return Ok(DedupOutcome::Failed(e.to_string()));
        }

        let inserted = self
            .ledger
            .insert(correlation_id, consumer_group, Utc::now())
            .await?;

        if inserted {
            if let Some(metrics) = &self.metrics {
                metrics.processed.inc();
            }
            Ok(DedupOutcome::Processed)
        } else {
            warn!(
                correlation_id = %correlation_id,
                consumer_group = %consumer_group,
                "Lost insert race after processing"
            );
            if let Some(metrics) = &self.metrics {
                metrics.concurrent_duplicates.inc();
            }
            Ok(DedupOutcome::ConcurrentDuplicate)
        }
    }

    /// Purge ledger records older than the retention window. Returns the
    /// number removed. Run periodically from a background task.
    pub async fn purge(&self, retention: Duration) -> DedupResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| DedupError::Other(anyhow::anyhow!("Invalid retention: {}", e)))?;

        let purged = self.ledger.purge_older_than(cutoff).await?;

        if purged > 0 {
            info!(purged_count = purged, cutoff = %cutoff, "Purged old ledger records");
            if let Some(metrics) = &self.metrics {
                metrics.purged.inc_by(purged);
            }
        }

        Ok(purged)
    }

    fn validate_consumer_group(consumer_group: &str) -> DedupResult<()> {
        if consumer_group.is_empty() {
            return Err(DedupError::InvalidConsumerGroup(
                "Consumer group cannot be empty".to_string(),
            ));
        }

        if consumer_group.len() > 255 {
            return Err(DedupError::InvalidConsumerGroup(format!(
                "Consumer group too long: {} characters (max 255)",
                consumer_group.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ledger whose pre-check never sees existing keys, forcing the
    /// insert-conflict path that a real concurrent race produces.
    struct RacingLedger {
        inner: MemoryLedger,
    }

    #[async_trait]
    impl MessageLedger for RacingLedger {
        async fn contains(&self, _: Uuid, _: &str) -> DedupResult<bool> {
            Ok(false)
        }

        async fn insert(
            &self,
            correlation_id: Uuid,
            consumer_group: &str,
            now: DateTime<Utc>,
        ) -> DedupResult<bool> {
            self.inner.insert(correlation_id, consumer_group, now).await
        }

        async fn remove(&self, correlation_id: Uuid, consumer_group: &str) -> DedupResult<bool> {
            self.inner.remove(correlation_id, consumer_group).await
        }

        async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DedupResult<u64> {
            self.inner.purge_older_than(cutoff).await
        }
    }

    #[tokio::test]
    async fn first_message_is_processed_and_recorded() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let correlation_id = Uuid::new_v4();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let outcome = filter
            .check_and_process(correlation_id, "group-a", || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, DedupOutcome::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(filter.is_duplicate(correlation_id, "group-a").await.unwrap());
    }

    #[tokio::test]
    async fn replay_is_skipped_without_running_the_handler() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let correlation_id = Uuid::new_v4();

        filter
            .mark_processed(correlation_id, "group-a")
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let outcome = filter
            .check_and_process(correlation_id, "group-a", || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, DedupOutcome::Duplicate);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn groups_deduplicate_independently() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let correlation_id = Uuid::new_v4();

        let outcome_a = filter
            .check_and_process(correlation_id, "group-a", || async { Ok(()) })
            .await
            .unwrap();
        let outcome_b = filter
            .check_and_process(correlation_id, "group-b", || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(outcome_a, DedupOutcome::Processed);
        assert_eq!(outcome_b, DedupOutcome::Processed);
    }

    #[tokio::test]
    async fn failed_handler_leaves_the_message_eligible() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let correlation_id = Uuid::new_v4();

        let outcome = filter
            .check_and_process(correlation_id, "group-a", || async {
                Err(anyhow::anyhow!("downstream unavailable"))
            })
            .await
            .unwrap();

        match outcome {
            DedupOutcome::Failed(msg) => assert!(msg.contains("downstream unavailable")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(!filter.is_duplicate(correlation_id, "group-a").await.unwrap());

        let retry = filter
            .check_and_process(correlation_id, "group-a", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(retry, DedupOutcome::Processed);
    }

    #[tokio::test]
    async fn insert_race_loser_reports_concurrent_duplicate() {
        let filter = DedupFilter::new(Arc::new(RacingLedger {
            inner: MemoryLedger::new(),
        }));
        let correlation_id = Uuid::new_v4();

        let first = filter
            .check_and_process(correlation_id, "group-a", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(first, DedupOutcome::Processed);

        let second = filter
            .check_and_process(correlation_id, "group-a", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(second, DedupOutcome::ConcurrentDuplicate);
    }

    #[tokio::test]
    async fn mark_unprocessed_readmits_a_message() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let correlation_id = Uuid::new_v4();

        filter
            .mark_processed(correlation_id, "group-a")
            .await
            .unwrap();
        assert!(filter
            .mark_unprocessed(correlation_id, "group-a")
            .await
            .unwrap());
        assert!(!filter.is_duplicate(correlation_id, "group-a").await.unwrap());

        assert!(!filter
            .mark_unprocessed(correlation_id, "group-a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_records() {
        let ledger = Arc::new(MemoryLedger::new());
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        ledger
            .insert(old, "group-a", Utc::now() - chrono::Duration::days(10))
            .await
            .unwrap();
        ledger
            .insert(fresh, "group-a", Utc::now())
            .await
            .unwrap();

        let filter = DedupFilter::new(Arc::clone(&ledger));
        let purged = filter.purge(Duration::from_secs(7 * 86_400)).await.unwrap();

        assert_eq!(purged, 1);
        assert!(!ledger.contains(old, "group-a").await.unwrap());
        assert!(ledger.contains(fresh, "group-a").await.unwrap());
    }

    #[tokio::test]
    async fn empty_consumer_group_is_rejected() {
        let filter = DedupFilter::new(Arc::new(MemoryLedger::new()));
        let result = filter.is_duplicate(Uuid::new_v4(), "").await;
        assert!(matches!(result, Err(DedupError::InvalidConsumerGroup(_))));

        let long_group = "x".repeat(256);
        let result = filter.is_duplicate(Uuid::new_v4(), &long_group).await;
        assert!(matches!(result, Err(DedupError::InvalidConsumerGroup(_))));
    }

    #[test]
    fn outcome_helpers() {
        assert!(DedupOutcome::Processed.is_ok());
        assert!(DedupOutcome::Duplicate.is_ok());
        assert!(DedupOutcome::ConcurrentDuplicate.is_ok());
        assert!(!DedupOutcome::Failed("error".to_string()).is_ok());
        assert!(DedupOutcome::Failed("error".to_string()).is_failed());
    }
}
