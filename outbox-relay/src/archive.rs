//! Archival job: relocates terminal (sent) rows past the retention window
//! into the archive table to bound live-table growth.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::OutboxResult;
use crate::metrics::OutboxMetrics;
use crate::store::EventStore;

/// Scheduled archiver over an event store.
pub struct Archiver<S: EventStore> {
    store: Arc<S>,
    retention_days: i64,
    run_interval: Duration,
    metrics: Option<OutboxMetrics>,
}

impl<S: EventStore> Archiver<S> {
    /// `retention_days <= 0` disables archival entirely.
    pub fn new(store: Arc<S>, retention_days: i64, run_interval: Duration) -> Self {
        Self {
            store,
            retention_days,
            run_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the archival schedule (default interval is daily). Spawn as a
    /// background task.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            retention_days = self.retention_days,
            interval_secs = self.run_interval.as_secs(),
            "Outbox archiver starting"
        );

        let mut ticker = interval(self.run_interval);

        loop {
            ticker.tick().await;

            match self.run_once(None).await {
                Ok(count) if count > 0 => info!(archived_count = count, "Archived sent events"),
                Ok(_) => debug!("No events to archive"),
                Err(e) => error!(error = ?e, "Archival pass failed"),
            }
        }
    }

    /// Execute one archival pass, all-or-nothing.
    ///
    /// `retention_override` supports the administrative out-of-band pass;
    /// `None` uses the configured retention. Returns the number of rows
    /// archived.
    pub async fn run_once(&self, retention_override: Option<i64>) -> OutboxResult<u64> {
        let retention_days = retention_override.unwrap_or(self.retention_days);
        if retention_days <= 0 {
            debug!("Archival disabled (retention <= 0)");
            return Ok(0);
        }

        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(retention_days);
        let count = self.store.archive_sent_before(cutoff, now).await?;

        if count > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.archived.inc_by(count);
            }
        }

        Ok(count)
    }
}
