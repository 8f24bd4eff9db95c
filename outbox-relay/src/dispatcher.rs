//! Dispatcher: the claim → publish → resolve cycle.
//!
//! Each tick claims a leased batch, resolves every event's routing rule,
//! fans the publish out to the rule's clusters and folds the per-cluster
//! results into one outcome per the rule's strategy. Failures are
//! classified two-tier: transient errors retry indefinitely without
//! penalty; permanent-category errors count toward a ceiling and the row
//! is quarantined to the dead-letter store when it crosses it. Per-event
//! outcomes are isolated so one bad event never blocks the rest of the
//! batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::error::OutboxResult;
use crate::event::{DeliveryMetadata, OutboxEvent};
use crate::metrics::OutboxMetrics;
use crate::publisher::{ClusterSet, FailureCategory, PublishError};
use crate::routing::{ClusterPublishingStrategy, RoutingRule, RoutingTable};
use crate::store::{EventStore, FailureDisposition};

/// Decides whether a publish failure counts against the permanent-failure
/// ceiling.
///
/// Categories outside the configured list are transient: retried
/// indefinitely until they succeed or get reclassified. Unroutable events
/// are always permanent so a configuration gap cannot retry forever.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    permanent: HashSet<String>,
}

impl FailureClassifier {
    pub fn new(permanent_categories: impl IntoIterator<Item = String>) -> Self {
        Self {
            permanent: permanent_categories
                .into_iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_permanent(&self, error: &PublishError) -> bool {
        error.category == FailureCategory::Unroutable
            || self.permanent.contains(error.category.name())
    }
}

/// Dispatcher scheduling and policy knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub poll_initial_delay: Duration,
    pub poll_interval: Duration,
    pub permanent_failure_ceiling: i32,
}

impl From<&OutboxConfig> for DispatcherConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_initial_delay: config.poll_initial_delay,
            poll_interval: config.poll_interval,
            permanent_failure_ceiling: config.permanent_failure_ceiling,
        }
    }
}

/// Background processor driving the outbox lifecycle.
pub struct Dispatcher<S: EventStore> {
    store: Arc<S>,
    routing: Arc<RoutingTable>,
    clusters: ClusterSet,
    classifier: FailureClassifier,
    config: DispatcherConfig,
    metrics: Option<OutboxMetrics>,
}

impl<S: EventStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        routing: Arc<RoutingTable>,
        clusters: ClusterSet,
        classifier: FailureClassifier,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            routing,
            clusters,
            classifier,
            config,
            metrics: None,
        }
    }

    /// Attach Prometheus metrics, updated every tick.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the polling loop. Ticks never overlap within one instance;
    /// overlap across instances is handled by the store's claim contract.
    ///
    /// Spawn this as a background task.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            permanent_failure_ceiling = self.config.permanent_failure_ceiling,
            "Outbox dispatcher starting"
        );

        sleep(self.config.poll_initial_delay).await;
        let mut ticker = interval(self.config.poll_interval);

        loop {
            ticker.tick().await;

            match self.process_batch().await {
                Ok(sent) if sent > 0 => {
                    info!(sent_count = sent, "Dispatched outbox events");
                }
                Ok(_) => debug!("No events dispatched"),
                Err(e) => error!(error = ?e, "Outbox dispatcher tick failed"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.store.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }
        }
    }

    /// Process one claimed batch; returns the number of events sent.
    pub async fn process_batch(&self) -> OutboxResult<usize> {
        let now = Utc::now();
        let events = self.store.claim(now, self.config.batch_size).await?;
        let mut sent_count = 0;

        for event in &events {
            if self.process_event(event).await {
                sent_count += 1;
            }
        }

        Ok(sent_count)
    }

    /// Drive one event to an outcome. Returns true when the event was sent.
    /// Store errors while resolving an outcome are logged, never propagated,
    /// so the rest of the batch keeps flowing.
    async fn process_event(&self, event: &OutboxEvent) -> bool {
        let Some(rule) = self.routing.resolve(&event.event_type) else {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No routing rule configured for event type"
            );
            if let Some(metrics) = &self.metrics {
                metrics.unroutable.inc();
            }
            let error = PublishError::new(
                "-",
                FailureCategory::Unroutable,
                format!("no routing rule configured for event type '{}'", event.event_type),
            );
            self.resolve_failure(event, error).await;
            return false;
        };

        match self.publish_route(event, rule).await {
            Ok(delivery) => {
                let now = Utc::now();
                if let Err(e) = self.store.mark_sent(event.id, now, delivery).await {
                    // The brokers have the message; the row will be
                    // re-published after lease expiry and downstream dedup
                    // absorbs the duplicate.
                    error!(
                        event_id = %event.id,
                        error = ?e,
                        "Failed to mark event as sent after successful publish"
                    );
                    return false;
                }
                if let Some(metrics) = &self.metrics {
                    metrics.sent.inc();
                    let latency =
                        (now - event.created_at).num_milliseconds().max(0) as f64 / 1_000.0;
                    metrics.publish_latency_seconds.observe(latency);
                }
                true
            }
            Err(error) => {
                self.resolve_failure(event, error).await;
                false
            }
        }
    }

    /// Publish to every cluster the rule names and fold the results per the
    /// rule's strategy. Attempts run concurrently; the fold returns as soon
    /// as the outcome is decided (one required failure decides
    /// `AllMustSucceed`, one required success decides `AtLeastOne`).
    async fn publish_route(
        &self,
        event: &OutboxEvent,
        rule: &RoutingRule,
    ) -> Result<Option<DeliveryMetadata>, PublishError> {
        let targets = rule
            .required
            .iter()
            .map(|c| (c.as_str(), true))
            .chain(rule.optional.iter().map(|c| (c.as_str(), false)));

        let mut attempts = FuturesUnordered::new();
        for (cluster, required) in targets {
            let publisher = self.clusters.get(cluster);
            let cluster = cluster.to_string();
            attempts.push(async move {
                let result = match publisher {
                    Some(p) => p.publish(event).await,
                    None => Err(PublishError::new(
                        &cluster,
                        FailureCategory::Transport,
                        "no publisher configured for cluster",
                    )),
                };
                (required, result)
            });
        }

        let mut remaining_required = rule.required.len();
        let mut delivery: Option<DeliveryMetadata> = None;
        let mut last_required_error: Option<PublishError> = None;

        while let Some((required, result)) = attempts.next().await {
            match result {
                Ok(meta) => {
                    if !required {
                        continue;
                    }
                    remaining_required -= 1;
                    if delivery.is_none() {
                        delivery = Some(meta);
                    }
                    let decided = match rule.strategy {
                        ClusterPublishingStrategy::AtLeastOne => true,
                        ClusterPublishingStrategy::AllMustSucceed => {
                            remaining_required == 0 && last_required_error.is_none()
                        }
                    };
                    if decided {
                        return Ok(delivery);
                    }
                }
                Err(error) => {
                    if !required {
                        warn!(
                            event_id = %event.id,
                            cluster = %error.cluster,
                            error = %error,
                            "Optional cluster publish failed"
                        );
                        continue;
                    }
                    remaining_required -= 1;
                    match rule.strategy {
                        ClusterPublishingStrategy::AllMustSucceed => return Err(error),
                        ClusterPublishingStrategy::AtLeastOne => {
                            last_required_error = Some(error);
                        }
                    }
                }
            }
        }

        match last_required_error {
            Some(error) => Err(error),
            None => Ok(delivery),
        }
    }

    /// Apply the two-tier failure policy to a failed event.
    async fn resolve_failure(&self, event: &OutboxEvent, error: PublishError) {
        let now = Utc::now();

        if !self.classifier.is_permanent(&error) {
            debug!(
                event_id = %event.id,
                category = %error.category,
                error = %error,
                "Transient publish failure, will retry after lease expiry"
            );
            if let Some(metrics) = &self.metrics {
                metrics.transient_failures.inc();
            }
            if let Err(e) = self
                .store
                .record_transient_failure(event.id, &error.to_string())
                .await
            {
                error!(event_id = %event.id, error = ?e, "Failed to record transient failure");
            }
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.permanent_failures.inc();
        }

        match self
            .store
            .record_permanent_failure(
                event.id,
                &error.to_string(),
                now,
                self.config.permanent_failure_ceiling,
            )
            .await
        {
            Ok(FailureDisposition::Retrying { failure_count }) => {
                warn!(
                    event_id = %event.id,
                    category = %error.category,
                    failure_count,
                    ceiling = self.config.permanent_failure_ceiling,
                    error = %error,
                    "Permanent-category publish failure recorded"
                );
            }
            Ok(FailureDisposition::DeadLettered) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    category = %error.category,
                    error = %error,
                    "Event exhausted permanent retries and was dead-lettered"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.dead_lettered.inc();
                }
            }
            Err(e) => {
                error!(event_id = %event.id, error = ?e, "Failed to record permanent failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryEventStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    use crate::publisher::ClusterPublisher;

    /// Publisher whose outcome is fixed per cluster.
    struct ScriptedPublisher {
        cluster: String,
        failure: Option<FailureCategory>,
        calls: AtomicUsize,
    }

    impl ScriptedPublisher {
        fn ok(cluster: &str) -> Arc<Self> {
            Arc::new(Self {
                cluster: cluster.to_string(),
                failure: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(cluster: &str, category: FailureCategory) -> Arc<Self> {
            Arc::new(Self {
                cluster: cluster.to_string(),
                failure: Some(category),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClusterPublisher for ScriptedPublisher {
        fn cluster(&self) -> &str {
            &self.cluster
        }

        async fn publish(&self, _event: &OutboxEvent) -> Result<DeliveryMetadata, PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failure {
                None => Ok(DeliveryMetadata {
                    partition: 0,
                    offset: 1,
                    timestamp: Utc::now(),
                }),
                Some(category) => Err(PublishError::new(&self.cluster, category, "scripted")),
            }
        }
    }

    fn routing(rules: serde_json::Value) -> Arc<RoutingTable> {
        let map: HashMap<String, serde_json::Value> = rules
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Arc::new(RoutingTable::parse(&map).unwrap())
    }

    fn dispatcher(
        store: Arc<MemoryEventStore>,
        routing_table: Arc<RoutingTable>,
        publishers: Vec<Arc<ScriptedPublisher>>,
        ceiling: i32,
    ) -> Dispatcher<MemoryEventStore> {
        let clusters = ClusterSet::new(
            publishers
                .into_iter()
                .map(|p| p as Arc<dyn ClusterPublisher>)
                .collect(),
        );
        Dispatcher::new(
            store,
            routing_table,
            clusters,
            FailureClassifier::new(vec![
                "serialization".to_string(),
                "authorization".to_string(),
            ]),
            DispatcherConfig {
                batch_size: 10,
                poll_initial_delay: Duration::from_millis(0),
                poll_interval: Duration::from_millis(100),
                permanent_failure_ceiling: ceiling,
            },
        )
    }

    fn pending_event(event_type: &str) -> OutboxEvent {
        OutboxEvent::new(
            "order",
            Uuid::new_v4(),
            event_type,
            serde_json::json!({"total": 10}),
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn all_must_succeed_fails_when_one_required_cluster_fails() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({"order.created": {"clusters": ["a", "b"]}})),
            vec![
                ScriptedPublisher::ok("a"),
                ScriptedPublisher::failing("b", FailureCategory::Transport),
            ],
            5,
        );

        let sent = d.process_batch().await.unwrap();
        assert_eq!(sent, 0);

        let row = store.get(id).unwrap();
        assert!(row.sent_at.is_none());
        assert_eq!(row.permanent_failure_count, 0, "transport is transient");
        assert!(row.last_error.unwrap().contains("cluster 'b'"));
    }

    #[tokio::test]
    async fn at_least_one_succeeds_when_any_required_cluster_accepts() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({
                "order.created": {"clusters": ["a", "b"], "strategy": "at-least-one"}
            })),
            vec![
                ScriptedPublisher::ok("a"),
                ScriptedPublisher::failing("b", FailureCategory::Transport),
            ],
            5,
        );

        let sent = d.process_batch().await.unwrap();
        assert_eq!(sent, 1);

        let row = store.get(id).unwrap();
        assert!(row.sent_at.is_some());
        assert!(row.delivery.is_some());
        assert!(row.in_progress_until.is_none());
    }

    #[tokio::test]
    async fn at_least_one_fails_when_every_required_cluster_fails() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({
                "order.created": {"clusters": ["a", "b"], "strategy": "at_least_one"}
            })),
            vec![
                ScriptedPublisher::failing("a", FailureCategory::Transport),
                ScriptedPublisher::failing("b", FailureCategory::Transport),
            ],
            5,
        );

        assert_eq!(d.process_batch().await.unwrap(), 0);
        assert!(store.get(id).unwrap().sent_at.is_none());
    }

    #[tokio::test]
    async fn optional_cluster_failure_never_blocks_success() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({
                "order.created": {"clusters": "a", "optional": "audit"}
            })),
            vec![
                ScriptedPublisher::ok("a"),
                ScriptedPublisher::failing("audit", FailureCategory::Serialization),
            ],
            5,
        );

        assert_eq!(d.process_batch().await.unwrap(), 1);
        assert!(store.get(id).unwrap().sent_at.is_some());
    }

    #[tokio::test]
    async fn permanent_failures_count_up_to_ceiling_then_dead_letter() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({"order.created": "a"})),
            vec![ScriptedPublisher::failing(
                "a",
                FailureCategory::Serialization,
            )],
            2,
        );

        // First tick: counted but below the ceiling, row stays live and
        // immediately claimable.
        assert_eq!(d.process_batch().await.unwrap(), 0);
        let row = store.get(id).unwrap();
        assert_eq!(row.permanent_failure_count, 1);
        assert!(row.sent_at.is_none());
        assert!(row.last_error.is_some());

        // Second tick crosses the ceiling.
        assert_eq!(d.process_batch().await.unwrap(), 0);
        assert!(store.get(id).is_none());

        let letters = store.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, id);
        assert_eq!(letters[0].permanent_failure_count, 2);
    }

    #[tokio::test]
    async fn transient_failures_retry_without_counting() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(0)));
        let event = pending_event("order.created");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({"order.created": "a"})),
            vec![ScriptedPublisher::failing("a", FailureCategory::Transport)],
            2,
        );

        // Zero lease keeps the row claimable; well past the ceiling the row
        // is still live because transport failures never count.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(d.process_batch().await.unwrap(), 0);
        }

        let row = store.get(id).unwrap();
        assert_eq!(row.permanent_failure_count, 0);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn unroutable_event_is_dead_lettered_with_distinct_diagnostic() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let event = pending_event("mystery.event");
        let id = event.id;
        store.insert(event);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({})),
            vec![],
            1,
        );

        assert_eq!(d.process_batch().await.unwrap(), 0);
        assert!(store.get(id).is_none(), "unroutable hit ceiling 1");

        let letters = store.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].final_error.contains("no routing rule"));
        assert!(letters[0].final_error.contains("mystery.event"));
    }

    #[tokio::test]
    async fn one_bad_event_does_not_block_the_batch() {
        let store = Arc::new(MemoryEventStore::new(Duration::from_secs(30)));
        let bad = pending_event("mystery.event");
        let good = pending_event("order.created");
        let good_id = good.id;
        store.insert(bad);
        store.insert(good);

        let d = dispatcher(
            Arc::clone(&store),
            routing(serde_json::json!({"order.created": "a"})),
            vec![ScriptedPublisher::ok("a")],
            5,
        );

        assert_eq!(d.process_batch().await.unwrap(), 1);
        assert!(store.get(good_id).unwrap().sent_at.is_some());
    }

    #[test]
    fn classifier_honors_configured_categories() {
        let classifier = FailureClassifier::new(vec!["serialization".to_string()]);

        let serialization = PublishError::new("a", FailureCategory::Serialization, "x");
        let transport = PublishError::new("a", FailureCategory::Transport, "x");
        let authorization = PublishError::new("a", FailureCategory::Authorization, "x");
        let unroutable = PublishError::new("-", FailureCategory::Unroutable, "x");

        assert!(classifier.is_permanent(&serialization));
        assert!(!classifier.is_permanent(&transport));
        assert!(!classifier.is_permanent(&authorization));
        assert!(
            classifier.is_permanent(&unroutable),
            "unroutable is always permanent"
        );
    }
}
