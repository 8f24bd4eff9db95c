use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use tracing::warn;

/// Engine metrics, registered on the default registry.
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub sent: IntCounter,
    pub transient_failures: IntCounter,
    pub permanent_failures: IntCounter,
    pub dead_lettered: IntCounter,
    pub unroutable: IntCounter,
    pub archived: IntCounter,
    pub publish_latency_seconds: Histogram,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
                .expect("valid gauge opts")
        };
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
                .expect("valid counter opts")
        };

        let pending = gauge(
            "outbox_pending_count",
            "Number of unsent outbox events currently pending",
        );
        let oldest_pending_age_seconds = gauge(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox event",
        );
        let sent = counter(
            "outbox_sent_total",
            "Total number of outbox events marked as sent",
        );
        let transient_failures = counter(
            "outbox_transient_failures_total",
            "Total publish failures classified as transient",
        );
        let permanent_failures = counter(
            "outbox_permanent_failures_total",
            "Total publish failures classified as permanent",
        );
        let dead_lettered = counter(
            "outbox_dead_lettered_total",
            "Total events moved to the dead-letter store",
        );
        let unroutable = counter(
            "outbox_unroutable_total",
            "Total events with no routing rule for their event type",
        );
        let archived = counter(
            "outbox_archived_total",
            "Total sent events relocated to the archive table",
        );

        let publish_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "outbox_publish_latency_seconds",
                "End-to-end latency from event creation to terminal delivery",
            )
            .const_label("service", service.to_string())
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
        )
        .expect("valid histogram opts");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(sent.clone()),
            Box::new(transient_failures.clone()),
            Box::new(permanent_failures.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(unroutable.clone()),
            Box::new(archived.clone()),
            Box::new(publish_latency_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            sent,
            transient_failures,
            permanent_failures,
            dead_lettered,
            unroutable,
            archived,
            publish_latency_seconds,
        }
    }
}
