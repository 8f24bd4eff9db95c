use prometheus::{IntCounter, Opts};
use tracing::warn;

/// Dedup counters, registered on the default registry.
///
/// Ordinary duplicates (seen on the pre-check) and concurrent duplicates
/// (lost an insert race) are counted separately: a spike in the latter
/// means consumers are racing on the same partitions.
#[derive(Clone)]
pub struct DedupMetrics {
    pub processed: IntCounter,
    pub duplicates: IntCounter,
    pub concurrent_duplicates: IntCounter,
    pub failures: IntCounter,
    pub purged: IntCounter,
}

impl DedupMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
                .expect("valid counter opts")
        };

        let processed = counter(
            "dedup_processed_total",
            "Total messages processed for the first time",
        );
        let duplicates = counter(
            "dedup_duplicates_total",
            "Total messages skipped because they were already processed",
        );
        let concurrent_duplicates = counter(
            "dedup_concurrent_duplicates_total",
            "Total messages that lost a concurrent insert race after processing",
        );
        let failures = counter(
            "dedup_failures_total",
            "Total messages whose handler returned an error",
        );
        let purged = counter(
            "dedup_purged_total",
            "Total ledger rows removed by retention purges",
        );

        for metric in [
            Box::new(processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(duplicates.clone()),
            Box::new(concurrent_duplicates.clone()),
            Box::new(failures.clone()),
            Box::new(purged.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register dedup metric: {}", e);
            }
        }

        Self {
            processed,
            duplicates,
            concurrent_duplicates,
            failures,
            purged,
        }
    }
}
