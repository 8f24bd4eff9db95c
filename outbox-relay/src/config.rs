//! Engine configuration.
//!
//! Everything the engine recognizes is loaded here: claim lease, batch and
//! polling settings, the permanent-failure policy, archival retention, the
//! raw routing-rule map (parsed by [`crate::routing::RoutingTable`]) and
//! per-cluster broker connection settings. Malformed JSON values fail fast
//! with the offending variable named.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{OutboxError, OutboxResult};

/// Connection settings for one broker cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Kafka bootstrap servers, comma-separated
    pub bootstrap_servers: String,

    /// Extra librdkafka properties layered on top of the engine defaults
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How long a claim lease lasts before another poller may reclaim the row
    pub lease_duration: Duration,

    /// Maximum number of events claimed per dispatcher tick
    pub batch_size: i64,

    /// Delay before the dispatcher's first tick
    pub poll_initial_delay: Duration,

    /// Interval between dispatcher ticks
    pub poll_interval: Duration,

    /// Permanent failures tolerated before a row is dead-lettered
    pub permanent_failure_ceiling: i32,

    /// Failure category names classified as permanent
    pub permanent_categories: Vec<String>,

    /// Archival retention for sent rows, in days; <= 0 disables archival
    pub retention_days: i64,

    /// Interval between archival job runs
    pub archive_interval: Duration,

    /// Topic prefix for derived Kafka topic names
    pub topic_prefix: String,

    /// Raw routing rules keyed by event type, schema per the routing engine
    pub routing: HashMap<String, Value>,

    /// Broker connection settings keyed by cluster identifier
    pub clusters: HashMap<String, ClusterConfig>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            batch_size: 100,
            poll_initial_delay: Duration::from_millis(0),
            poll_interval: Duration::from_millis(1000),
            permanent_failure_ceiling: 5,
            permanent_categories: vec![
                "serialization".to_string(),
                "authorization".to_string(),
                "message_too_large".to_string(),
            ],
            retention_days: 7,
            archive_interval: Duration::from_secs(86_400),
            topic_prefix: "outbox".to_string(),
            routing: HashMap::new(),
            clusters: HashMap::new(),
        }
    }
}

impl OutboxConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> OutboxResult<Self> {
        let defaults = Self::default();

        let routing = match env::var("OUTBOX_ROUTING_RULES") {
            Ok(raw) => parse_json_map("OUTBOX_ROUTING_RULES", &raw)?,
            Err(_) => HashMap::new(),
        };

        let clusters = match env::var("OUTBOX_CLUSTERS") {
            Ok(raw) => parse_clusters("OUTBOX_CLUSTERS", &raw)?,
            Err(_) => HashMap::new(),
        };

        let permanent_categories = env::var("OUTBOX_PERMANENT_CATEGORIES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.permanent_categories);

        Ok(Self {
            lease_duration: env_duration_secs("OUTBOX_LEASE_SECS", defaults.lease_duration),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", defaults.batch_size),
            poll_initial_delay: env_duration_ms(
                "OUTBOX_POLL_INITIAL_DELAY_MS",
                defaults.poll_initial_delay,
            ),
            poll_interval: env_duration_ms("OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval),
            permanent_failure_ceiling: env_parse(
                "OUTBOX_PERMANENT_FAILURE_CEILING",
                defaults.permanent_failure_ceiling,
            ),
            permanent_categories,
            retention_days: env_parse("OUTBOX_RETENTION_DAYS", defaults.retention_days),
            archive_interval: env_duration_secs(
                "OUTBOX_ARCHIVE_INTERVAL_SECS",
                defaults.archive_interval,
            ),
            topic_prefix: env::var("OUTBOX_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            routing,
            clusters,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_json_map(key: &str, raw: &str) -> OutboxResult<HashMap<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(OutboxError::InvalidConfig(format!(
            "{key} must be a JSON object, got {other}"
        ))),
        Err(e) => Err(OutboxError::InvalidConfig(format!(
            "{key} is not valid JSON: {e}"
        ))),
    }
}

fn parse_clusters(key: &str, raw: &str) -> OutboxResult<HashMap<String, ClusterConfig>> {
    serde_json::from_str(raw)
        .map_err(|e| OutboxError::InvalidConfig(format!("{key} is not valid: {e}")))
}
