//! Broker cluster publishers.
//!
//! One publisher per configured cluster; the dispatcher fans an event out to
//! the clusters its routing rule names. Publish failures carry a
//! [`FailureCategory`] so the retry classifier works on data instead of
//! matching error strings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tracing::info;

use crate::config::ClusterConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{DeliveryMetadata, OutboxEvent};
use crate::routing::RoutingTable;

/// Coarse classification of a publish failure, matched against the
/// configured allow-list of permanent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Payload could not be serialized for the wire
    Serialization,
    /// Broker rejected the request for authorization reasons
    Authorization,
    /// Message exceeds the broker's size limit
    MessageTooLarge,
    /// No routing rule exists for the event type
    Unroutable,
    /// Network or broker availability problem, expected to clear on retry
    Transport,
}

impl FailureCategory {
    /// Stable name used in configuration and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serialization => "serialization",
            Self::Authorization => "authorization",
            Self::MessageTooLarge => "message_too_large",
            Self::Unroutable => "unroutable",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed publish attempt against one cluster.
#[derive(Error, Debug, Clone)]
#[error("publish to cluster '{cluster}' failed ({category}): {message}")]
pub struct PublishError {
    pub cluster: String,
    pub category: FailureCategory,
    pub message: String,
}

impl PublishError {
    pub fn new(
        cluster: impl Into<String>,
        category: FailureCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            category,
            message: message.into(),
        }
    }
}

/// Map an rdkafka error onto a failure category.
fn categorize(err: &KafkaError) -> FailureCategory {
    match err {
        KafkaError::MessageProduction(code) => match code {
            RDKafkaErrorCode::MessageSizeTooLarge => FailureCategory::MessageTooLarge,
            RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed => FailureCategory::Authorization,
            _ => FailureCategory::Transport,
        },
        _ => FailureCategory::Transport,
    }
}

/// Publisher for one broker cluster.
#[async_trait]
pub trait ClusterPublisher: Send + Sync {
    /// Identifier this publisher is registered under.
    fn cluster(&self) -> &str;

    /// Publish an event, returning the broker's delivery coordinates.
    async fn publish(&self, event: &OutboxEvent) -> Result<DeliveryMetadata, PublishError>;
}

/// Kafka-backed cluster publisher.
///
/// The producer is configured idempotent (`enable.idempotence=true`,
/// `acks=all`) because lease expiry allows a second poller to re-publish a
/// row concurrently with a slow first attempt.
pub struct KafkaClusterPublisher {
    cluster: String,
    producer: FutureProducer,
    topic_prefix: String,
}

impl KafkaClusterPublisher {
    /// Build the publisher for a cluster from its connection settings.
    pub fn from_config(
        cluster: &str,
        config: &ClusterConfig,
        topic_prefix: &str,
    ) -> OutboxResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.timeout.ms", "30000");

        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config.create().map_err(|e| {
            OutboxError::InvalidConfig(format!(
                "failed to create Kafka producer for cluster '{cluster}': {e}"
            ))
        })?;

        Ok(Self {
            cluster: cluster.to_string(),
            producer,
            topic_prefix: topic_prefix.to_string(),
        })
    }

    /// Derive the topic from the event type: "order.created" with prefix
    /// "outbox" lands on "outbox.order.events".
    fn topic_for(&self, event_type: &str) -> String {
        let aggregate = event_type.split('.').next().unwrap_or("unknown");
        format!("{}.{}.events", self.topic_prefix, aggregate)
    }
}

#[async_trait]
impl ClusterPublisher for KafkaClusterPublisher {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<DeliveryMetadata, PublishError> {
        let topic = self.topic_for(&event.event_type);

        let payload = serde_json::to_string(&event.payload).map_err(|e| {
            PublishError::new(&self.cluster, FailureCategory::Serialization, e.to_string())
        })?;

        let event_id = event.id.to_string();
        let aggregate_id = event.aggregate_id.to_string();
        let correlation_id = event.correlation_id.to_string();
        let created_at = event.created_at.to_rfc3339();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(event.event_type.as_bytes()),
            })
            .insert(Header {
                key: "event_id",
                value: Some(event_id.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_type",
                value: Some(event.aggregate_type.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_id",
                value: Some(aggregate_id.as_bytes()),
            })
            .insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_bytes()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at.as_bytes()),
            });

        // aggregate_id as partition key keeps per-aggregate ordering
        let record = FutureRecord::to(&topic)
            .key(&aggregate_id)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| {
                PublishError::new(&self.cluster, categorize(&err), err.to_string())
            })?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            cluster = %self.cluster,
            topic = %topic,
            partition,
            offset,
            "Event published"
        );

        Ok(DeliveryMetadata {
            partition,
            offset,
            timestamp: Utc::now(),
        })
    }
}

/// The set of configured cluster publishers, keyed by cluster identifier.
#[derive(Clone)]
pub struct ClusterSet {
    publishers: HashMap<String, Arc<dyn ClusterPublisher>>,
}

impl ClusterSet {
    /// Assemble a set from already-built publishers (used by tests and
    /// embedders with custom transports).
    pub fn new(publishers: Vec<Arc<dyn ClusterPublisher>>) -> Self {
        Self {
            publishers: publishers
                .into_iter()
                .map(|p| (p.cluster().to_string(), p))
                .collect(),
        }
    }

    /// Build Kafka publishers for every configured cluster and verify that
    /// the routing table only references clusters that exist.
    pub fn from_config(
        clusters: &HashMap<String, ClusterConfig>,
        topic_prefix: &str,
        routing: &RoutingTable,
    ) -> OutboxResult<Self> {
        let mut publishers: HashMap<String, Arc<dyn ClusterPublisher>> =
            HashMap::with_capacity(clusters.len());

        for (cluster, config) in clusters {
            let publisher = KafkaClusterPublisher::from_config(cluster, config, topic_prefix)?;
            publishers.insert(cluster.clone(), Arc::new(publisher));
        }

        let set = Self { publishers };
        set.validate_routes(routing)?;
        Ok(set)
    }

    /// Fail fast when a routing rule names a cluster with no publisher.
    pub fn validate_routes(&self, routing: &RoutingTable) -> OutboxResult<()> {
        for (event_type, rule) in routing.iter() {
            for cluster in rule.all_clusters() {
                if !self.publishers.contains_key(cluster) {
                    return Err(OutboxError::UnknownCluster {
                        event_type: event_type.to_string(),
                        cluster: cluster.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<dyn ClusterPublisher>> {
        self.publishers.get(cluster).cloned()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}
