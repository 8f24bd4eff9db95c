//! # Transactional Outbox Relay
//!
//! Reliable event publishing from PostgreSQL to one or more Kafka clusters
//! using the transactional outbox pattern. Services write events in the
//! same database transaction as their business mutation; a background
//! dispatcher claims pending rows, routes them per event type, and
//! publishes them with at-least-once semantics.
//!
//! ## Problem
//!
//! Publishing directly to Kafka from a request handler loses events:
//! - **Crash between commit and publish**: the business write survives,
//!   the event is gone
//! - **Publish-then-commit**: the event is out while the transaction
//!   rolls back
//! - **Dual writes**: no shared transaction across Postgres and Kafka
//!
//! ## Solution
//!
//! Write the event as a row in `outbox_events` inside the caller's
//! transaction, then relay it asynchronously:
//!
//! ```text
//! Service tx ──> outbox_events ──> Dispatcher ──> Kafka cluster(s)
//!                    │                 │
//!                    │    claim (FOR UPDATE SKIP LOCKED + lease)
//!                    │                 │
//!                    └── dead letter / archive tables
//! ```
//!
//! - **Claiming**: rows are leased via `in_progress_until` so concurrent
//!   dispatchers never double-claim; expired leases make rows claimable
//!   again, giving crash recovery for free
//! - **Routing**: each event type maps to required and optional clusters
//!   with an `ALL_MUST_SUCCEED` or `AT_LEAST_ONE` strategy
//! - **Failure policy**: transient failures retry indefinitely; permanent
//!   failure categories count toward a ceiling and then dead-letter
//! - **Retention**: sent rows past the retention window move to an
//!   archive table
//!
//! ## Usage
//!
//! ```ignore
//! use outbox_relay::writer::OutboxWriter;
//! use outbox_relay::store::postgres::PgEventStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(pool: sqlx::PgPool, order_id: uuid::Uuid) -> anyhow::Result<()> {
//! let store = Arc::new(PgEventStore::new(pool.clone(), Duration::from_secs(30)));
//! let writer = OutboxWriter::new(Arc::clone(&store));
//!
//! let mut tx = pool.begin().await?;
//! // ... business mutation ...
//! writer
//!     .write(&mut tx, "order", order_id, "order.placed", &serde_json::json!({}))
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The dispatcher and archiver run as background tasks:
//!
//! ```ignore
//! use outbox_relay::config::OutboxConfig;
//! use outbox_relay::dispatcher::Dispatcher;
//!
//! # async fn example(dispatcher: std::sync::Arc<outbox_relay::dispatcher::Dispatcher<outbox_relay::store::postgres::PgEventStore>>) {
//! tokio::spawn(dispatcher.start());
//! # }
//! ```

pub mod admin;
pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod macros;
pub mod metrics;
pub mod publisher;
pub mod routing;
pub mod store;
pub mod writer;

pub use admin::AdminService;
pub use archive::Archiver;
pub use config::{ClusterConfig, OutboxConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig, FailureClassifier};
pub use error::{OutboxError, OutboxResult};
pub use event::{ArchivedEvent, DeadLetterEvent, DeliveryMetadata, OutboxEvent};
pub use metrics::OutboxMetrics;
pub use publisher::{
    ClusterPublisher, ClusterSet, FailureCategory, KafkaClusterPublisher, PublishError,
};
pub use routing::{ClusterPublishingStrategy, RoutingRule, RoutingTable};
pub use store::{
    ClaimStrategy, EventFilter, EventStore, FailureDisposition, Page, SortDirection, SortField,
};
pub use writer::OutboxWriter;
