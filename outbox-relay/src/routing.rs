//! Routing engine: maps an event type to its target clusters and success
//! strategy.
//!
//! The configuration schema is deliberately permissive so operators can
//! write the common case tersely. A rule value may be:
//!
//! - a bare string: one required cluster, `AllMustSucceed`
//! - an object with `clusters` (string or list), optional `optional`
//!   (string or list) and optional `strategy` (case-insensitive, `-` and
//!   `_` interchangeable)
//!
//! Anything else fails fast at parse time naming the offending event type.
//! Parsing happens once at startup; resolution is a pure map lookup.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{OutboxError, OutboxResult};

/// How publish outcomes across a rule's required clusters combine into the
/// event's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPublishingStrategy {
    /// Every required cluster must accept the message
    AllMustSucceed,
    /// Any one required cluster accepting the message is enough
    AtLeastOne,
}

impl ClusterPublishingStrategy {
    /// Parse a strategy name, accepting any case and either `-` or `_` as
    /// the word separator.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "all_must_succeed" => Some(Self::AllMustSucceed),
            "at_least_one" => Some(Self::AtLeastOne),
            _ => None,
        }
    }
}

impl Default for ClusterPublishingStrategy {
    fn default() -> Self {
        Self::AllMustSucceed
    }
}

/// Parsed routing rule for one event type. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Clusters that participate in the success strategy, in declaration order
    pub required: Vec<String>,
    /// Best-effort clusters; failures are logged but never block success
    pub optional: Vec<String>,
    pub strategy: ClusterPublishingStrategy,
}

impl RoutingRule {
    /// Shorthand rule: one required cluster, `AllMustSucceed`.
    pub fn single(cluster: impl Into<String>) -> Self {
        Self {
            required: vec![cluster.into()],
            optional: Vec::new(),
            strategy: ClusterPublishingStrategy::AllMustSucceed,
        }
    }

    /// Every cluster this rule touches, required first.
    pub fn all_clusters(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }
}

/// Lookup table of routing rules keyed by event type.
///
/// Absence of a rule for an event type is a valid state; the dispatcher
/// treats it as an unroutable event, not a parse failure.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: HashMap<String, RoutingRule>,
}

impl RoutingTable {
    /// Parse the operator-facing configuration map into a routing table.
    pub fn parse(config: &HashMap<String, Value>) -> OutboxResult<Self> {
        let mut rules = HashMap::with_capacity(config.len());

        for (event_type, value) in config {
            let rule = parse_rule(event_type, value)?;
            debug!(
                event_type = %event_type,
                required = rule.required.len(),
                optional = rule.optional.len(),
                strategy = ?rule.strategy,
                "Parsed routing rule"
            );
            rules.insert(event_type.clone(), rule);
        }

        Ok(Self { rules })
    }

    /// Look up the rule for an event type, if one is configured.
    pub fn resolve(&self, event_type: &str) -> Option<&RoutingRule> {
        self.rules.get(event_type)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over `(event_type, rule)` pairs, used to validate cluster
    /// references at startup.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RoutingRule)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn parse_rule(event_type: &str, value: &Value) -> OutboxResult<RoutingRule> {
    match value {
        Value::String(cluster) => {
            if cluster.is_empty() {
                return Err(invalid(event_type, "cluster name must not be empty"));
            }
            Ok(RoutingRule::single(cluster.clone()))
        }
        Value::Object(map) => {
            let required = match map.get("clusters") {
                Some(v) => parse_cluster_names(event_type, "clusters", v)?,
                None => return Err(invalid(event_type, "missing 'clusters' key")),
            };
            if required.is_empty() {
                return Err(invalid(event_type, "'clusters' must name at least one cluster"));
            }

            let optional = match map.get("optional") {
                Some(v) => parse_cluster_names(event_type, "optional", v)?,
                None => Vec::new(),
            };

            let strategy = match map.get("strategy") {
                Some(Value::String(raw)) => ClusterPublishingStrategy::parse(raw)
                    .ok_or_else(|| invalid(event_type, &format!("unknown strategy '{raw}'")))?,
                Some(other) => {
                    return Err(invalid(
                        event_type,
                        &format!("'strategy' must be a string, got {other}"),
                    ))
                }
                None => ClusterPublishingStrategy::default(),
            };

            for key in map.keys() {
                if !matches!(key.as_str(), "clusters" | "optional" | "strategy") {
                    return Err(invalid(event_type, &format!("unrecognized key '{key}'")));
                }
            }

            Ok(RoutingRule {
                required,
                optional,
                strategy,
            })
        }
        other => Err(invalid(
            event_type,
            &format!("expected a cluster name or an object, got {other}"),
        )),
    }
}

fn parse_cluster_names(event_type: &str, key: &str, value: &Value) -> OutboxResult<Vec<String>> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) if !s.is_empty() => Ok(s.clone()),
                other => Err(invalid(
                    event_type,
                    &format!("'{key}' entries must be non-empty strings, got {other}"),
                )),
            })
            .collect(),
        other => Err(invalid(
            event_type,
            &format!("'{key}' must be a string or list of strings, got {other}"),
        )),
    }
}

fn invalid(event_type: &str, reason: &str) -> OutboxError {
    OutboxError::InvalidRoutingRule {
        event_type: event_type.to_string(),
        reason: reason.to_string(),
    }
}
