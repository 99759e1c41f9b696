//! Entity description structures

use crate::{PropertyValue, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the TRUE-filter rule created when a subscription is born.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Name segment addressing an entity's dead-letter sub-queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = "$DeadLetterQueue";

// ============================================================================
// QUEUE
// ============================================================================

/// Configurable queue properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueProperties {
    pub max_size_in_megabytes: u64,
    pub default_message_time_to_live: Duration,
    pub lock_duration: Duration,
    pub requires_session: bool,
    pub requires_duplicate_detection: bool,
    pub duplicate_detection_history_window: Duration,
    pub dead_lettering_on_message_expiration: bool,
    pub enable_batched_operations: bool,
    pub max_delivery_count: u32,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self {
            max_size_in_megabytes: 1024,
            default_message_time_to_live: crate::DEFAULT_MESSAGE_TTL,
            lock_duration: crate::DEFAULT_LOCK_DURATION,
            requires_session: false,
            requires_duplicate_detection: false,
            duplicate_detection_history_window: Duration::from_secs(600),
            dead_lettering_on_message_expiration: false,
            enable_batched_operations: true,
            max_delivery_count: 10,
        }
    }
}

/// Live counters surfaced alongside a queue or subscription description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub message_count: u64,
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
    pub scheduled_message_count: u64,
    pub size_in_bytes: u64,
}

/// A queue as the admin surface sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescription {
    pub name: String,
    pub properties: QueueProperties,
    pub runtime_info: RuntimeInfo,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// TOPIC
// ============================================================================

/// Configurable topic properties. Topics hold no messages past fan-out, so
/// there is no lock or delivery configuration here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicProperties {
    pub max_size_in_megabytes: u64,
    pub default_message_time_to_live: Duration,
    pub requires_duplicate_detection: bool,
    pub duplicate_detection_history_window: Duration,
    pub enable_batched_operations: bool,
}

impl Default for TopicProperties {
    fn default() -> Self {
        Self {
            max_size_in_megabytes: 1024,
            default_message_time_to_live: crate::DEFAULT_MESSAGE_TTL,
            requires_duplicate_detection: false,
            duplicate_detection_history_window: Duration::from_secs(600),
            enable_batched_operations: true,
        }
    }
}

/// A topic as the admin surface sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDescription {
    pub name: String,
    pub properties: TopicProperties,
    pub subscription_count: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Configurable subscription properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionProperties {
    pub lock_duration: Duration,
    pub requires_session: bool,
    pub default_message_time_to_live: Duration,
    pub dead_lettering_on_message_expiration: bool,
    pub dead_lettering_on_filter_evaluation_exceptions: bool,
    pub max_delivery_count: u32,
    pub enable_batched_operations: bool,
}

impl Default for SubscriptionProperties {
    fn default() -> Self {
        Self {
            lock_duration: crate::DEFAULT_LOCK_DURATION,
            requires_session: false,
            default_message_time_to_live: crate::DEFAULT_MESSAGE_TTL,
            dead_lettering_on_message_expiration: false,
            dead_lettering_on_filter_evaluation_exceptions: true,
            max_delivery_count: 10,
            enable_batched_operations: true,
        }
    }
}

/// A subscription as the admin surface sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDescription {
    pub topic_name: String,
    pub name: String,
    pub properties: SubscriptionProperties,
    pub runtime_info: RuntimeInfo,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// RULES AND FILTERS
// ============================================================================

/// Correlation filter: the conjunction of equality checks on the fields that
/// are present. An absent field constrains nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrelationFilter {
    pub correlation_id: Option<String>,
    pub label: Option<String>,
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl CorrelationFilter {
    /// True when no field is specified; such a filter matches every message.
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.label.is_none()
            && self.message_id.is_none()
            && self.to.is_none()
            && self.reply_to.is_none()
            && self.session_id.is_none()
            && self.properties.is_empty()
    }
}

/// Tagged filter variant held by a rule. SQL expressions are stored as text
/// here; the broker compiles and caches the AST alongside its rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleFilter {
    Sql { expression: String },
    Correlation(CorrelationFilter),
    True,
}

impl RuleFilter {
    pub fn sql(expression: impl Into<String>) -> Self {
        RuleFilter::Sql {
            expression: expression.into(),
        }
    }
}

/// A rule on a subscription: a filter and an optional SQL action. The action
/// text is stored but not evaluated by the broker core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescription {
    pub name: String,
    pub filter: RuleFilter,
    pub action: Option<String>,
    pub created_at: Timestamp,
}

/// What kind of entity an error or admin operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Queue,
    Topic,
    Subscription,
    Rule,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Queue => "queue",
            EntityKind::Topic => "topic",
            EntityKind::Subscription => "subscription",
            EntityKind::Rule => "rule",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_property_defaults() {
        let props = QueueProperties::default();
        assert_eq!(props.lock_duration, Duration::from_secs(60));
        assert_eq!(props.max_delivery_count, 10);
        assert!(!props.requires_session);
    }

    #[test]
    fn test_empty_correlation_filter() {
        let filter = CorrelationFilter::default();
        assert!(filter.is_empty());

        let filter = CorrelationFilter {
            label: Some("orders".to_string()),
            ..Default::default()
        };
        assert!(!filter.is_empty());
    }

    #[test]
    fn test_rule_filter_tagged_json() {
        let filter = RuleFilter::sql("priority = 'high'");
        let json = serde_json::to_value(&filter).expect("should serialize");
        assert_eq!(json["type"], "Sql");
        assert_eq!(json["expression"], "priority = 'high'");
    }
}
