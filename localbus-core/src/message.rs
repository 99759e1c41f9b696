//! Message types and receive modes

use crate::{LockToken, SequenceNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// PROPERTY VALUES
// ============================================================================

/// A user-property value attached to a message.
///
/// Mirrors the JSON value space of the wire format: string, integer, float,
/// boolean, or null. Maps and arrays are not representable as message
/// properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// The string payload, if this is a string property.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Float(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

// ============================================================================
// RECEIVE MODES AND DEAD-LETTER REASONS
// ============================================================================

/// How a consumer takes messages off an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Reserve the message under a lock token without removing it.
    PeekLock,
    /// Remove the message atomically on receive.
    ReceiveAndDelete,
}

impl ReceiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiveMode::PeekLock => "PeekLock",
            ReceiveMode::ReceiveAndDelete => "ReceiveAndDelete",
        }
    }
}

impl fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error when parsing an invalid receive mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveModeParseError(pub String);

impl fmt::Display for ReceiveModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid receive mode: {}", self.0)
    }
}

impl std::error::Error for ReceiveModeParseError {}

impl FromStr for ReceiveMode {
    type Err = ReceiveModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "peeklock" => Ok(ReceiveMode::PeekLock),
            "receiveanddelete" => Ok(ReceiveMode::ReceiveAndDelete),
            _ => Err(ReceiveModeParseError(s.to_string())),
        }
    }
}

/// Why a message landed in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    MaxDeliveryCountExceeded,
    TtlExpired,
    FilterEvaluationError,
    ProcessingError,
    Custom(String),
}

impl DeadLetterReason {
    /// The stable wire string for this reason.
    pub fn as_str(&self) -> &str {
        match self {
            DeadLetterReason::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
            DeadLetterReason::TtlExpired => "TTLExpired",
            DeadLetterReason::FilterEvaluationError => "FilterEvaluationError",
            DeadLetterReason::ProcessingError => "ProcessingError",
            DeadLetterReason::Custom(s) => s,
        }
    }

    /// Parse a wire string, falling back to a custom reason.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "MaxDeliveryCountExceeded" => DeadLetterReason::MaxDeliveryCountExceeded,
            "TTLExpired" => DeadLetterReason::TtlExpired,
            "FilterEvaluationError" => DeadLetterReason::FilterEvaluationError,
            "ProcessingError" => DeadLetterReason::ProcessingError,
            other => DeadLetterReason::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// BROKERED MESSAGE
// ============================================================================

/// A message held by the broker, with system properties, user properties,
/// and lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokeredMessage {
    /// Client-supplied or generated message identifier.
    pub message_id: String,
    /// Opaque payload bytes.
    pub body: Vec<u8>,

    // System properties
    pub label: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<Timestamp>,
    pub sequence_number: SequenceNumber,
    pub enqueued_time: Timestamp,
    pub user_properties: BTreeMap<String, PropertyValue>,

    // Lifecycle fields
    pub delivery_count: u32,
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<Timestamp>,
    pub locked_by: Option<String>,
    pub dead_letter_reason: Option<DeadLetterReason>,
    pub dead_letter_description: Option<String>,
}

impl BrokeredMessage {
    /// The instant this message's TTL runs out, if it carries one.
    pub fn expires_at(&self) -> Option<Timestamp> {
        let ttl = self.time_to_live?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        Some(self.enqueued_time + ttl)
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.expires_at() {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }

    /// Approximate size used for the entity's size-in-bytes counter.
    pub fn size_in_bytes(&self) -> u64 {
        let props: usize = self
            .user_properties
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        PropertyValue::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum();
        (self.body.len() + props) as u64
    }

    /// Drop all lock state, returning the message to an unlocked shape.
    pub fn clear_lock(&mut self) {
        self.lock_token = None;
        self.locked_until = None;
        self.locked_by = None;
    }
}

// ============================================================================
// WIRE SHAPES
// ============================================================================

/// Send/publish request body. Field names are snake_case on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    /// Time to live in seconds.
    #[serde(default)]
    pub time_to_live: Option<u64>,
    #[serde(default)]
    pub scheduled_enqueue_time_utc: Option<Timestamp>,
    #[serde(default)]
    pub user_properties: BTreeMap<String, PropertyValue>,
}

impl SendMessageRequest {
    /// Convenience constructor for a plain-text message.
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Receipt returned to the producer after a send or publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub sequence_number: SequenceNumber,
}

/// A message as handed to a consumer. Serializes PascalCase, the shape
/// receive responses use on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// Null in ReceiveAndDelete mode.
    pub lock_token: Option<LockToken>,
    pub delivery_count: u32,
    pub locked_until_utc: Option<Timestamp>,
    pub enqueued_time_utc: Timestamp,
    pub sequence_number: SequenceNumber,
    pub session_id: Option<String>,
    pub label: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub user_properties: BTreeMap<String, PropertyValue>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl ReceivedMessage {
    /// Project a stored message into the consumer-facing shape.
    pub fn from_message(message: &BrokeredMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            lock_token: message.lock_token,
            delivery_count: message.delivery_count,
            locked_until_utc: message.locked_until,
            enqueued_time_utc: message.enqueued_time,
            sequence_number: message.sequence_number,
            session_id: message.session_id.clone(),
            label: message.label.clone(),
            correlation_id: message.correlation_id.clone(),
            content_type: message.content_type.clone(),
            to: message.to.clone(),
            reply_to: message.reply_to.clone(),
            user_properties: message.user_properties.clone(),
            dead_letter_reason: message.dead_letter_reason.as_ref().map(|r| r.as_str().to_string()),
            dead_letter_description: message.dead_letter_description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message() -> BrokeredMessage {
        BrokeredMessage {
            message_id: "m1".to_string(),
            body: b"payload".to_vec(),
            label: None,
            correlation_id: None,
            content_type: None,
            to: None,
            reply_to: None,
            session_id: None,
            partition_key: None,
            time_to_live: Some(Duration::from_secs(60)),
            scheduled_enqueue_time: None,
            sequence_number: 1,
            enqueued_time: Utc::now(),
            user_properties: BTreeMap::new(),
            delivery_count: 0,
            lock_token: None,
            locked_until: None,
            locked_by: None,
            dead_letter_reason: None,
            dead_letter_description: None,
        }
    }

    #[test]
    fn test_ttl_expiry() {
        let message = make_message();
        assert!(!message.is_expired(message.enqueued_time));
        assert!(message.is_expired(message.enqueued_time + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_property_value_untagged_json() {
        let raw = r#"{"priority":"high","count":3,"ratio":0.5,"armed":true,"note":null}"#;
        let props: BTreeMap<String, PropertyValue> =
            serde_json::from_str(raw).expect("property map should deserialize");
        assert_eq!(props["priority"], PropertyValue::String("high".to_string()));
        assert_eq!(props["count"], PropertyValue::Int(3));
        assert_eq!(props["ratio"], PropertyValue::Float(0.5));
        assert_eq!(props["armed"], PropertyValue::Bool(true));
        assert_eq!(props["note"], PropertyValue::Null);
    }

    #[test]
    fn test_received_message_pascal_case() {
        let mut message = make_message();
        message.lock_token = Some(LockToken::generate());
        let received = ReceivedMessage::from_message(&message);
        let json = serde_json::to_value(&received).expect("should serialize");
        assert!(json.get("MessageId").is_some());
        assert!(json.get("SequenceNumber").is_some());
        assert!(json.get("LockToken").is_some());
    }

    #[test]
    fn test_dead_letter_reason_wire_strings() {
        assert_eq!(DeadLetterReason::TtlExpired.as_str(), "TTLExpired");
        assert_eq!(
            DeadLetterReason::from_wire("MaxDeliveryCountExceeded"),
            DeadLetterReason::MaxDeliveryCountExceeded
        );
        assert_eq!(
            DeadLetterReason::from_wire("operator-request"),
            DeadLetterReason::Custom("operator-request".to_string())
        );
    }
}
