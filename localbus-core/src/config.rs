//! Broker configuration

use crate::{BusError, BusResult, OperationalError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Timeout defaults (seconds)
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(14 * 86400);

// Size limits
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024;
pub const MAX_QUEUE_NAME_LENGTH: usize = 260;
pub const MAX_TOPIC_NAME_LENGTH: usize = 260;
pub const MAX_SUBSCRIPTION_NAME_LENGTH: usize = 50;

// Quota limits
pub const MAX_QUEUES: usize = 100;
pub const MAX_TOPICS: usize = 100;
pub const MAX_SUBSCRIPTIONS_PER_TOPIC: usize = 2000;
pub const MAX_RULES_PER_SUBSCRIPTION: usize = 100;

/// Kind of externally-visible operation, used to pick a default deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Send,
    Receive,
    Admin,
    Lock,
    Session,
}

impl OperationKind {
    /// Default deadline for this operation kind.
    pub fn default_timeout(self) -> Duration {
        match self {
            OperationKind::Send => DEFAULT_SEND_TIMEOUT,
            OperationKind::Receive => DEFAULT_RECEIVE_TIMEOUT,
            OperationKind::Admin => DEFAULT_ADMIN_TIMEOUT,
            OperationKind::Lock => DEFAULT_LOCK_TIMEOUT,
            OperationKind::Session => DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Send => "send",
            OperationKind::Receive => "receive",
            OperationKind::Admin => "admin",
            OperationKind::Lock => "lock",
            OperationKind::Session => "session",
        }
    }
}

/// Entity count quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_queues: usize,
    pub max_topics: usize,
    pub max_subscriptions_per_topic: usize,
    pub max_rules_per_subscription: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_queues: MAX_QUEUES,
            max_topics: MAX_TOPICS,
            max_subscriptions_per_topic: MAX_SUBSCRIPTIONS_PER_TOPIC,
            max_rules_per_subscription: MAX_RULES_PER_SUBSCRIPTION,
        }
    }
}

/// Default token-bucket rates per entity kind. Burst capacity is
/// `rate * burst_multiplier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    pub queue_rate: f64,
    pub topic_rate: f64,
    pub subscription_rate: f64,
    pub burst_multiplier: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            queue_rate: 100.0,
            topic_rate: 1000.0,
            subscription_rate: 100.0,
            burst_multiplier: 2.0,
        }
    }
}

/// Master broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub quotas: QuotaConfig,
    pub rates: RateConfig,
    pub max_message_size: u64,
    /// Lock durations are clamped into [min_lock_duration, max_lock_duration]
    /// at acquisition time.
    pub min_lock_duration: Duration,
    pub max_lock_duration: Duration,
    /// Whether filter property lookup is case-sensitive.
    pub case_sensitive_properties: bool,
    /// Deadline for a single rule-set / filter evaluation pass.
    pub filter_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            quotas: QuotaConfig::default(),
            rates: RateConfig::default(),
            max_message_size: MAX_MESSAGE_SIZE,
            min_lock_duration: Duration::from_secs(1),
            max_lock_duration: Duration::from_secs(300),
            case_sensitive_properties: false,
            filter_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> BusResult<()> {
        if self.min_lock_duration.is_zero() {
            return Err(invalid_config("min_lock_duration must be positive"));
        }
        if self.max_lock_duration < self.min_lock_duration {
            return Err(invalid_config(
                "max_lock_duration must be >= min_lock_duration",
            ));
        }
        if self.max_message_size == 0 {
            return Err(invalid_config("max_message_size must be positive"));
        }
        if self.rates.queue_rate <= 0.0
            || self.rates.topic_rate <= 0.0
            || self.rates.subscription_rate <= 0.0
        {
            return Err(invalid_config("rates must be positive"));
        }
        if self.rates.burst_multiplier < 1.0 {
            return Err(invalid_config("burst_multiplier must be >= 1.0"));
        }
        if self.quotas.max_queues == 0 || self.quotas.max_topics == 0 {
            return Err(invalid_config("entity quotas must be positive"));
        }
        Ok(())
    }
}

fn invalid_config(reason: &str) -> BusError {
    BusError::Operation(OperationalError::InvalidOperation {
        operation: "configure".to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        BrokerConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn test_invalid_lock_bounds_rejected() {
        let config = BrokerConfig {
            max_lock_duration: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_operation_timeouts() {
        assert_eq!(OperationKind::Send.default_timeout(), Duration::from_secs(30));
        assert_eq!(OperationKind::Receive.default_timeout(), Duration::from_secs(60));
        assert_eq!(OperationKind::Lock.default_timeout(), Duration::from_secs(10));
    }
}
