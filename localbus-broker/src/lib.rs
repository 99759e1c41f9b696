//! localbus Broker - In-Memory Message Broker Engine
//!
//! The engine behind the emulator: entity store, per-entity message
//! lifecycle (schedule, deliver, lock, renew, complete, abandon,
//! dead-letter), session locking with per-session FIFO, topic fan-out with
//! SQL and correlation rules, rate limiting, and resilience primitives.
//!
//! Transport concerns (HTTP routing, Atom/XML envelopes) live outside this
//! crate; the [`Broker`] facade exposes typed requests and responses only.

pub mod admin;
pub mod broker;
pub mod dispatch;
pub mod lifecycle;
pub mod locks;
pub mod messages;
pub mod rate;
pub mod resilience;
pub mod store;

// Re-export key types for convenience
pub use admin::PutOutcome;
pub use broker::{Broker, SubQueue};
pub use dispatch::{correlation_matches, message_property_map, CompiledRule};
pub use lifecycle::EntitySettings;
pub use locks::SessionLock;
pub use messages::{DuplicateWindow, LockedEntry, MessageStore};
pub use rate::RateLimiter;
pub use resilience::{
    breaker, is_retryable, reset_breakers, with_default_timeout, with_retry, with_timeout,
    CircuitBreaker, CircuitState, RetryPolicy,
};
