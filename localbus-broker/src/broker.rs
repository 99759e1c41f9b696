//! The broker engine facade
//!
//! Ties the entity store, message lifecycle, lock manager, dispatcher, and
//! rate limiter together. Locking discipline:
//! - one RwLock over the top-level entity maps;
//! - one mutex per queue/subscription guarding its message stores, lock set,
//!   and session table;
//! - cross-entity work (fan-out) snapshots the subscription list under the
//!   read lock, then locks one subscription at a time in declaration order.
//!
//! Wall-clock time is captured once per operation at entry; all lifecycle
//! code below takes that instant explicitly.

use crate::dispatch::{rule_set_matches, subscription_copy};
use crate::lifecycle::{self, EntitySettings};
use crate::locks::{clamp_lock_duration, SessionLock, SessionTable};
use crate::messages::MessageStore;
use crate::rate::RateLimiter;
use crate::store::{EntityStore, QueueState, SubscriptionState, TopicState};
use chrono::Utc;
use localbus_core::{
    BrokerConfig, BusError, BusResult, DeadLetterReason, EntityError, EntityKind, LockToken,
    MessageError, OperationKind, OperationalError, ReceiveMode, ReceivedMessage,
    SendMessageRequest, SendReceipt, Timestamp,
};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Which sub-queue of an entity an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueue {
    Active,
    DeadLetter,
}

/// Per-operation deadline, defaulted from the operation kind. In-memory
/// operations finish far inside these limits; the check exists so a stalled
/// caller observes `OperationTimeout` instead of partial work.
struct Deadline {
    kind: OperationKind,
    started: Instant,
}

impl Deadline {
    fn start(kind: OperationKind) -> Self {
        Self {
            kind,
            started: Instant::now(),
        }
    }

    fn check(&self) -> BusResult<()> {
        let limit = self.kind.default_timeout();
        if self.started.elapsed() > limit {
            return Err(BusError::Operation(OperationalError::Timeout {
                operation: self.kind.as_str().to_string(),
                seconds: limit.as_secs_f64(),
            }));
        }
        Ok(())
    }
}

/// The lifecycle-facing slice of one locked entity.
struct Channel<'a> {
    settings: EntitySettings,
    store: &'a mut MessageStore,
    dlq: &'a mut MessageStore,
    sessions: &'a mut SessionTable,
}

/// Settings a DLQ sub-queue runs under: no sessions, no re-dead-lettering.
fn dead_letter_settings(settings: &EntitySettings) -> EntitySettings {
    EntitySettings {
        lock_duration: settings.lock_duration,
        max_delivery_count: u32::MAX,
        requires_session: false,
        dead_letter_on_expire: false,
        default_ttl: settings.default_ttl,
    }
}

fn invalid_op(operation: &str, reason: &str) -> BusError {
    BusError::Operation(OperationalError::InvalidOperation {
        operation: operation.to_string(),
        reason: reason.to_string(),
    })
}

fn not_found(entity_kind: EntityKind, name: &str) -> BusError {
    BusError::Entity(EntityError::NotFound {
        entity_kind,
        name: name.to_string(),
    })
}

/// The in-memory broker.
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) entities: RwLock<EntityStore>,
    pub(crate) rate: RateLimiter,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> BusResult<Self> {
        config.validate()?;
        Ok(Self {
            rate: RateLimiter::new(config.rates.clone()),
            entities: RwLock::new(EntityStore::new()),
            config,
        })
    }

    /// A broker with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BrokerConfig::default()).expect("default configuration validates")
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The rate limiter, exposed for per-entity overrides and test resets.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    // ------------------------------------------------------------------
    // Handle lookup
    // ------------------------------------------------------------------

    fn queue_handle(&self, name: &str) -> BusResult<Arc<Mutex<QueueState>>> {
        let entities = self.entities.read().expect("entity store lock");
        entities
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(EntityKind::Queue, name))
    }

    fn topic_handle(&self, name: &str) -> BusResult<Arc<Mutex<TopicState>>> {
        let entities = self.entities.read().expect("entity store lock");
        entities
            .topics
            .get(name)
            .map(|entry| Arc::clone(&entry.state))
            .ok_or_else(|| not_found(EntityKind::Topic, name))
    }

    fn subscription_handle(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> BusResult<Arc<Mutex<SubscriptionState>>> {
        let entities = self.entities.read().expect("entity store lock");
        let entry = entities
            .topics
            .get(topic_name)
            .ok_or_else(|| not_found(EntityKind::Topic, topic_name))?;
        entry.subscriptions.get(subscription_name).cloned().ok_or_else(|| {
            not_found(
                EntityKind::Subscription,
                &format!("{}/{}", topic_name, subscription_name),
            )
        })
    }

    pub(crate) fn with_queue<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut QueueState) -> BusResult<R>,
    ) -> BusResult<R> {
        let handle = self.queue_handle(name)?;
        let mut state = handle.lock().expect("queue mutex");
        if state.deleted {
            return Err(not_found(EntityKind::Queue, name));
        }
        f(&mut state)
    }

    pub(crate) fn with_topic<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut TopicState) -> BusResult<R>,
    ) -> BusResult<R> {
        let handle = self.topic_handle(name)?;
        let mut state = handle.lock().expect("topic mutex");
        if state.deleted {
            return Err(not_found(EntityKind::Topic, name));
        }
        f(&mut state)
    }

    pub(crate) fn with_subscription<R>(
        &self,
        topic_name: &str,
        subscription_name: &str,
        f: impl FnOnce(&mut SubscriptionState) -> BusResult<R>,
    ) -> BusResult<R> {
        let handle = self.subscription_handle(topic_name, subscription_name)?;
        let mut state = handle.lock().expect("subscription mutex");
        if state.deleted {
            return Err(not_found(
                EntityKind::Subscription,
                &format!("{}/{}", topic_name, subscription_name),
            ));
        }
        f(&mut state)
    }

    fn queue_channel<R>(
        &self,
        name: &str,
        sub_queue: SubQueue,
        f: impl FnOnce(&BrokerConfig, Channel<'_>) -> BusResult<R>,
    ) -> BusResult<R> {
        self.with_queue(name, |state| {
            let settings = state.settings();
            match sub_queue {
                SubQueue::Active => f(
                    &self.config,
                    Channel {
                        settings,
                        store: &mut state.store,
                        dlq: &mut state.dlq,
                        sessions: &mut state.sessions,
                    },
                ),
                SubQueue::DeadLetter => {
                    // Nothing can be re-dead-lettered or session-routed out
                    // of a DLQ, so the overflow stores stay empty.
                    let mut overflow = MessageStore::new(false);
                    let mut no_sessions = SessionTable::new();
                    f(
                        &self.config,
                        Channel {
                            settings: dead_letter_settings(&settings),
                            store: &mut state.dlq,
                            dlq: &mut overflow,
                            sessions: &mut no_sessions,
                        },
                    )
                }
            }
        })
    }

    fn subscription_channel<R>(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        f: impl FnOnce(&BrokerConfig, Channel<'_>) -> BusResult<R>,
    ) -> BusResult<R> {
        self.with_subscription(topic_name, subscription_name, |state| {
            let settings = state.settings();
            match sub_queue {
                SubQueue::Active => f(
                    &self.config,
                    Channel {
                        settings,
                        store: &mut state.store,
                        dlq: &mut state.dlq,
                        sessions: &mut state.sessions,
                    },
                ),
                SubQueue::DeadLetter => {
                    let mut overflow = MessageStore::new(false);
                    let mut no_sessions = SessionTable::new();
                    f(
                        &self.config,
                        Channel {
                            settings: dead_letter_settings(&settings),
                            store: &mut state.dlq,
                            dlq: &mut overflow,
                            sessions: &mut no_sessions,
                        },
                    )
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Queue message operations
    // ------------------------------------------------------------------

    /// Send one message to a queue.
    pub fn send(&self, queue_name: &str, request: SendMessageRequest) -> BusResult<SendReceipt> {
        self.rate.check_queue(queue_name, 1)?;
        let deadline = Deadline::start(OperationKind::Send);
        let now = Utc::now();

        self.with_queue(queue_name, |state| {
            deadline.check()?;
            let props = state.description.properties.clone();

            if props.requires_session && request.session_id.is_none() {
                return Err(invalid_op(
                    "send",
                    "the queue requires sessions; set a session id on the message",
                ));
            }

            let sequence = state.store.assign_sequence();
            let message = lifecycle::build_message(
                request,
                sequence,
                props.default_message_time_to_live,
                now,
            );

            let size = message.size_in_bytes();
            if size > self.config.max_message_size {
                return Err(BusError::Message(MessageError::SizeExceeded {
                    actual: size,
                    max: self.config.max_message_size,
                }));
            }

            let receipt = SendReceipt {
                message_id: message.message_id.clone(),
                sequence_number: message.sequence_number,
            };

            // A duplicate within the detection window is silently
            // acknowledged and not stored.
            if props.requires_duplicate_detection
                && state.store.is_duplicate(
                    &message.message_id,
                    props.duplicate_detection_history_window,
                    now,
                )
            {
                return Ok(receipt);
            }

            state.store.enqueue(message, now);
            Ok(receipt)
        })
    }

    /// Receive up to `max` messages from a queue sub-queue. Non-blocking:
    /// returns fewer (or none) when the queue is drained.
    pub fn receive(
        &self,
        queue_name: &str,
        sub_queue: SubQueue,
        mode: ReceiveMode,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        self.rate.check_queue(queue_name, max.max(1) as u32)?;
        let deadline = Deadline::start(OperationKind::Receive);
        let now = Utc::now();

        self.queue_channel(queue_name, sub_queue, |config, channel| {
            deadline.check()?;
            receive_on_channel(config, channel, mode, max, None, now)
        })
    }

    /// Browse without locking or delivery-count changes.
    pub fn peek(
        &self,
        queue_name: &str,
        sub_queue: SubQueue,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        let now = Utc::now();
        self.queue_channel(queue_name, sub_queue, |_, channel| {
            let messages =
                lifecycle::peek(channel.store, channel.dlq, &channel.settings, max, now);
            Ok(messages.iter().map(ReceivedMessage::from_message).collect())
        })
    }

    pub fn complete(
        &self,
        queue_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.queue_channel(queue_name, sub_queue, |_, channel| {
            lifecycle::complete(
                channel.store,
                channel.dlq,
                &channel.settings,
                message_id,
                lock_token,
                now,
            )
        })
    }

    pub fn abandon(
        &self,
        queue_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.queue_channel(queue_name, sub_queue, |_, channel| {
            lifecycle::abandon(
                channel.store,
                channel.dlq,
                &channel.settings,
                message_id,
                lock_token,
                now,
            )
        })
    }

    /// Move a locked message to the queue's DLQ. The reason defaults to
    /// `ProcessingError`.
    pub fn dead_letter(
        &self,
        queue_name: &str,
        message_id: &str,
        lock_token: &LockToken,
        reason: Option<String>,
        description: Option<String>,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |_, channel| {
            lifecycle::dead_letter(
                channel.store,
                channel.dlq,
                &channel.settings,
                message_id,
                lock_token,
                reason.as_deref().map(DeadLetterReason::from_wire),
                description,
                now,
            )
        })
    }

    /// Renew a message lock, returning the new locked-until instant.
    pub fn renew_lock(
        &self,
        queue_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<Timestamp> {
        let deadline = Deadline::start(OperationKind::Lock);
        let now = Utc::now();
        self.queue_channel(queue_name, sub_queue, |config, channel| {
            deadline.check()?;
            lifecycle::renew_lock(
                channel.store,
                channel.dlq,
                &channel.settings,
                config,
                message_id,
                lock_token,
                now,
            )
        })
    }

    // ------------------------------------------------------------------
    // Queue sessions
    // ------------------------------------------------------------------

    /// Lock any session that has deliverable messages.
    pub fn accept_next_session(
        &self,
        queue_name: &str,
        owner: Option<String>,
    ) -> BusResult<SessionLock> {
        let deadline = Deadline::start(OperationKind::Session);
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |config, channel| {
            deadline.check()?;
            accept_session_on_channel(config, channel, None, owner, now)
        })
    }

    /// Lock a specific session.
    pub fn accept_session(
        &self,
        queue_name: &str,
        session_id: &str,
        owner: Option<String>,
    ) -> BusResult<SessionLock> {
        let deadline = Deadline::start(OperationKind::Session);
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |config, channel| {
            deadline.check()?;
            accept_session_on_channel(config, channel, Some(session_id), owner, now)
        })
    }

    /// Receive from a held session. Messages come back in strict sequence
    /// order and only to the session-lock holder.
    pub fn receive_session(
        &self,
        queue_name: &str,
        session_id: &str,
        session_token: &LockToken,
        mode: ReceiveMode,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        self.rate.check_queue(queue_name, max.max(1) as u32)?;
        let deadline = Deadline::start(OperationKind::Receive);
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |config, channel| {
            deadline.check()?;
            receive_on_channel(
                config,
                channel,
                mode,
                max,
                Some((session_id, session_token)),
                now,
            )
        })
    }

    pub fn renew_session_lock(
        &self,
        queue_name: &str,
        session_id: &str,
        session_token: &LockToken,
    ) -> BusResult<Timestamp> {
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |config, channel| {
            let duration = clamp_lock_duration(config, channel.settings.lock_duration);
            channel
                .sessions
                .renew(session_id, session_token, duration, now)
        })
    }

    pub fn release_session(
        &self,
        queue_name: &str,
        session_id: &str,
        session_token: &LockToken,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |_, channel| {
            channel.sessions.release(session_id, session_token, now)
        })
    }

    pub fn get_session_state(
        &self,
        queue_name: &str,
        session_id: &str,
        session_token: &LockToken,
    ) -> BusResult<Option<serde_json::Value>> {
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |_, channel| {
            channel.sessions.check_lock(session_id, session_token, now)?;
            Ok(channel.sessions.get_state(session_id))
        })
    }

    pub fn set_session_state(
        &self,
        queue_name: &str,
        session_id: &str,
        session_token: &LockToken,
        state: serde_json::Value,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.queue_channel(queue_name, SubQueue::Active, |_, channel| {
            channel.sessions.check_lock(session_id, session_token, now)?;
            channel.sessions.set_state(session_id, state);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Topic publish and fan-out
    // ------------------------------------------------------------------

    /// Publish to a topic: assign the topic sequence number, then fan out an
    /// independent copy to every subscription whose rule set matches. The
    /// subscription list is snapshotted at the start, so subscriptions
    /// created mid-publish do not observe the message.
    pub fn publish(&self, topic_name: &str, request: SendMessageRequest) -> BusResult<SendReceipt> {
        self.rate.check_topic(topic_name, 1)?;
        let deadline = Deadline::start(OperationKind::Send);
        let now = Utc::now();

        let subscriptions: Vec<Arc<Mutex<SubscriptionState>>> = {
            let entities = self.entities.read().expect("entity store lock");
            let entry = entities
                .topics
                .get(topic_name)
                .ok_or_else(|| not_found(EntityKind::Topic, topic_name))?;
            entry
                .subscriptions
                .iter()
                .map(|(_, handle)| Arc::clone(handle))
                .collect()
        };

        let mut duplicate = false;
        let message = self.with_topic(topic_name, |topic| {
            deadline.check()?;
            let props = topic.description.properties.clone();
            let sequence = topic.assign_sequence();
            let message = lifecycle::build_message(
                request,
                sequence,
                props.default_message_time_to_live,
                now,
            );

            let size = message.size_in_bytes();
            if size > self.config.max_message_size {
                return Err(BusError::Message(MessageError::SizeExceeded {
                    actual: size,
                    max: self.config.max_message_size,
                }));
            }

            if props.requires_duplicate_detection
                && topic.dedup.is_duplicate(
                    &message.message_id,
                    props.duplicate_detection_history_window,
                    now,
                )
            {
                duplicate = true;
            }
            Ok(message)
        })?;

        let receipt = SendReceipt {
            message_id: message.message_id.clone(),
            sequence_number: message.sequence_number,
        };

        if duplicate {
            return Ok(receipt);
        }

        // One subscription at a time, in declaration order. A filter error
        // is consumed locally: it dead-letters on that subscription (when
        // configured) and never disturbs the others.
        for handle in subscriptions {
            let mut subscription = handle.lock().expect("subscription mutex");
            if subscription.deleted {
                continue;
            }
            let matched = rule_set_matches(
                &subscription.rules,
                &message,
                self.config.filter_timeout,
                self.config.case_sensitive_properties,
            );
            match matched {
                Ok(true) => {
                    let copy = subscription_copy(&message);
                    subscription.store.enqueue(copy, now);
                }
                Ok(false) => {}
                Err(err) => {
                    if subscription
                        .description
                        .properties
                        .dead_lettering_on_filter_evaluation_exceptions
                    {
                        let copy = subscription_copy(&message);
                        lifecycle::place_in_dlq(
                            &mut subscription.dlq,
                            copy,
                            DeadLetterReason::FilterEvaluationError,
                            Some(err.to_string()),
                            now,
                        );
                    }
                }
            }
        }

        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Subscription message operations
    // ------------------------------------------------------------------

    pub fn receive_from_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        mode: ReceiveMode,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        self.rate
            .check_subscription(topic_name, subscription_name, max.max(1) as u32)?;
        let deadline = Deadline::start(OperationKind::Receive);
        let now = Utc::now();
        self.subscription_channel(topic_name, subscription_name, sub_queue, |config, channel| {
            deadline.check()?;
            receive_on_channel(config, channel, mode, max, None, now)
        })
    }

    pub fn peek_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        let now = Utc::now();
        self.subscription_channel(topic_name, subscription_name, sub_queue, |_, channel| {
            let messages =
                lifecycle::peek(channel.store, channel.dlq, &channel.settings, max, now);
            Ok(messages.iter().map(ReceivedMessage::from_message).collect())
        })
    }

    pub fn complete_subscription_message(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.subscription_channel(topic_name, subscription_name, sub_queue, |_, channel| {
            lifecycle::complete(
                channel.store,
                channel.dlq,
                &channel.settings,
                message_id,
                lock_token,
                now,
            )
        })
    }

    pub fn abandon_subscription_message(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.subscription_channel(topic_name, subscription_name, sub_queue, |_, channel| {
            lifecycle::abandon(
                channel.store,
                channel.dlq,
                &channel.settings,
                message_id,
                lock_token,
                now,
            )
        })
    }

    pub fn dead_letter_subscription_message(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: &str,
        lock_token: &LockToken,
        reason: Option<String>,
        description: Option<String>,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.subscription_channel(
            topic_name,
            subscription_name,
            SubQueue::Active,
            |_, channel| {
                lifecycle::dead_letter(
                    channel.store,
                    channel.dlq,
                    &channel.settings,
                    message_id,
                    lock_token,
                    reason.as_deref().map(DeadLetterReason::from_wire),
                    description,
                    now,
                )
            },
        )
    }

    pub fn renew_subscription_lock(
        &self,
        topic_name: &str,
        subscription_name: &str,
        sub_queue: SubQueue,
        message_id: &str,
        lock_token: &LockToken,
    ) -> BusResult<Timestamp> {
        let deadline = Deadline::start(OperationKind::Lock);
        let now = Utc::now();
        self.subscription_channel(topic_name, subscription_name, sub_queue, |config, channel| {
            deadline.check()?;
            lifecycle::renew_lock(
                channel.store,
                channel.dlq,
                &channel.settings,
                config,
                message_id,
                lock_token,
                now,
            )
        })
    }

    // ------------------------------------------------------------------
    // Subscription sessions
    // ------------------------------------------------------------------

    pub fn accept_next_subscription_session(
        &self,
        topic_name: &str,
        subscription_name: &str,
        owner: Option<String>,
    ) -> BusResult<SessionLock> {
        let deadline = Deadline::start(OperationKind::Session);
        let now = Utc::now();
        self.subscription_channel(
            topic_name,
            subscription_name,
            SubQueue::Active,
            |config, channel| {
                deadline.check()?;
                accept_session_on_channel(config, channel, None, owner, now)
            },
        )
    }

    pub fn accept_subscription_session(
        &self,
        topic_name: &str,
        subscription_name: &str,
        session_id: &str,
        owner: Option<String>,
    ) -> BusResult<SessionLock> {
        let deadline = Deadline::start(OperationKind::Session);
        let now = Utc::now();
        self.subscription_channel(
            topic_name,
            subscription_name,
            SubQueue::Active,
            |config, channel| {
                deadline.check()?;
                accept_session_on_channel(config, channel, Some(session_id), owner, now)
            },
        )
    }

    pub fn receive_subscription_session(
        &self,
        topic_name: &str,
        subscription_name: &str,
        session_id: &str,
        session_token: &LockToken,
        mode: ReceiveMode,
        max: usize,
    ) -> BusResult<Vec<ReceivedMessage>> {
        self.rate
            .check_subscription(topic_name, subscription_name, max.max(1) as u32)?;
        let deadline = Deadline::start(OperationKind::Receive);
        let now = Utc::now();
        self.subscription_channel(
            topic_name,
            subscription_name,
            SubQueue::Active,
            |config, channel| {
                deadline.check()?;
                receive_on_channel(
                    config,
                    channel,
                    mode,
                    max,
                    Some((session_id, session_token)),
                    now,
                )
            },
        )
    }
}

// ============================================================================
// CHANNEL-LEVEL OPERATIONS
// ============================================================================

/// Receive on one locked entity. Session entities demand a live session
/// lock; plain entities reject session-scoped receives.
fn receive_on_channel(
    config: &BrokerConfig,
    channel: Channel<'_>,
    mode: ReceiveMode,
    max: usize,
    session: Option<(&str, &LockToken)>,
    now: Timestamp,
) -> BusResult<Vec<ReceivedMessage>> {
    let session_id = if channel.settings.requires_session {
        let (session_id, token) = session.ok_or_else(|| {
            invalid_op(
                "receive",
                "the entity requires sessions; accept a session lock first",
            )
        })?;
        channel.sessions.expire(now);
        channel.sessions.check_lock(session_id, token, now)?;
        Some(session_id)
    } else {
        if session.is_some() {
            return Err(invalid_op("receive", "the entity is not session-enabled"));
        }
        None
    };

    let owner = session_id.map(str::to_string);
    let messages = lifecycle::receive(
        channel.store,
        channel.dlq,
        &channel.settings,
        config,
        mode,
        max,
        session_id,
        owner.as_deref(),
        now,
    );
    Ok(messages.iter().map(ReceivedMessage::from_message).collect())
}

/// Accept a session lock: a named session, or the next one with deliverable
/// messages.
fn accept_session_on_channel(
    config: &BrokerConfig,
    channel: Channel<'_>,
    session_id: Option<&str>,
    owner: Option<String>,
    now: Timestamp,
) -> BusResult<SessionLock> {
    if !channel.settings.requires_session {
        return Err(invalid_op(
            "accept_session",
            "the entity is not session-enabled",
        ));
    }

    // Bring the store up to date so scheduled messages count as deliverable.
    lifecycle::settle(channel.store, channel.dlq, &channel.settings, now);
    channel.sessions.expire(now);

    let duration = clamp_lock_duration(config, channel.settings.lock_duration);
    match session_id {
        Some(session_id) => channel.sessions.accept(session_id, duration, owner, now),
        None => channel
            .sessions
            .accept_next(channel.store, duration, owner, now),
    }
}
