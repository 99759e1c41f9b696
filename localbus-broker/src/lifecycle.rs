//! Message lifecycle engine
//!
//! State machine over a message:
//!
//! ```text
//! Scheduled ──(enqueue time)──▶ Active ──receive(PeekLock)──▶ Locked
//!                                 │  ▲                          │
//!      receive(ReceiveAndDelete)──┘  └──── abandon / expiry ────┤
//!                                                               ├─ complete ─▶ (removed)
//!                                                               └─ dead-letter / max-delivery / TTL ─▶ DLQ
//! ```
//!
//! Every function takes an explicit `now` so tests can drive the clock; the
//! broker facade passes wall-clock time. Expiry is folded into
//! `settle`, run at the top of every entity-touching operation.

use crate::locks::{clamp_lock_duration, lock_deadline};
use crate::messages::{LockedEntry, MessageStore};
use localbus_core::{
    BrokerConfig, BrokeredMessage, BusError, BusResult, DeadLetterReason, LockToken,
    MessageError, QueueProperties, ReceiveMode, SubscriptionProperties, Timestamp,
};
use std::time::Duration;

/// The lifecycle-relevant slice of an entity's configuration, shared between
/// queues and subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySettings {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub requires_session: bool,
    pub dead_letter_on_expire: bool,
    pub default_ttl: Duration,
}

impl From<&QueueProperties> for EntitySettings {
    fn from(props: &QueueProperties) -> Self {
        Self {
            lock_duration: props.lock_duration,
            max_delivery_count: props.max_delivery_count,
            requires_session: props.requires_session,
            dead_letter_on_expire: props.dead_lettering_on_message_expiration,
            default_ttl: props.default_message_time_to_live,
        }
    }
}

impl From<&SubscriptionProperties> for EntitySettings {
    fn from(props: &SubscriptionProperties) -> Self {
        Self {
            lock_duration: props.lock_duration,
            max_delivery_count: props.max_delivery_count,
            requires_session: props.requires_session,
            dead_letter_on_expire: props.dead_lettering_on_message_expiration,
            default_ttl: props.default_message_time_to_live,
        }
    }
}

/// Stamp a message as dead-lettered and append it to the DLQ FIFO.
pub fn place_in_dlq(
    dlq: &mut MessageStore,
    mut message: BrokeredMessage,
    reason: DeadLetterReason,
    description: Option<String>,
    now: Timestamp,
) {
    message.clear_lock();
    message.dead_letter_reason = Some(reason);
    message.dead_letter_description = description;
    // DLQ messages do not expire again.
    message.time_to_live = None;
    message.enqueued_time = now;
    message.scheduled_enqueue_time = None;
    dlq.enqueue(message, now);
}

/// Settle the passage of time for one entity: promote due scheduled
/// messages, requeue or dead-letter expired locks, and apply TTL policy.
pub fn settle(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    now: Timestamp,
) {
    store.promote_due(now);

    // Lock expiry behaves like an abandon, except the delivery count is not
    // incremented again.
    for token in store.expired_lock_tokens(now) {
        if let Some(entry) = store.remove_locked(&token) {
            let mut message = entry.message;
            message.clear_lock();
            requeue_or_dead_letter(store, dlq, settings, message, now);
        }
    }

    for message in store.sweep_expired_ttl(now) {
        if settings.dead_letter_on_expire {
            place_in_dlq(dlq, message, DeadLetterReason::TtlExpired, None, now);
        }
        // else: removed
    }
}

/// Shared tail of abandon and lock expiry: enforce the max-delivery rule,
/// then return the message to its FIFO in sequence order.
fn requeue_or_dead_letter(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    message: BrokeredMessage,
    now: Timestamp,
) {
    if message.delivery_count >= settings.max_delivery_count {
        place_in_dlq(
            dlq,
            message,
            DeadLetterReason::MaxDeliveryCountExceeded,
            None,
            now,
        );
        return;
    }
    if message.is_expired(now) {
        if settings.dead_letter_on_expire {
            place_in_dlq(dlq, message, DeadLetterReason::TtlExpired, None, now);
        }
        return;
    }
    store.insert_active_ordered(message);
}

/// Fetch up to `max` messages. PeekLock issues a fresh UUID-v4 token per
/// message and bumps its delivery count; ReceiveAndDelete removes
/// atomically (the returned copy still shows the delivery).
///
/// The caller is responsible for session-lock validation; `session_id` must
/// be `Some` exactly when the entity requires sessions.
pub fn receive(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    config: &BrokerConfig,
    mode: ReceiveMode,
    max: usize,
    session_id: Option<&str>,
    owner: Option<&str>,
    now: Timestamp,
) -> Vec<BrokeredMessage> {
    settle(store, dlq, settings, now);

    let mut received = Vec::new();
    while received.len() < max {
        let Some(mut message) = store.take_next_active(session_id) else {
            break;
        };

        // TTL may lapse between settles.
        if message.is_expired(now) {
            if settings.dead_letter_on_expire {
                place_in_dlq(dlq, message, DeadLetterReason::TtlExpired, None, now);
            }
            continue;
        }

        message.delivery_count += 1;

        match mode {
            ReceiveMode::PeekLock => {
                let token = LockToken::generate();
                let locked_until = lock_deadline(
                    now,
                    clamp_lock_duration(config, settings.lock_duration),
                );
                message.lock_token = Some(token);
                message.locked_until = Some(locked_until);
                message.locked_by = owner.map(str::to_string);
                store.lock(
                    token,
                    LockedEntry {
                        message: message.clone(),
                        locked_until,
                        owner: owner.map(str::to_string),
                    },
                );
                received.push(message);
            }
            ReceiveMode::ReceiveAndDelete => {
                message.clear_lock();
                received.push(message);
            }
        }
    }

    received
}

/// Non-destructive browse: no locks issued, delivery counts untouched.
pub fn peek(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    max: usize,
    now: Timestamp,
) -> Vec<BrokeredMessage> {
    settle(store, dlq, settings, now);
    store.peek_active(max)
}

/// Look up a live lock, uniformly reporting expired or unknown tokens as
/// `MessageLockLost`.
fn take_live_lock(
    store: &mut MessageStore,
    message_id: &str,
    token: &LockToken,
    now: Timestamp,
) -> BusResult<LockedEntry> {
    match store.get_locked(token) {
        Some(entry) if !entry.is_expired(now) && entry.message.message_id == message_id => {
            Ok(store.remove_locked(token).expect("entry present"))
        }
        _ => Err(BusError::Message(MessageError::LockLost)),
    }
}

/// Complete: remove the message for good.
pub fn complete(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    message_id: &str,
    token: &LockToken,
    now: Timestamp,
) -> BusResult<()> {
    settle(store, dlq, settings, now);
    take_live_lock(store, message_id, token, now).map(|_| ())
}

/// Abandon: return to the FIFO head (sequence order) or dead-letter when the
/// delivery count has been exhausted.
pub fn abandon(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    message_id: &str,
    token: &LockToken,
    now: Timestamp,
) -> BusResult<()> {
    settle(store, dlq, settings, now);
    let entry = take_live_lock(store, message_id, token, now)?;
    let mut message = entry.message;
    message.clear_lock();
    requeue_or_dead_letter(store, dlq, settings, message, now);
    Ok(())
}

/// Explicit dead-letter with an optional reason and description.
pub fn dead_letter(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    message_id: &str,
    token: &LockToken,
    reason: Option<DeadLetterReason>,
    description: Option<String>,
    now: Timestamp,
) -> BusResult<()> {
    settle(store, dlq, settings, now);
    let entry = take_live_lock(store, message_id, token, now)?;
    place_in_dlq(
        dlq,
        entry.message,
        reason.unwrap_or(DeadLetterReason::ProcessingError),
        description,
        now,
    );
    Ok(())
}

/// Renew: push the lock deadline out without touching the delivery count.
pub fn renew_lock(
    store: &mut MessageStore,
    dlq: &mut MessageStore,
    settings: &EntitySettings,
    config: &BrokerConfig,
    message_id: &str,
    token: &LockToken,
    now: Timestamp,
) -> BusResult<Timestamp> {
    settle(store, dlq, settings, now);

    let locked_until = lock_deadline(
        now,
        clamp_lock_duration(config, settings.lock_duration),
    );
    match store.get_locked_mut(token) {
        Some(entry) if !entry.is_expired(now) && entry.message.message_id == message_id => {
            entry.locked_until = locked_until;
            entry.message.locked_until = Some(locked_until);
            Ok(locked_until)
        }
        _ => Err(BusError::Message(MessageError::LockLost)),
    }
}

/// Build a stored message from the send-request fields. TTL defaults from
/// the owning entity when the request does not carry one.
pub fn build_message(
    request: localbus_core::SendMessageRequest,
    sequence_number: i64,
    default_ttl: Duration,
    now: Timestamp,
) -> BrokeredMessage {
    let ttl = request
        .time_to_live
        .map(Duration::from_secs)
        .unwrap_or(default_ttl);

    BrokeredMessage {
        message_id: request
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        body: request.body.into_bytes(),
        label: request.label,
        correlation_id: request.correlation_id,
        content_type: request.content_type,
        to: request.to,
        reply_to: request.reply_to,
        session_id: request.session_id,
        partition_key: request.partition_key,
        time_to_live: Some(ttl),
        scheduled_enqueue_time: request.scheduled_enqueue_time_utc,
        sequence_number,
        enqueued_time: now,
        user_properties: request.user_properties,
        delivery_count: 0,
        lock_token: None,
        locked_until: None,
        locked_by: None,
        dead_letter_reason: None,
        dead_letter_description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use localbus_core::SendMessageRequest;

    fn settings() -> EntitySettings {
        EntitySettings {
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 3,
            requires_session: false,
            dead_letter_on_expire: false,
            default_ttl: Duration::from_secs(14 * 86400),
        }
    }

    fn send(store: &mut MessageStore, body: &str, now: Timestamp) -> BrokeredMessage {
        let sequence = store.assign_sequence();
        let message = build_message(
            SendMessageRequest::with_body(body),
            sequence,
            settings().default_ttl,
            now,
        );
        store.enqueue(message.clone(), now);
        message
    }

    #[test]
    fn test_peek_lock_then_complete() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);

        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            10,
            None,
            None,
            now,
        );
        assert_eq!(received.len(), 1);
        let message = &received[0];
        assert_eq!(message.delivery_count, 1);
        let token = message.lock_token.expect("peek-lock issues a token");
        assert_eq!(token.as_uuid().get_version_num(), 4);

        complete(
            &mut store,
            &mut dlq,
            &settings,
            &message.message_id,
            &token,
            now,
        )
        .expect("completes");

        // Queue is drained.
        let rest = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            10,
            None,
            None,
            now,
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_receive_and_delete_removes() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::ReceiveAndDelete,
            1,
            None,
            None,
            now,
        );
        assert_eq!(received.len(), 1);
        assert!(received[0].lock_token.is_none());
        assert_eq!(store.total_count(), 0);
    }

    #[test]
    fn test_abandon_increments_until_dead_letter() {
        let config = BrokerConfig::default();
        let settings = settings(); // max_delivery_count = 3
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);

        for expected_count in 1..=3u32 {
            let received = receive(
                &mut store,
                &mut dlq,
                &settings,
                &config,
                ReceiveMode::PeekLock,
                1,
                None,
                None,
                now,
            );
            let message = &received[0];
            assert_eq!(message.delivery_count, expected_count);
            abandon(
                &mut store,
                &mut dlq,
                &settings,
                &message.message_id,
                &message.lock_token.unwrap(),
                now,
            )
            .expect("abandons");
        }

        // Third abandon hit the max-delivery rule.
        assert_eq!(store.total_count(), 0);
        assert_eq!(dlq.active_count(), 1);
        let dead = dlq.take_next_active(None).unwrap();
        assert_eq!(
            dead.dead_letter_reason,
            Some(DeadLetterReason::MaxDeliveryCountExceeded)
        );
    }

    #[test]
    fn test_lock_expiry_requeues_without_extra_increment() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            now,
        );
        assert_eq!(received[0].delivery_count, 1);

        // Lock lapses; the next receive gets the message again with the
        // count bumped by the new lock acquisition only.
        let later = now + chrono::Duration::seconds(61);
        let again = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            later,
        );
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_count, 2);

        // The old token is dead.
        let err = complete(
            &mut store,
            &mut dlq,
            &settings,
            &again[0].message_id,
            &received[0].lock_token.unwrap(),
            later,
        )
        .unwrap_err();
        assert!(matches!(err, BusError::Message(MessageError::LockLost)));
    }

    #[test]
    fn test_unknown_token_is_lock_lost() {
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        let err = complete(
            &mut store,
            &mut dlq,
            &settings,
            "m-unknown",
            &LockToken::generate(),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, BusError::Message(MessageError::LockLost)));
    }

    #[test]
    fn test_explicit_dead_letter_defaults_reason() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            now,
        );
        dead_letter(
            &mut store,
            &mut dlq,
            &settings,
            &received[0].message_id,
            &received[0].lock_token.unwrap(),
            None,
            None,
            now,
        )
        .expect("dead-letters");

        let dead = dlq.take_next_active(None).unwrap();
        assert_eq!(dead.dead_letter_reason, Some(DeadLetterReason::ProcessingError));
    }

    #[test]
    fn test_renew_extends_without_delivery_increment() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        send(&mut store, "A", now);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            now,
        );
        let token = received[0].lock_token.unwrap();
        let first_deadline = received[0].locked_until.unwrap();

        let later = now + chrono::Duration::seconds(30);
        let renewed = renew_lock(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            &received[0].message_id,
            &token,
            later,
        )
        .expect("renews");
        assert!(renewed > first_deadline);
        assert_eq!(
            store.get_locked(&token).unwrap().message.delivery_count,
            1
        );
    }

    #[test]
    fn test_ttl_expiry_respects_dlq_flag() {
        let config = BrokerConfig::default();
        let mut settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        // Without dead-letter-on-expire the message just vanishes.
        let sequence = store.assign_sequence();
        let mut request = SendMessageRequest::with_body("A");
        request.time_to_live = Some(5);
        store.enqueue(build_message(request, sequence, settings.default_ttl, now), now);

        let later = now + chrono::Duration::seconds(6);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            later,
        );
        assert!(received.is_empty());
        assert_eq!(dlq.active_count(), 0);

        // With the flag set, expiry routes to the DLQ.
        settings.dead_letter_on_expire = true;
        let sequence = store.assign_sequence();
        let mut request = SendMessageRequest::with_body("B");
        request.time_to_live = Some(5);
        store.enqueue(build_message(request, sequence, settings.default_ttl, later), later);

        let even_later = later + chrono::Duration::seconds(6);
        let received = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            even_later,
        );
        assert!(received.is_empty());
        assert_eq!(dlq.active_count(), 1);
        let dead = dlq.take_next_active(None).unwrap();
        assert_eq!(dead.dead_letter_reason, Some(DeadLetterReason::TtlExpired));
    }

    #[test]
    fn test_scheduled_message_not_receivable_early() {
        let config = BrokerConfig::default();
        let settings = settings();
        let mut store = MessageStore::new(false);
        let mut dlq = MessageStore::new(false);
        let now = Utc::now();

        let sequence = store.assign_sequence();
        let mut request = SendMessageRequest::with_body("later");
        request.scheduled_enqueue_time_utc = Some(now + chrono::Duration::seconds(30));
        store.enqueue(build_message(request, sequence, settings.default_ttl, now), now);

        let early = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            now,
        );
        assert!(early.is_empty());

        let due = receive(
            &mut store,
            &mut dlq,
            &settings,
            &config,
            ReceiveMode::PeekLock,
            1,
            None,
            None,
            now + chrono::Duration::seconds(31),
        );
        assert_eq!(due.len(), 1);
    }
}
