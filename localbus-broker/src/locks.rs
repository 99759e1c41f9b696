//! Lock management
//!
//! Message locks live in each entity's `MessageStore`; this module holds the
//! shared lock-duration clamp and the session-lock table. Expiry is lazy: a
//! lapsed lock is reaped the next time the owning entity is touched, which
//! preserves the same observable contract as a timer thread.

use crate::messages::MessageStore;
use localbus_core::{
    BrokerConfig, BusError, BusResult, LockToken, SessionError, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Clamp a configured lock duration into the broker's allowed band
/// (1 second to 5 minutes by default).
pub fn clamp_lock_duration(config: &BrokerConfig, requested: Duration) -> Duration {
    requested.clamp(config.min_lock_duration, config.max_lock_duration)
}

/// Apply a lock duration to a base instant.
pub fn lock_deadline(now: Timestamp, duration: Duration) -> Timestamp {
    now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

// ============================================================================
// SESSION LOCKS
// ============================================================================

/// An issued session lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: String,
    pub lock_token: LockToken,
    pub locked_until: Timestamp,
    pub locked_by: Option<String>,
}

impl SessionLock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.locked_until <= now
    }
}

/// Per-session bookkeeping: the state blob and the current lock, if any.
#[derive(Debug, Clone, Default)]
struct SessionEntry {
    state: Option<serde_json::Value>,
    lock: Option<SessionLock>,
}

/// Session table for one entity. Sessions exist implicitly while messages or
/// state for them do.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<String, SessionEntry>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_locked(&self, session_id: &str, now: Timestamp) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.lock.as_ref())
            .map(|lock| !lock.is_expired(now))
            .unwrap_or(false)
    }

    /// Lock a specific session. Fails with `SessionAlreadyLocked` when a
    /// live lock is held by someone else.
    pub fn accept(
        &mut self,
        session_id: &str,
        lock_duration: Duration,
        owner: Option<String>,
        now: Timestamp,
    ) -> BusResult<SessionLock> {
        if self.is_locked(session_id, now) {
            return Err(BusError::Session(SessionError::AlreadyLocked {
                session_id: session_id.to_string(),
            }));
        }

        let lock = SessionLock {
            session_id: session_id.to_string(),
            lock_token: LockToken::generate(),
            locked_until: lock_deadline(now, lock_duration),
            locked_by: owner,
        };
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .lock = Some(lock.clone());
        Ok(lock)
    }

    /// Lock any session that has deliverable messages and no live lock.
    /// Contention (sessions exist, all locked) reads differently from an
    /// empty entity.
    pub fn accept_next(
        &mut self,
        store: &MessageStore,
        lock_duration: Duration,
        owner: Option<String>,
        now: Timestamp,
    ) -> BusResult<SessionLock> {
        let candidates = store.session_ids_with_messages();
        for session_id in &candidates {
            if !self.is_locked(session_id, now) {
                return self.accept(session_id, lock_duration, owner, now);
            }
        }
        match candidates.into_iter().next() {
            Some(session_id) => Err(BusError::Session(SessionError::AlreadyLocked {
                session_id,
            })),
            None => Err(BusError::Session(SessionError::NotFound {
                session_id: "(next available)".to_string(),
            })),
        }
    }

    /// Verify the caller still holds the session lock. An expired, missing,
    /// or mismatched token reads as a lost lock.
    pub fn check_lock(
        &self,
        session_id: &str,
        token: &LockToken,
        now: Timestamp,
    ) -> BusResult<()> {
        let lock = self
            .sessions
            .get(session_id)
            .and_then(|entry| entry.lock.as_ref());
        match lock {
            Some(lock) if !lock.is_expired(now) && lock.lock_token == *token => Ok(()),
            _ => Err(BusError::Session(SessionError::LockLost {
                session_id: session_id.to_string(),
            })),
        }
    }

    /// Extend a held session lock.
    pub fn renew(
        &mut self,
        session_id: &str,
        token: &LockToken,
        lock_duration: Duration,
        now: Timestamp,
    ) -> BusResult<Timestamp> {
        self.check_lock(session_id, token, now)?;
        let entry = self
            .sessions
            .get_mut(session_id)
            .expect("checked session exists");
        let lock = entry.lock.as_mut().expect("checked lock exists");
        lock.locked_until = lock_deadline(now, lock_duration);
        Ok(lock.locked_until)
    }

    /// Release a held session lock.
    pub fn release(
        &mut self,
        session_id: &str,
        token: &LockToken,
        now: Timestamp,
    ) -> BusResult<()> {
        self.check_lock(session_id, token, now)?;
        if let Some(entry) = self.sessions.get_mut(session_id) {
            entry.lock = None;
        }
        self.prune(session_id);
        Ok(())
    }

    /// Read the session state blob.
    pub fn get_state(&self, session_id: &str) -> Option<serde_json::Value> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.state.clone())
    }

    /// Replace the session state blob.
    pub fn set_state(&mut self, session_id: &str, state: serde_json::Value) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .state = Some(state);
    }

    /// Drop expired locks; entries with no state are forgotten entirely.
    pub fn expire(&mut self, now: Timestamp) {
        let lapsed: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, entry)| {
                entry
                    .lock
                    .as_ref()
                    .map(|lock| lock.is_expired(now))
                    .unwrap_or(false)
            })
            .map(|(session_id, _)| session_id.clone())
            .collect();
        for session_id in lapsed {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.lock = None;
            }
            self.prune(&session_id);
        }
    }

    fn prune(&mut self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            if entry.lock.is_none() && entry.state.is_none() {
                self.sessions.remove(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use localbus_core::SessionError;

    #[test]
    fn test_accept_and_contention() {
        let mut table = SessionTable::new();
        let now = Utc::now();
        let duration = Duration::from_secs(60);

        let lock = table.accept("SA", duration, None, now).expect("first accept");
        assert_eq!(lock.session_id, "SA");

        let err = table.accept("SA", duration, None, now).unwrap_err();
        assert!(matches!(
            err,
            BusError::Session(SessionError::AlreadyLocked { .. })
        ));

        // After expiry the session can be re-accepted.
        let later = now + chrono::Duration::seconds(61);
        assert!(table.accept("SA", duration, None, later).is_ok());
    }

    #[test]
    fn test_check_lock_rejects_wrong_token() {
        let mut table = SessionTable::new();
        let now = Utc::now();
        let lock = table
            .accept("SA", Duration::from_secs(60), None, now)
            .expect("accepts");

        assert!(table.check_lock("SA", &lock.lock_token, now).is_ok());
        let stranger = LockToken::generate();
        assert!(table.check_lock("SA", &stranger, now).is_err());
        assert!(table
            .check_lock("SA", &lock.lock_token, now + chrono::Duration::seconds(61))
            .is_err());
    }

    #[test]
    fn test_renew_extends_lock() {
        let mut table = SessionTable::new();
        let now = Utc::now();
        let lock = table
            .accept("SA", Duration::from_secs(60), None, now)
            .expect("accepts");

        let later = now + chrono::Duration::seconds(30);
        let renewed_until = table
            .renew("SA", &lock.lock_token, Duration::from_secs(60), later)
            .expect("renews");
        assert!(renewed_until > lock.locked_until);
    }

    #[test]
    fn test_state_survives_lock_release() {
        let mut table = SessionTable::new();
        let now = Utc::now();
        let lock = table
            .accept("SA", Duration::from_secs(60), None, now)
            .expect("accepts");

        table.set_state("SA", serde_json::json!({"cursor": 42}));
        table
            .release("SA", &lock.lock_token, now)
            .expect("releases");
        assert_eq!(
            table.get_state("SA"),
            Some(serde_json::json!({"cursor": 42}))
        );
    }

    #[test]
    fn test_clamp_lock_duration() {
        let config = BrokerConfig::default();
        assert_eq!(
            clamp_lock_duration(&config, Duration::from_millis(10)),
            Duration::from_secs(1)
        );
        assert_eq!(
            clamp_lock_duration(&config, Duration::from_secs(3600)),
            Duration::from_secs(300)
        );
        assert_eq!(
            clamp_lock_duration(&config, Duration::from_secs(45)),
            Duration::from_secs(45)
        );
    }
}
