//! Per-entity message containers
//!
//! Each queue, subscription, and dead-letter sub-queue owns one
//! `MessageStore` with three live views: a scheduled min-heap keyed by
//! enqueue time, an active FIFO ordered by sequence number (bucketed per
//! session when the owning entity requires sessions), and a locked map keyed
//! by lock token. Dead-lettered messages live in the entity's companion DLQ
//! store, whose active FIFO order is DLQ insertion order.

use localbus_core::{BrokeredMessage, LockToken, SequenceNumber, Timestamp};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;

// ============================================================================
// SCHEDULED VIEW
// ============================================================================

/// Heap entry ordered by (due time, sequence number).
#[derive(Debug, Clone)]
struct ScheduledEntry {
    due: Timestamp,
    sequence: SequenceNumber,
    message: BrokeredMessage,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

// ============================================================================
// LOCKED VIEW
// ============================================================================

/// A message reserved under a lock token.
#[derive(Debug, Clone)]
pub struct LockedEntry {
    pub message: BrokeredMessage,
    pub locked_until: Timestamp,
    pub owner: Option<String>,
}

impl LockedEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.locked_until <= now
    }
}

// ============================================================================
// DUPLICATE DETECTION
// ============================================================================

/// Bounded time-window set of message ids. Shared by message stores and by
/// topics, which deduplicate before fan-out without holding messages.
#[derive(Debug, Default)]
pub struct DuplicateWindow {
    order: VecDeque<(Timestamp, String)>,
    ids: HashSet<String>,
}

impl DuplicateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record in one step. A colliding id within the window is
    /// reported as a duplicate; the caller acknowledges it silently.
    pub fn is_duplicate(&mut self, message_id: &str, window: Duration, now: Timestamp) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let horizon = now - window;
        while let Some((seen_at, _)) = self.order.front() {
            if *seen_at < horizon {
                let (_, id) = self.order.pop_front().unwrap();
                self.ids.remove(&id);
            } else {
                break;
            }
        }

        if self.ids.contains(message_id) {
            return true;
        }
        self.order.push_back((now, message_id.to_string()));
        self.ids.insert(message_id.to_string());
        false
    }
}

// ============================================================================
// MESSAGE STORE
// ============================================================================

/// Message container for one entity (or one dead-letter sub-queue).
#[derive(Debug)]
pub struct MessageStore {
    requires_session: bool,
    next_sequence: SequenceNumber,
    scheduled: BinaryHeap<Reverse<ScheduledEntry>>,
    active: VecDeque<BrokeredMessage>,
    session_active: BTreeMap<String, VecDeque<BrokeredMessage>>,
    locked: HashMap<LockToken, LockedEntry>,
    dedup: DuplicateWindow,
}

impl MessageStore {
    pub fn new(requires_session: bool) -> Self {
        Self {
            requires_session,
            next_sequence: 1,
            scheduled: BinaryHeap::new(),
            active: VecDeque::new(),
            session_active: BTreeMap::new(),
            locked: HashMap::new(),
            dedup: DuplicateWindow::new(),
        }
    }

    pub fn requires_session(&self) -> bool {
        self.requires_session
    }

    /// Hand out the next sequence number. Strictly increasing per entity.
    pub fn assign_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Duplicate-detection window check. Records the id when it is new.
    /// A colliding id is silently acknowledged by the caller, not an error.
    pub fn is_duplicate(&mut self, message_id: &str, window: Duration, now: Timestamp) -> bool {
        self.dedup.is_duplicate(message_id, window, now)
    }

    /// Route an incoming message: future-scheduled messages wait in the
    /// scheduled heap, everything else lands in the active FIFO.
    pub fn enqueue(&mut self, message: BrokeredMessage, now: Timestamp) {
        if let Some(due) = message.scheduled_enqueue_time {
            if due > now {
                self.scheduled.push(Reverse(ScheduledEntry {
                    due,
                    sequence: message.sequence_number,
                    message,
                }));
                return;
            }
        }
        self.push_active_back(message);
    }

    fn push_active_back(&mut self, message: BrokeredMessage) {
        match self.session_bucket_key(&message) {
            Some(session_id) => self
                .session_active
                .entry(session_id)
                .or_default()
                .push_back(message),
            None => self.active.push_back(message),
        }
    }

    /// Insert keeping the active FIFO ordered by sequence number. Used when
    /// a message re-enters active out of send order (abandon, lock expiry,
    /// scheduled promotion).
    pub fn insert_active_ordered(&mut self, message: BrokeredMessage) {
        let sequence = message.sequence_number;
        match self.session_bucket_key(&message) {
            Some(session_id) => {
                let bucket = self.session_active.entry(session_id).or_default();
                let index = bucket
                    .iter()
                    .position(|m| m.sequence_number > sequence)
                    .unwrap_or(bucket.len());
                bucket.insert(index, message);
            }
            None => {
                let index = self
                    .active
                    .iter()
                    .position(|m| m.sequence_number > sequence)
                    .unwrap_or(self.active.len());
                self.active.insert(index, message);
            }
        }
    }

    fn session_bucket_key(&self, message: &BrokeredMessage) -> Option<String> {
        if self.requires_session {
            message.session_id.clone()
        } else {
            None
        }
    }

    /// Move every scheduled message whose time has come into active,
    /// in (due, sequence) order.
    pub fn promote_due(&mut self, now: Timestamp) {
        while let Some(Reverse(entry)) = self.scheduled.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = self.scheduled.pop().unwrap();
            self.insert_active_ordered(entry.message);
        }
    }

    /// Pop the next deliverable message. For session stores a session id
    /// must be supplied; for plain stores it must not.
    pub fn take_next_active(&mut self, session_id: Option<&str>) -> Option<BrokeredMessage> {
        if self.requires_session {
            let session_id = session_id?;
            let bucket = self.session_active.get_mut(session_id)?;
            let message = bucket.pop_front();
            if bucket.is_empty() {
                self.session_active.remove(session_id);
            }
            message
        } else {
            self.active.pop_front()
        }
    }

    /// Non-destructive view of up to `max` active messages in delivery order.
    pub fn peek_active(&self, max: usize) -> Vec<BrokeredMessage> {
        if self.requires_session {
            let mut all: Vec<&BrokeredMessage> =
                self.session_active.values().flatten().collect();
            all.sort_by_key(|m| m.sequence_number);
            all.into_iter().take(max).cloned().collect()
        } else {
            self.active.iter().take(max).cloned().collect()
        }
    }

    pub fn lock(&mut self, token: LockToken, entry: LockedEntry) {
        self.locked.insert(token, entry);
    }

    pub fn get_locked(&self, token: &LockToken) -> Option<&LockedEntry> {
        self.locked.get(token)
    }

    pub fn get_locked_mut(&mut self, token: &LockToken) -> Option<&mut LockedEntry> {
        self.locked.get_mut(token)
    }

    pub fn remove_locked(&mut self, token: &LockToken) -> Option<LockedEntry> {
        self.locked.remove(token)
    }

    /// Tokens whose locks have lapsed at `now`.
    pub fn expired_lock_tokens(&self, now: Timestamp) -> Vec<LockToken> {
        self.locked
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(token, _)| *token)
            .collect()
    }

    /// Remove and return every active message whose TTL has lapsed.
    pub fn sweep_expired_ttl(&mut self, now: Timestamp) -> Vec<BrokeredMessage> {
        let mut expired = Vec::new();

        let mut keep = VecDeque::with_capacity(self.active.len());
        for message in self.active.drain(..) {
            if message.is_expired(now) {
                expired.push(message);
            } else {
                keep.push_back(message);
            }
        }
        self.active = keep;

        let mut empty_sessions = Vec::new();
        for (session_id, bucket) in self.session_active.iter_mut() {
            let mut keep = VecDeque::with_capacity(bucket.len());
            for message in bucket.drain(..) {
                if message.is_expired(now) {
                    expired.push(message);
                } else {
                    keep.push_back(message);
                }
            }
            *bucket = keep;
            if bucket.is_empty() {
                empty_sessions.push(session_id.clone());
            }
        }
        for session_id in empty_sessions {
            self.session_active.remove(&session_id);
        }

        expired
    }

    /// Session ids that currently hold deliverable messages, in stable order.
    pub fn session_ids_with_messages(&self) -> Vec<String> {
        self.session_active
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    pub fn has_session_messages(&self, session_id: &str) -> bool {
        self.session_active
            .get(session_id)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    pub fn active_count(&self) -> u64 {
        let session: usize = self.session_active.values().map(VecDeque::len).sum();
        (self.active.len() + session) as u64
    }

    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.len() as u64
    }

    pub fn locked_count(&self) -> u64 {
        self.locked.len() as u64
    }

    pub fn total_count(&self) -> u64 {
        self.active_count() + self.scheduled_count() + self.locked_count()
    }

    pub fn size_in_bytes(&self) -> u64 {
        let active: u64 = self.active.iter().map(BrokeredMessage::size_in_bytes).sum();
        let session: u64 = self
            .session_active
            .values()
            .flatten()
            .map(BrokeredMessage::size_in_bytes)
            .sum();
        let scheduled: u64 = self
            .scheduled
            .iter()
            .map(|Reverse(entry)| entry.message.size_in_bytes())
            .sum();
        let locked: u64 = self
            .locked
            .values()
            .map(|entry| entry.message.size_in_bytes())
            .sum();
        active + session + scheduled + locked
    }
}
