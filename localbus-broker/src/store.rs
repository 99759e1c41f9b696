//! Entity store
//!
//! Owns the top-level queue and topic maps (with per-topic subscription maps
//! and per-subscription rule sets), preserving insertion order for listing.
//! The store itself sits behind one RwLock; each entity's message state sits
//! behind its own mutex, so per-entity operations serialize without blocking
//! the namespace. Deletion marks the entity state so handles cloned before
//! the removal fail rather than mutate an orphan.

use crate::dispatch::CompiledRule;
use crate::lifecycle::EntitySettings;
use crate::locks::SessionTable;
use crate::messages::{DuplicateWindow, MessageStore};
use localbus_core::{
    QueueDescription, QueueProperties, RuleDescription, RuleFilter, SequenceNumber,
    SubscriptionDescription, SubscriptionProperties, Timestamp, TopicDescription,
    TopicProperties, DEFAULT_RULE_NAME,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// ORDERED MAP
// ============================================================================

/// Name-keyed map that remembers insertion order for enumeration.
#[derive(Debug)]
pub struct OrderedMap<T> {
    entries: HashMap<String, T>,
    order: Vec<String>,
}

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T> OrderedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries.get_mut(name)
    }

    /// Insert or replace. A replaced entry keeps its original position.
    pub fn insert(&mut self, name: String, value: T) {
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let removed = self.entries.remove(name)?;
        self.order.retain(|entry| entry != name);
        Some(removed)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.order
            .iter()
            .filter_map(move |name| self.entries.get(name).map(|value| (name, value)))
    }
}

// ============================================================================
// ENTITY STATES
// ============================================================================

/// One queue: description plus its message stores and session table, all
/// guarded together by the entity mutex.
#[derive(Debug)]
pub struct QueueState {
    pub description: QueueDescription,
    pub store: MessageStore,
    pub dlq: MessageStore,
    pub sessions: SessionTable,
    pub deleted: bool,
}

impl QueueState {
    pub fn new(name: &str, properties: QueueProperties, now: Timestamp) -> Self {
        let requires_session = properties.requires_session;
        Self {
            description: QueueDescription {
                name: name.to_string(),
                properties,
                runtime_info: Default::default(),
                created_at: now,
                updated_at: now,
            },
            store: MessageStore::new(requires_session),
            dlq: MessageStore::new(false),
            sessions: SessionTable::new(),
            deleted: false,
        }
    }

    pub fn settings(&self) -> EntitySettings {
        EntitySettings::from(&self.description.properties)
    }

    /// Recompute the runtime counters from the live stores.
    pub fn refresh_runtime(&mut self) {
        let info = &mut self.description.runtime_info;
        info.active_message_count = self.store.active_count();
        info.scheduled_message_count = self.store.scheduled_count();
        info.dead_letter_message_count = self.dlq.total_count();
        info.message_count = self.store.total_count() + self.dlq.total_count();
        info.size_in_bytes = self.store.size_in_bytes() + self.dlq.size_in_bytes();
    }
}

/// One topic. Topics hold no messages past fan-out; they keep the sequence
/// counter that subscription copies inherit and the duplicate-detection
/// window.
#[derive(Debug)]
pub struct TopicState {
    pub description: TopicDescription,
    pub next_sequence: SequenceNumber,
    pub dedup: DuplicateWindow,
    pub deleted: bool,
}

impl TopicState {
    pub fn new(name: &str, properties: TopicProperties, now: Timestamp) -> Self {
        Self {
            description: TopicDescription {
                name: name.to_string(),
                properties,
                subscription_count: 0,
                created_at: now,
                updated_at: now,
            },
            next_sequence: 1,
            dedup: DuplicateWindow::new(),
            deleted: false,
        }
    }

    pub fn assign_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// One subscription: description, ordered rule set, and message state.
#[derive(Debug)]
pub struct SubscriptionState {
    pub description: SubscriptionDescription,
    pub rules: Vec<CompiledRule>,
    pub store: MessageStore,
    pub dlq: MessageStore,
    pub sessions: SessionTable,
    pub deleted: bool,
}

impl SubscriptionState {
    /// A new subscription is born with the `$Default` TRUE rule.
    pub fn new(
        topic_name: &str,
        name: &str,
        properties: SubscriptionProperties,
        now: Timestamp,
    ) -> Self {
        let requires_session = properties.requires_session;
        let default_rule = CompiledRule::compile(RuleDescription {
            name: DEFAULT_RULE_NAME.to_string(),
            filter: RuleFilter::True,
            action: None,
            created_at: now,
        })
        .expect("the TRUE filter always compiles");

        Self {
            description: SubscriptionDescription {
                topic_name: topic_name.to_string(),
                name: name.to_string(),
                properties,
                runtime_info: Default::default(),
                created_at: now,
                updated_at: now,
            },
            rules: vec![default_rule],
            store: MessageStore::new(requires_session),
            dlq: MessageStore::new(false),
            sessions: SessionTable::new(),
            deleted: false,
        }
    }

    pub fn settings(&self) -> EntitySettings {
        EntitySettings::from(&self.description.properties)
    }

    pub fn refresh_runtime(&mut self) {
        let info = &mut self.description.runtime_info;
        info.active_message_count = self.store.active_count();
        info.scheduled_message_count = self.store.scheduled_count();
        info.dead_letter_message_count = self.dlq.total_count();
        info.message_count = self.store.total_count() + self.dlq.total_count();
        info.size_in_bytes = self.store.size_in_bytes() + self.dlq.size_in_bytes();
    }

    pub fn rule_index(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|rule| rule.name() == name)
    }
}

/// A topic with its ordered subscription map.
#[derive(Debug)]
pub struct TopicEntry {
    pub state: Arc<Mutex<TopicState>>,
    pub subscriptions: OrderedMap<Arc<Mutex<SubscriptionState>>>,
}

impl TopicEntry {
    pub fn new(state: TopicState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            subscriptions: OrderedMap::new(),
        }
    }
}

// ============================================================================
// ENTITY STORE
// ============================================================================

/// Top-level maps. Guarded by one RwLock at the broker.
#[derive(Debug, Default)]
pub struct EntityStore {
    pub queues: OrderedMap<Arc<Mutex<QueueState>>>,
    pub topics: OrderedMap<TopicEntry>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}
