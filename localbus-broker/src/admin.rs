//! Admin facade
//!
//! Typed CRUD over queues, topics, subscriptions, and rules. PUT semantics
//! are idempotent: create when absent, update properties when present, with
//! the outcome distinguishing the two so the boundary can answer 201 vs 200.
//! Deletes cascade: a topic takes its subscriptions, their rules, and their
//! messages with it. `requires_session` is immutable after creation.

use crate::broker::Broker;
use crate::dispatch::CompiledRule;
use crate::store::{QueueState, SubscriptionState, TopicEntry, TopicState};
use chrono::Utc;
use localbus_core::{
    validate_entity_name, validate_rule_name, validate_subscription_name, BusError, BusResult,
    EntityError, EntityKind, OperationalError, QueueDescription, QueueProperties, QuotaError,
    RuleDescription, RuleFilter, SubscriptionDescription, SubscriptionProperties,
    TopicDescription, TopicProperties,
};
use std::sync::{Arc, Mutex};

/// Maximum page size for list operations.
const MAX_LIST_TOP: usize = 1000;

/// Outcome of an idempotent create-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
}

impl PutOutcome {
    /// HTTP status the boundary answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            PutOutcome::Created => 201,
            PutOutcome::Updated => 200,
        }
    }
}

fn not_found(entity_kind: EntityKind, name: &str) -> BusError {
    BusError::Entity(EntityError::NotFound {
        entity_kind,
        name: name.to_string(),
    })
}

fn quota_exceeded(quota_type: &str, current: usize, max: usize) -> BusError {
    BusError::Quota(QuotaError::Exceeded {
        quota_type: quota_type.to_string(),
        current: current as u64,
        max: max as u64,
        entity_name: None,
        retry_after_seconds: None,
    })
}

fn session_flag_frozen(operation: &str) -> BusError {
    BusError::Operation(OperationalError::InvalidOperation {
        operation: operation.to_string(),
        reason: "requires_session cannot be changed after creation".to_string(),
    })
}

fn clamp_top(top: usize) -> usize {
    top.min(MAX_LIST_TOP)
}

impl Broker {
    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Create or update a queue. `None` properties mean "defaults on
    /// create, no property change on update".
    pub fn create_or_update_queue(
        &self,
        name: &str,
        properties: Option<QueueProperties>,
    ) -> BusResult<(PutOutcome, QueueDescription)> {
        validate_entity_name(name)?;
        let now = Utc::now();
        let mut entities = self.entities.write().expect("entity store lock");

        if let Some(handle) = entities.queues.get(name) {
            let mut state = handle.lock().expect("queue mutex");
            if let Some(properties) = properties {
                if properties.requires_session != state.description.properties.requires_session {
                    return Err(session_flag_frozen("update_queue"));
                }
                state.description.properties = properties;
                state.description.updated_at = now;
            }
            state.refresh_runtime();
            return Ok((PutOutcome::Updated, state.description.clone()));
        }

        if entities.queues.len() >= self.config.quotas.max_queues {
            return Err(quota_exceeded(
                "queues",
                entities.queues.len(),
                self.config.quotas.max_queues,
            ));
        }

        let state = QueueState::new(name, properties.unwrap_or_default(), now);
        let description = state.description.clone();
        entities
            .queues
            .insert(name.to_string(), Arc::new(Mutex::new(state)));
        Ok((PutOutcome::Created, description))
    }

    /// Queue description with live runtime counters.
    pub fn get_queue(&self, name: &str) -> BusResult<QueueDescription> {
        self.with_queue(name, |state| {
            state.refresh_runtime();
            Ok(state.description.clone())
        })
    }

    /// List queues in creation order, with skip/top pagination.
    pub fn list_queues(&self, skip: usize, top: usize) -> BusResult<Vec<QueueDescription>> {
        let entities = self.entities.read().expect("entity store lock");
        Ok(entities
            .queues
            .iter()
            .skip(skip)
            .take(clamp_top(top))
            .map(|(_, handle)| {
                let mut state = handle.lock().expect("queue mutex");
                state.refresh_runtime();
                state.description.clone()
            })
            .collect())
    }

    /// Delete a queue with its messages and dead-letter sub-queue.
    pub fn delete_queue(&self, name: &str) -> BusResult<()> {
        let mut entities = self.entities.write().expect("entity store lock");
        let removed = entities
            .queues
            .remove(name)
            .ok_or_else(|| not_found(EntityKind::Queue, name))?;
        removed.lock().expect("queue mutex").deleted = true;
        drop(entities);
        self.rate.forget_queue(name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    pub fn create_or_update_topic(
        &self,
        name: &str,
        properties: Option<TopicProperties>,
    ) -> BusResult<(PutOutcome, TopicDescription)> {
        validate_entity_name(name)?;
        let now = Utc::now();
        let mut entities = self.entities.write().expect("entity store lock");

        if let Some(entry) = entities.topics.get(name) {
            let subscription_count = entry.subscriptions.len() as u64;
            let mut state = entry.state.lock().expect("topic mutex");
            if let Some(properties) = properties {
                state.description.properties = properties;
                state.description.updated_at = now;
            }
            state.description.subscription_count = subscription_count;
            return Ok((PutOutcome::Updated, state.description.clone()));
        }

        if entities.topics.len() >= self.config.quotas.max_topics {
            return Err(quota_exceeded(
                "topics",
                entities.topics.len(),
                self.config.quotas.max_topics,
            ));
        }

        let state = TopicState::new(name, properties.unwrap_or_default(), now);
        let description = state.description.clone();
        entities
            .topics
            .insert(name.to_string(), TopicEntry::new(state));
        Ok((PutOutcome::Created, description))
    }

    pub fn get_topic(&self, name: &str) -> BusResult<TopicDescription> {
        let entities = self.entities.read().expect("entity store lock");
        let entry = entities
            .topics
            .get(name)
            .ok_or_else(|| not_found(EntityKind::Topic, name))?;
        let subscription_count = entry.subscriptions.len() as u64;
        let mut state = entry.state.lock().expect("topic mutex");
        state.description.subscription_count = subscription_count;
        Ok(state.description.clone())
    }

    pub fn list_topics(&self, skip: usize, top: usize) -> BusResult<Vec<TopicDescription>> {
        let entities = self.entities.read().expect("entity store lock");
        Ok(entities
            .topics
            .iter()
            .skip(skip)
            .take(clamp_top(top))
            .map(|(_, entry)| {
                let subscription_count = entry.subscriptions.len() as u64;
                let mut state = entry.state.lock().expect("topic mutex");
                state.description.subscription_count = subscription_count;
                state.description.clone()
            })
            .collect())
    }

    /// Delete a topic, cascading to its subscriptions, their rules, and
    /// their messages.
    pub fn delete_topic(&self, name: &str) -> BusResult<()> {
        let mut entities = self.entities.write().expect("entity store lock");
        let removed = entities
            .topics
            .remove(name)
            .ok_or_else(|| not_found(EntityKind::Topic, name))?;
        removed.state.lock().expect("topic mutex").deleted = true;
        for (_, handle) in removed.subscriptions.iter() {
            handle.lock().expect("subscription mutex").deleted = true;
        }
        drop(entities);
        self.rate.forget_topic(name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn create_or_update_subscription(
        &self,
        topic_name: &str,
        name: &str,
        properties: Option<SubscriptionProperties>,
    ) -> BusResult<(PutOutcome, SubscriptionDescription)> {
        validate_subscription_name(name)?;
        let now = Utc::now();
        let mut entities = self.entities.write().expect("entity store lock");

        let max_subscriptions = self.config.quotas.max_subscriptions_per_topic;
        let entry = entities
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| not_found(EntityKind::Topic, topic_name))?;

        if let Some(handle) = entry.subscriptions.get(name) {
            let mut state = handle.lock().expect("subscription mutex");
            if let Some(properties) = properties {
                if properties.requires_session != state.description.properties.requires_session {
                    return Err(session_flag_frozen("update_subscription"));
                }
                state.description.properties = properties;
                state.description.updated_at = now;
            }
            state.refresh_runtime();
            return Ok((PutOutcome::Updated, state.description.clone()));
        }

        if entry.subscriptions.len() >= max_subscriptions {
            return Err(quota_exceeded(
                "subscriptions",
                entry.subscriptions.len(),
                max_subscriptions,
            ));
        }

        let state =
            SubscriptionState::new(topic_name, name, properties.unwrap_or_default(), now);
        let description = state.description.clone();
        entry
            .subscriptions
            .insert(name.to_string(), Arc::new(Mutex::new(state)));
        Ok((PutOutcome::Created, description))
    }

    pub fn get_subscription(
        &self,
        topic_name: &str,
        name: &str,
    ) -> BusResult<SubscriptionDescription> {
        self.with_subscription(topic_name, name, |state| {
            state.refresh_runtime();
            Ok(state.description.clone())
        })
    }

    pub fn list_subscriptions(
        &self,
        topic_name: &str,
        skip: usize,
        top: usize,
    ) -> BusResult<Vec<SubscriptionDescription>> {
        let entities = self.entities.read().expect("entity store lock");
        let entry = entities
            .topics
            .get(topic_name)
            .ok_or_else(|| not_found(EntityKind::Topic, topic_name))?;
        Ok(entry
            .subscriptions
            .iter()
            .skip(skip)
            .take(clamp_top(top))
            .map(|(_, handle)| {
                let mut state = handle.lock().expect("subscription mutex");
                state.refresh_runtime();
                state.description.clone()
            })
            .collect())
    }

    /// Delete a subscription with its rules and messages.
    pub fn delete_subscription(&self, topic_name: &str, name: &str) -> BusResult<()> {
        let mut entities = self.entities.write().expect("entity store lock");
        let entry = entities
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| not_found(EntityKind::Topic, topic_name))?;
        let removed = entry.subscriptions.remove(name).ok_or_else(|| {
            not_found(
                EntityKind::Subscription,
                &format!("{}/{}", topic_name, name),
            )
        })?;
        removed.lock().expect("subscription mutex").deleted = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// Create or update a rule. SQL filters compile here, so a malformed
    /// expression is rejected at rule creation with its source position.
    pub fn create_or_update_rule(
        &self,
        topic_name: &str,
        subscription_name: &str,
        name: &str,
        filter: RuleFilter,
        action: Option<String>,
    ) -> BusResult<(PutOutcome, RuleDescription)> {
        validate_rule_name(name)?;
        let now = Utc::now();
        let max_rules = self.config.quotas.max_rules_per_subscription;

        self.with_subscription(topic_name, subscription_name, |state| {
            let compiled = CompiledRule::compile(RuleDescription {
                name: name.to_string(),
                filter,
                action,
                created_at: now,
            })?;
            let description = compiled.description.clone();

            match state.rule_index(name) {
                Some(index) => {
                    state.rules[index] = compiled;
                    Ok((PutOutcome::Updated, description))
                }
                None => {
                    if state.rules.len() >= max_rules {
                        return Err(quota_exceeded("rules", state.rules.len(), max_rules));
                    }
                    state.rules.push(compiled);
                    Ok((PutOutcome::Created, description))
                }
            }
        })
    }

    pub fn get_rule(
        &self,
        topic_name: &str,
        subscription_name: &str,
        name: &str,
    ) -> BusResult<RuleDescription> {
        self.with_subscription(topic_name, subscription_name, |state| {
            state
                .rule_index(name)
                .map(|index| state.rules[index].description.clone())
                .ok_or_else(|| not_found(EntityKind::Rule, name))
        })
    }

    pub fn list_rules(
        &self,
        topic_name: &str,
        subscription_name: &str,
        skip: usize,
        top: usize,
    ) -> BusResult<Vec<RuleDescription>> {
        self.with_subscription(topic_name, subscription_name, |state| {
            Ok(state
                .rules
                .iter()
                .skip(skip)
                .take(clamp_top(top))
                .map(|rule| rule.description.clone())
                .collect())
        })
    }

    /// Delete a rule. Deleting the last rule is allowed and leaves a
    /// subscription that matches no message.
    pub fn delete_rule(
        &self,
        topic_name: &str,
        subscription_name: &str,
        name: &str,
    ) -> BusResult<()> {
        self.with_subscription(topic_name, subscription_name, |state| {
            match state.rule_index(name) {
                Some(index) => {
                    state.rules.remove(index);
                    Ok(())
                }
                None => Err(not_found(EntityKind::Rule, name)),
            }
        })
    }
}
