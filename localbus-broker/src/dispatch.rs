//! Topic fan-out dispatch
//!
//! On publish, every subscription of the topic evaluates its rule set in
//! declaration order; the subscription matches iff any rule matches. SQL
//! rules run through the compiled filter AST; correlation filters are the
//! conjunction of equality checks on their specified fields, observing the
//! same null and case rules as the SQL evaluator.

use localbus_core::{
    BrokeredMessage, BusResult, CorrelationFilter, FilterError, PropertyValue, RuleDescription,
    RuleFilter,
};
use localbus_filter::types::{PropertyMap, Value};
use localbus_filter::{compile, Expr, QueryEvaluator};
use std::time::Duration;

/// A rule with its SQL filter pre-compiled. Compilation happens at rule
/// creation so a bad expression is rejected up front, not at publish time.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub description: RuleDescription,
    ast: Option<Expr>,
}

impl CompiledRule {
    pub fn compile(description: RuleDescription) -> BusResult<Self> {
        let ast = match &description.filter {
            RuleFilter::Sql { expression } => compile(expression)?,
            RuleFilter::Correlation(_) | RuleFilter::True => None,
        };
        Ok(Self { description, ast })
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// Evaluate this rule against a message. Errors propagate so the caller
    /// can apply the subscription's filter-error policy.
    pub fn matches(
        &self,
        message: &BrokeredMessage,
        filter_timeout: Duration,
        case_sensitive_properties: bool,
    ) -> Result<bool, FilterError> {
        match &self.description.filter {
            RuleFilter::True => Ok(true),
            RuleFilter::Correlation(filter) => Ok(correlation_matches(filter, message)),
            RuleFilter::Sql { .. } => {
                let properties = message_property_map(message);
                let evaluator = QueryEvaluator::with_options(
                    filter_timeout,
                    Default::default(),
                    case_sensitive_properties,
                );
                evaluator.matches(self.ast.as_ref(), &properties)
            }
        }
    }
}

/// A subscription matches iff ANY of its rules matches. An empty rule set
/// (last rule deleted) matches nothing. The first rule error aborts
/// evaluation and propagates.
pub fn rule_set_matches(
    rules: &[CompiledRule],
    message: &BrokeredMessage,
    filter_timeout: Duration,
    case_sensitive_properties: bool,
) -> Result<bool, FilterError> {
    for rule in rules {
        if rule.matches(message, filter_timeout, case_sensitive_properties)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Build the property map a SQL rule sees: the user properties, with the
/// well-known system properties filled in underneath (user keys win).
pub fn message_property_map(message: &BrokeredMessage) -> PropertyMap {
    let mut map: PropertyMap = message
        .user_properties
        .iter()
        .map(|(key, value)| (key.clone(), Value::from_property(value)))
        .collect();

    let mut system = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            map.entry(key.to_string())
                .or_insert_with(|| Value::String(value.clone()));
        }
    };
    system("MessageId", &Some(message.message_id.clone()));
    system("Label", &message.label);
    system("CorrelationId", &message.correlation_id);
    system("ContentType", &message.content_type);
    system("To", &message.to);
    system("ReplyTo", &message.reply_to);
    system("SessionId", &message.session_id);

    map
}

/// Correlation filter semantics: the conjunction of equality checks on the
/// fields that are present. String equality is case-insensitive, like the
/// SQL evaluator's.
pub fn correlation_matches(filter: &CorrelationFilter, message: &BrokeredMessage) -> bool {
    let field = |expected: &Option<String>, actual: &Option<String>| match expected {
        None => true,
        Some(expected) => match actual {
            Some(actual) => expected.eq_ignore_ascii_case(actual),
            None => false,
        },
    };

    if !field(&filter.correlation_id, &message.correlation_id)
        || !field(&filter.label, &message.label)
        || !field(&filter.to, &message.to)
        || !field(&filter.reply_to, &message.reply_to)
        || !field(&filter.session_id, &message.session_id)
    {
        return false;
    }
    if let Some(expected) = &filter.message_id {
        if !expected.eq_ignore_ascii_case(&message.message_id) {
            return false;
        }
    }

    for (key, expected) in &filter.properties {
        let actual = message
            .user_properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v);
        let hit = match (expected, actual) {
            (PropertyValue::Null, None) => true,
            (PropertyValue::Null, Some(actual)) => actual.is_null(),
            (_, None) => false,
            (PropertyValue::String(a), Some(PropertyValue::String(b))) => {
                a.eq_ignore_ascii_case(b)
            }
            (expected, Some(actual)) => expected == actual,
        };
        if !hit {
            return false;
        }
    }

    true
}

/// Clone a publication into an independent subscription copy: same body,
/// same sequence number, cloned property maps, fresh lifecycle fields.
pub fn subscription_copy(message: &BrokeredMessage) -> BrokeredMessage {
    let mut copy = message.clone();
    copy.delivery_count = 0;
    copy.clear_lock();
    copy.dead_letter_reason = None;
    copy.dead_letter_description = None;
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use localbus_core::Timestamp;
    use std::collections::BTreeMap;

    fn rule(name: &str, filter: RuleFilter) -> CompiledRule {
        CompiledRule::compile(RuleDescription {
            name: name.to_string(),
            filter,
            action: None,
            created_at: Utc::now(),
        })
        .expect("rule compiles")
    }

    fn message_with_props(props: &[(&str, PropertyValue)]) -> BrokeredMessage {
        BrokeredMessage {
            message_id: "m1".to_string(),
            body: b"x".to_vec(),
            label: Some("orders".to_string()),
            correlation_id: Some("corr-1".to_string()),
            content_type: None,
            to: None,
            reply_to: None,
            session_id: None,
            partition_key: None,
            time_to_live: None,
            scheduled_enqueue_time: None,
            sequence_number: 1,
            enqueued_time: Utc::now(),
            user_properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            delivery_count: 0,
            lock_token: None,
            locked_until: None,
            locked_by: None,
            dead_letter_reason: None,
            dead_letter_description: None,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_true_rule_matches_everything() {
        let rule = rule("$Default", RuleFilter::True);
        let message = message_with_props(&[]);
        assert!(rule.matches(&message, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_sql_rule_on_user_properties() {
        let rule = rule("high", RuleFilter::sql("priority = 'high'"));
        let high = message_with_props(&[("priority", PropertyValue::String("high".into()))]);
        let low = message_with_props(&[("priority", PropertyValue::String("low".into()))]);
        assert!(rule.matches(&high, TIMEOUT, false).unwrap());
        assert!(!rule.matches(&low, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_sql_rule_sees_system_properties() {
        let rule = rule("labelled", RuleFilter::sql("Label = 'orders'"));
        let message = message_with_props(&[]);
        assert!(rule.matches(&message, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_user_property_shadows_system_name() {
        let rule = rule("shadow", RuleFilter::sql("Label = 'custom'"));
        let message =
            message_with_props(&[("Label", PropertyValue::String("custom".into()))]);
        assert!(rule.matches(&message, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_bad_sql_rejected_at_compile() {
        let result = CompiledRule::compile(RuleDescription {
            name: "broken".to_string(),
            filter: RuleFilter::sql("priority === 'high'"),
            action: None,
            created_at: Utc::now(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_correlation_filter_conjunction() {
        let filter = CorrelationFilter {
            correlation_id: Some("corr-1".to_string()),
            label: Some("ORDERS".to_string()),
            ..Default::default()
        };
        let message = message_with_props(&[]);
        assert!(correlation_matches(&filter, &message));

        let mismatched = CorrelationFilter {
            correlation_id: Some("corr-2".to_string()),
            ..Default::default()
        };
        assert!(!correlation_matches(&mismatched, &message));
    }

    #[test]
    fn test_correlation_filter_user_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("region".to_string(), PropertyValue::String("us".into()));
        let filter = CorrelationFilter {
            properties,
            ..Default::default()
        };

        let us = message_with_props(&[("region", PropertyValue::String("US".into()))]);
        let eu = message_with_props(&[("region", PropertyValue::String("eu".into()))]);
        assert!(correlation_matches(&filter, &us));
        assert!(!correlation_matches(&filter, &eu));
    }

    #[test]
    fn test_empty_correlation_filter_matches_all() {
        let filter = CorrelationFilter::default();
        assert!(correlation_matches(&filter, &message_with_props(&[])));
    }

    #[test]
    fn test_empty_rule_set_matches_nothing() {
        let message = message_with_props(&[]);
        assert!(!rule_set_matches(&[], &message, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_any_rule_matches() {
        let rules = vec![
            rule("never", RuleFilter::sql("priority = 'urgent'")),
            rule("always", RuleFilter::True),
        ];
        let message = message_with_props(&[]);
        assert!(rule_set_matches(&rules, &message, TIMEOUT, false).unwrap());
    }

    #[test]
    fn test_subscription_copy_resets_lifecycle() {
        let mut original = message_with_props(&[]);
        original.delivery_count = 4;
        original.lock_token = Some(localbus_core::LockToken::generate());
        let copy = subscription_copy(&original);
        assert_eq!(copy.sequence_number, original.sequence_number);
        assert_eq!(copy.delivery_count, 0);
        assert!(copy.lock_token.is_none());
        let _: Timestamp = copy.enqueued_time;
    }
}
