//! Entity name validation

use crate::{
    BusError, EntityError, DEFAULT_RULE_NAME, MAX_QUEUE_NAME_LENGTH,
    MAX_SUBSCRIPTION_NAME_LENGTH,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Words that cannot be used as queue or topic names.
const RESERVED_WORDS: &[&str] = &[
    "system", "null", "true", "false", "exec", "drop", "delete", "insert", "update", "create",
    "alter", "grant", "revoke",
];

/// Characters that are rejected outright in queue/topic names.
const FORBIDDEN_CHARS: &[char] = &[
    '%', '&', '?', '#', '@', '!', '*', '(', ')', '<', '>', '=', '+',
];

/// Anchored alphanumeric boundaries, inner chars from the documented set.
/// Segment separators ('/') are legal between segments but not doubled and
/// not at either end.
static ENTITY_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_./-]*[A-Za-z0-9]$|^[A-Za-z0-9]$").unwrap());

static SUBSCRIPTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*[A-Za-z0-9]$|^[A-Za-z0-9]$").unwrap());

fn invalid(name: &str, reason: &str) -> BusError {
    BusError::Entity(EntityError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Validate a queue or topic name against the namespace rules.
pub fn validate_entity_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(invalid(name, "name must not be empty"));
    }
    if name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(invalid(
            name,
            &format!("name exceeds {} characters", MAX_QUEUE_NAME_LENGTH),
        ));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(invalid(name, &format!("character '{}' is not allowed", c)));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(invalid(name, "name must not begin or end with '/'"));
    }
    if name.contains("//") || name.contains("__") || name.contains("..") {
        return Err(invalid(
            name,
            "name must not contain '//', '__', or '..'",
        ));
    }
    if !ENTITY_NAME_RE.is_match(name) {
        return Err(invalid(
            name,
            "name must start and end with a letter or digit and use only letters, digits, '_', '-', '.', or '/'",
        ));
    }
    if RESERVED_WORDS.contains(&name.to_lowercase().as_str()) {
        return Err(invalid(name, "name is a reserved word"));
    }
    Ok(())
}

/// Validate a subscription name: 1-50 chars, alphanumeric and '-' only.
pub fn validate_subscription_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(invalid(name, "name must not be empty"));
    }
    if name.len() > MAX_SUBSCRIPTION_NAME_LENGTH {
        return Err(invalid(
            name,
            &format!("name exceeds {} characters", MAX_SUBSCRIPTION_NAME_LENGTH),
        ));
    }
    if !SUBSCRIPTION_NAME_RE.is_match(name) {
        return Err(invalid(
            name,
            "name must use only letters, digits, and '-', with alphanumeric first and last characters",
        ));
    }
    Ok(())
}

/// Validate a rule name. The reserved "$Default" name is always legal; every
/// other rule name follows the subscription naming rules.
pub fn validate_rule_name(name: &str) -> Result<(), BusError> {
    if name == DEFAULT_RULE_NAME {
        return Ok(());
    }
    validate_subscription_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_entity_names() {
        for name in ["orders", "orders-v2", "a", "team.orders_in", "region/orders", "Q1"] {
            validate_entity_name(name).unwrap_or_else(|e| panic!("{} rejected: {}", name, e));
        }
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        for name in ["or?ders", "queue#1", "a=b", "x+y", "paren(1)"] {
            assert!(validate_entity_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_rejects_bad_boundaries() {
        for name in ["/orders", "orders/", "-orders", "orders.", "_x"] {
            assert!(validate_entity_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_rejects_doubled_separators() {
        for name in ["a//b", "a__b", "a..b"] {
            assert!(validate_entity_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_rejects_reserved_words() {
        for name in ["system", "NULL", "Drop", "true"] {
            assert!(validate_entity_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_rejects_overlong_names() {
        let long = "a".repeat(261);
        assert!(validate_entity_name(&long).is_err());
        assert!(validate_entity_name(&"a".repeat(260)).is_ok());
    }

    #[test]
    fn test_subscription_names() {
        assert!(validate_subscription_name("high-priority").is_ok());
        assert!(validate_subscription_name("s").is_ok());
        assert!(validate_subscription_name("has.dot").is_err());
        assert!(validate_subscription_name(&"s".repeat(51)).is_err());
    }

    #[test]
    fn test_default_rule_name_allowed() {
        assert!(validate_rule_name("$Default").is_ok());
        assert!(validate_rule_name("$Other").is_err());
        assert!(validate_rule_name("priority-high").is_ok());
    }
}
