//! # Client Rule Engine
//!
//! Declarative client-selection predicates evaluated against the attributes
//! an agent reported at check-in.
//!
//! Evaluation is pure and total: a reference to a missing attribute, a value
//! of the wrong kind, or an unparsable pattern evaluates to `false` instead of
//! failing. [`ClientRule::validate`] is the place where malformed rules are
//! rejected, before a hunt or foreman rule is persisted. Regex patterns are
//! compiled once per rule value and reused across check-ins.
//!
//! ```rust
//! use huntsman_core::models::ClientInfo;
//! use huntsman_core::rules::ClientRule;
//!
//! let rule = ClientRule::and(vec![ClientRule::os("Linux"), ClientRule::label("prod")]);
//! let client = ClientInfo::new("C.1").with_os("Linux").with_label("prod");
//! assert!(rule.matches(&client));
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HuntsmanError, Result};
use crate::models::ClientInfo;

/// Comparison operator for integer rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegerOperator {
    LessThan,
    GreaterThan,
    Equal,
}

impl IntegerOperator {
    pub fn apply(&self, actual: i64, expected: i64) -> bool {
        match self {
            Self::LessThan => actual < expected,
            Self::GreaterThan => actual > expected,
            Self::Equal => actual == expected,
        }
    }
}

/// Regex source text with its compiled form cached on first use
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulePattern {
    source: String,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl RulePattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            compiled: OnceLock::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compiled pattern; `None` when the source does not parse
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(&self.source).ok())
            .as_ref()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex().is_some_and(|re| re.is_match(text))
    }
}

impl PartialEq for RulePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for RulePattern {}

impl fmt::Debug for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.source, f)
    }
}

impl From<&str> for RulePattern {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for RulePattern {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

/// Client-selection predicate tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRule {
    /// Case-insensitive match on the reported operating system
    OsMatch { os_name: String },
    /// Client carries the label
    LabelMatch { label: String },
    /// Attribute rendered as text matches the pattern (unanchored)
    RegexMatch { field: String, pattern: RulePattern },
    IntegerCompare {
        field: String,
        operator: IntegerOperator,
        value: i64,
    },
    /// True when every child matches; an empty list matches everything
    And { rules: Vec<ClientRule> },
    /// True when any child matches; an empty list matches nothing
    Or { rules: Vec<ClientRule> },
    Not { rule: Box<ClientRule> },
}

impl ClientRule {
    pub fn os(os_name: impl Into<String>) -> Self {
        Self::OsMatch {
            os_name: os_name.into(),
        }
    }

    pub fn label(label: impl Into<String>) -> Self {
        Self::LabelMatch {
            label: label.into(),
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::RegexMatch {
            field: field.into(),
            pattern: RulePattern::new(pattern),
        }
    }

    pub fn integer(field: impl Into<String>, operator: IntegerOperator, value: i64) -> Self {
        Self::IntegerCompare {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn and(rules: Vec<ClientRule>) -> Self {
        Self::And { rules }
    }

    pub fn or(rules: Vec<ClientRule>) -> Self {
        Self::Or { rules }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(rule: ClientRule) -> Self {
        Self::Not {
            rule: Box::new(rule),
        }
    }

    /// Rule that matches every client
    pub fn match_all() -> Self {
        Self::And { rules: Vec::new() }
    }

    /// Evaluate the rule against a client
    pub fn matches(&self, client: &ClientInfo) -> bool {
        match self {
            Self::OsMatch { os_name } => client
                .os()
                .is_some_and(|os| os.eq_ignore_ascii_case(os_name)),
            Self::LabelMatch { label } => client.has_label(label),
            Self::RegexMatch { field, pattern } => {
                let Some(value) = client.attribute(field) else {
                    return false;
                };
                pattern.is_match(&value.render())
            }
            Self::IntegerCompare {
                field,
                operator,
                value,
            } => client
                .attribute(field)
                .and_then(|attr| attr.as_integer())
                .is_some_and(|actual| operator.apply(actual, *value)),
            Self::And { rules } => rules.iter().all(|rule| rule.matches(client)),
            Self::Or { rules } => rules.iter().any(|rule| rule.matches(client)),
            Self::Not { rule } => !rule.matches(client),
        }
    }

    /// Reject rules that could never be evaluated meaningfully
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::OsMatch { os_name } if os_name.trim().is_empty() => Err(
                HuntsmanError::ValidationError("os_match requires an os_name".to_string()),
            ),
            Self::LabelMatch { label } if label.trim().is_empty() => Err(
                HuntsmanError::ValidationError("label_match requires a label".to_string()),
            ),
            Self::RegexMatch { field, pattern } => {
                if field.trim().is_empty() {
                    return Err(HuntsmanError::ValidationError(
                        "regex_match requires a field".to_string(),
                    ));
                }
                Regex::new(pattern.as_str()).map_err(|e| {
                    HuntsmanError::ValidationError(format!("invalid pattern {pattern:?}: {e}"))
                })?;
                Ok(())
            }
            Self::IntegerCompare { field, .. } if field.trim().is_empty() => Err(
                HuntsmanError::ValidationError("integer_compare requires a field".to_string()),
            ),
            Self::And { rules } | Self::Or { rules } => {
                rules.iter().try_for_each(ClientRule::validate)
            }
            Self::Not { rule } => rule.validate(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::client::attributes;

    fn linux_prod() -> ClientInfo {
        ClientInfo::new("C.0000000000000001")
            .with_os("Linux")
            .with_label("prod")
            .with_attribute(attributes::HOSTNAME, "web-01.example.com")
            .with_attribute(attributes::CLIENT_VERSION, 3412)
    }

    #[test]
    fn test_os_match_is_case_insensitive() {
        assert!(ClientRule::os("linux").matches(&linux_prod()));
        assert!(!ClientRule::os("Windows").matches(&linux_prod()));
    }

    #[test]
    fn test_missing_attribute_is_false() {
        let client = ClientInfo::new("C.0000000000000002");
        assert!(!ClientRule::os("Linux").matches(&client));
        assert!(!ClientRule::regex("fqdn", ".*").matches(&client));
        assert!(!ClientRule::integer("client_version", IntegerOperator::GreaterThan, 0)
            .matches(&client));
    }

    #[test]
    fn test_regex_and_integer_rules() {
        let client = linux_prod();
        assert!(ClientRule::regex(attributes::HOSTNAME, r"^web-\d+").matches(&client));
        assert!(!ClientRule::regex(attributes::HOSTNAME, r"^db-").matches(&client));
        assert!(
            ClientRule::integer(attributes::CLIENT_VERSION, IntegerOperator::GreaterThan, 3000)
                .matches(&client)
        );
        assert!(
            ClientRule::integer(attributes::CLIENT_VERSION, IntegerOperator::Equal, 3412)
                .matches(&client)
        );
        assert!(
            !ClientRule::integer(attributes::CLIENT_VERSION, IntegerOperator::LessThan, 3412)
                .matches(&client)
        );
        // text attribute that is not numeric never compares
        assert!(
            !ClientRule::integer(attributes::HOSTNAME, IntegerOperator::Equal, 0).matches(&client)
        );
    }

    #[test]
    fn test_combinators() {
        let client = linux_prod();
        let rule = ClientRule::and(vec![
            ClientRule::os("Linux"),
            ClientRule::not(ClientRule::label("canary")),
        ]);
        assert!(rule.matches(&client));
        assert!(ClientRule::match_all().matches(&client));
        assert!(!ClientRule::or(vec![]).matches(&client));
        assert!(ClientRule::or(vec![ClientRule::os("Darwin"), ClientRule::label("prod")])
            .matches(&client));
    }

    #[test]
    fn test_invalid_regex_evaluates_false_and_fails_validation() {
        let rule = ClientRule::regex(attributes::HOSTNAME, "web-(");
        assert!(!rule.matches(&linux_prod()));
        assert!(rule.validate().is_err());
        assert!(ClientRule::not(rule).validate().is_err());
    }

    #[test]
    fn test_pattern_compiles_once_and_survives_serde() {
        let rule = ClientRule::regex(attributes::HOSTNAME, r"^web-\d+");
        let ClientRule::RegexMatch { pattern, .. } = &rule else {
            panic!("expected a regex rule");
        };
        let first = pattern.regex().unwrap();
        assert!(rule.matches(&linux_prod()));
        assert!(std::ptr::eq(first, pattern.regex().unwrap()));

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["pattern"], r"^web-\d+");
        let parsed: ClientRule = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, rule);
        assert!(parsed.matches(&linux_prod()));
    }

    #[test]
    fn test_rule_serde_shape() {
        let rule = ClientRule::integer("client_version", IntegerOperator::LessThan, 10);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "integer_compare");
        assert_eq!(json["operator"], "LESS_THAN");
        let parsed: ClientRule = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, rule);
    }
}
