use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

use super::EvaluationContext;
use crate::rules::{Rule, RuleOperator};

/// A rule that cannot be applied as configured.
#[derive(Debug, Error, PartialEq)]
pub enum RuleConfigError {
    #[error("operator '{operator}' needs a numeric operand, got {value}")]
    NonNumericOperand { operator: RuleOperator, value: Value },

    #[error("operator '{operator}' needs a list operand, got {value}")]
    NotAList { operator: RuleOperator, value: Value },

    #[error("operator '{operator}' needs a string operand, got {value}")]
    NotAString { operator: RuleOperator, value: Value },

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
}

/// Compiled `regex` rule patterns, shared across evaluations.
#[derive(Default)]
pub struct PatternCache {
    compiled: RwLock<HashMap<String, Regex>>,
    compilations: AtomicUsize,
}

impl PatternCache {
    const MAX_PATTERNS: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, pattern: &str) -> Result<Regex, RuleConfigError> {
        if let Some(re) = self.compiled.read().ok().and_then(|c| c.get(pattern).cloned()) {
            return Ok(re);
        }

        let re = Regex::new(pattern).map_err(|e| RuleConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.compilations.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut compiled) = self.compiled.write() {
            if compiled.len() >= Self::MAX_PATTERNS {
                compiled.clear();
            }
            compiled.insert(pattern.to_string(), re.clone());
        }
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.compiled.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times a pattern was actually compiled.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

/// Apply a rule to the context.
///
/// A missing attribute never matches, whatever the operator.
pub fn matches(
    rule: &Rule,
    context: &EvaluationContext,
    patterns: &PatternCache,
) -> Result<bool, RuleConfigError> {
    let Some(actual) = context.attribute(&rule.attribute) else {
        return Ok(false);
    };
    compare(rule.operator, &actual, &rule.value, patterns)
}

fn compare(
    operator: RuleOperator,
    actual: &Value,
    expected: &Value,
    patterns: &PatternCache,
) -> Result<bool, RuleConfigError> {
    match operator {
        RuleOperator::Equals => Ok(loose_eq(actual, expected)),
        RuleOperator::NotEquals => Ok(!loose_eq(actual, expected)),
        RuleOperator::In => Ok(list(operator, expected)?.iter().any(|v| loose_eq(actual, v))),
        RuleOperator::NotIn => Ok(!list(operator, expected)?.iter().any(|v| loose_eq(actual, v))),
        RuleOperator::GreaterThan => numeric(operator, actual, expected, |a, b| a > b),
        RuleOperator::GreaterThanOrEqual => numeric(operator, actual, expected, |a, b| a >= b),
        RuleOperator::LessThan => numeric(operator, actual, expected, |a, b| a < b),
        RuleOperator::LessThanOrEqual => numeric(operator, actual, expected, |a, b| a <= b),
        RuleOperator::Contains => {
            let needle = string(operator, expected)?;
            Ok(match actual {
                Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
                other => as_text(other).is_some_and(|s| s.contains(needle)),
            })
        }
        RuleOperator::StartsWith => {
            let prefix = string(operator, expected)?;
            Ok(as_text(actual).is_some_and(|s| s.starts_with(prefix)))
        }
        RuleOperator::EndsWith => {
            let suffix = string(operator, expected)?;
            Ok(as_text(actual).is_some_and(|s| s.ends_with(suffix)))
        }
        RuleOperator::Regex => {
            let re = patterns.get_or_compile(string(operator, expected)?)?;
            Ok(as_text(actual).is_some_and(|s| re.is_match(&s)))
        }
    }
}

fn list(operator: RuleOperator, value: &Value) -> Result<&Vec<Value>, RuleConfigError> {
    value.as_array().ok_or_else(|| RuleConfigError::NotAList {
        operator,
        value: value.clone(),
    })
}

fn string(operator: RuleOperator, value: &Value) -> Result<&str, RuleConfigError> {
    value.as_str().ok_or_else(|| RuleConfigError::NotAString {
        operator,
        value: value.clone(),
    })
}

// A non-numeric attribute simply fails the comparison; a non-numeric operand is misconfiguration.
fn numeric(
    operator: RuleOperator,
    actual: &Value,
    expected: &Value,
    cmp: impl Fn(f64, f64) -> bool,
) -> Result<bool, RuleConfigError> {
    let threshold = as_number(expected).ok_or_else(|| RuleConfigError::NonNumericOperand {
        operator,
        value: expected.clone(),
    })?;
    Ok(as_number(actual).is_some_and(|n| cmp(n, threshold)))
}

/// Numbers and numeric strings as `f64`.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// Two strings compare exactly. Otherwise "42" equals 42 and "true" equals true.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => {
            a == b
                || match (as_text(a), as_text(b)) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn rule(attribute: &str, operator: RuleOperator, value: Value) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            attribute: attribute.to_string(),
            operator,
            value,
            priority: 0,
            enabled: true,
            return_value: json!(true),
        }
    }

    fn context() -> EvaluationContext {
        EvaluationContext::new("user-42")
            .with_environment("production")
            .with_attribute("country", json!("US"))
            .with_attribute("age", json!(30))
            .with_attribute("email", json!("jane@company.com"))
            .with_attribute("plan_level", json!("7"))
            .with_attribute("tags", json!(["beta", "staff"]))
    }

    fn check(attribute: &str, operator: RuleOperator, value: Value) -> bool {
        matches(&rule(attribute, operator, value), &context(), &PatternCache::new()).unwrap()
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        for op in RuleOperator::ALL {
            let value = match op {
                RuleOperator::In | RuleOperator::NotIn => json!(["x"]),
                RuleOperator::GreaterThan
                | RuleOperator::GreaterThanOrEqual
                | RuleOperator::LessThan
                | RuleOperator::LessThanOrEqual => json!(1),
                _ => json!("x"),
            };
            assert!(!check("missing", op, value), "operator {} matched", op);
        }
    }

    #[test]
    fn test_equality() {
        assert!(check("country", RuleOperator::Equals, json!("US")));
        assert!(!check("country", RuleOperator::Equals, json!("CA")));
        assert!(check("country", RuleOperator::NotEquals, json!("CA")));
        assert!(check("age", RuleOperator::Equals, json!("30")));
        assert!(check("plan_level", RuleOperator::Equals, json!(7)));
    }

    #[test]
    fn test_membership() {
        assert!(check("country", RuleOperator::In, json!(["CA", "US"])));
        assert!(!check("country", RuleOperator::In, json!(["CA", "MX"])));
        assert!(check("country", RuleOperator::NotIn, json!(["CA", "MX"])));
        assert!(!check("country", RuleOperator::NotIn, json!(["US"])));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(check("age", RuleOperator::GreaterThan, json!(18)));
        assert!(!check("age", RuleOperator::GreaterThan, json!(30)));
        assert!(check("age", RuleOperator::GreaterThanOrEqual, json!(30)));
        assert!(check("age", RuleOperator::LessThan, json!("40")));
        assert!(check("plan_level", RuleOperator::LessThanOrEqual, json!(7)));
        assert!(!check("country", RuleOperator::GreaterThan, json!(1)));
    }

    #[test]
    fn test_string_operators() {
        assert!(check("email", RuleOperator::Contains, json!("@company")));
        assert!(check("email", RuleOperator::EndsWith, json!("@company.com")));
        assert!(check("email", RuleOperator::StartsWith, json!("jane")));
        assert!(!check("email", RuleOperator::StartsWith, json!("john")));
        assert!(check("tags", RuleOperator::Contains, json!("beta")));
        assert!(!check("tags", RuleOperator::Contains, json!("alpha")));
    }

    #[test]
    fn test_regex() {
        assert!(check("email", RuleOperator::Regex, json!(r"^[a-z]+@company\.com$")));
        assert!(!check("email", RuleOperator::Regex, json!(r"^\d+$")));
    }

    #[test]
    fn test_context_fields_are_addressable() {
        assert!(check("userId", RuleOperator::Equals, json!("user-42")));
        assert!(check("user_id", RuleOperator::StartsWith, json!("user-")));
        assert!(check("environment", RuleOperator::Equals, json!("production")));
    }

    #[test]
    fn test_misconfigured_rules_are_errors() {
        let bad_regex = rule("email", RuleOperator::Regex, json!("(unclosed"));
        assert!(matches!(
            matches(&bad_regex, &context(), &PatternCache::new()),
            Err(RuleConfigError::InvalidRegex { .. })
        ));

        let bad_threshold = rule("age", RuleOperator::GreaterThan, json!("old"));
        assert!(matches!(
            matches(&bad_threshold, &context(), &PatternCache::new()),
            Err(RuleConfigError::NonNumericOperand { .. })
        ));

        let bad_list = rule("country", RuleOperator::In, json!("US"));
        assert!(matches!(
            matches(&bad_list, &context(), &PatternCache::new()),
            Err(RuleConfigError::NotAList { .. })
        ));
    }

    #[test]
    fn test_is_pure() {
        let r = rule("country", RuleOperator::In, json!(["US"]));
        let ctx = context();
        let patterns = PatternCache::new();
        let first = matches(&r, &ctx, &patterns);
        assert_eq!(matches(&r, &ctx, &patterns), first);
    }

    #[test]
    fn test_strings_compare_exactly() {
        let ctx = EvaluationContext::new("00123")
            .with_attribute("zip", json!("02134"))
            .with_attribute("version", json!("1"));
        let patterns = PatternCache::new();
        let eval = |attribute: &str, operator: RuleOperator, value: Value| {
            matches(&rule(attribute, operator, value), &ctx, &patterns).unwrap()
        };

        assert!(!eval("zip", RuleOperator::Equals, json!("2134")));
        assert!(eval("zip", RuleOperator::Equals, json!("02134")));
        assert!(eval("zip", RuleOperator::NotEquals, json!("2134")));
        assert!(!eval("userId", RuleOperator::In, json!(["123"])));
        assert!(eval("userId", RuleOperator::NotIn, json!(["123"])));
        assert!(eval("version", RuleOperator::NotEquals, json!("1.0")));
        assert!(!eval("version", RuleOperator::Equals, json!("1.0")));
    }

    #[test]
    fn test_numbers_still_coerce() {
        let ctx = EvaluationContext::new("u1")
            .with_attribute("zip", json!("02134"))
            .with_attribute("flag", json!(true))
            .with_attribute("codes", json!(["007", "42"]));
        let patterns = PatternCache::new();
        let eval = |attribute: &str, operator: RuleOperator, value: Value| {
            matches(&rule(attribute, operator, value), &ctx, &patterns).unwrap()
        };

        assert!(eval("zip", RuleOperator::Equals, json!(2134)));
        assert!(eval("flag", RuleOperator::Equals, json!("true")));
        assert!(eval("codes", RuleOperator::Contains, json!("42")));
        assert!(!eval("codes", RuleOperator::Contains, json!("7")));
    }

    #[test]
    fn test_regex_compiled_once() {
        let r = rule("email", RuleOperator::Regex, json!(r"@company\.com$"));
        let other = rule("email", RuleOperator::Regex, json!("^jane"));
        let ctx = context();
        let patterns = PatternCache::new();

        for _ in 0..100 {
            assert!(matches(&r, &ctx, &patterns).unwrap());
        }
        assert_eq!(patterns.compilations(), 1);

        assert!(matches(&other, &ctx, &patterns).unwrap());
        assert_eq!(patterns.compilations(), 2);
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_invalid_regex_is_not_remembered() {
        let bad = rule("email", RuleOperator::Regex, json!("(unclosed"));
        let patterns = PatternCache::new();
        assert!(matches(&bad, &context(), &patterns).is_err());
        assert!(matches(&bad, &context(), &patterns).is_err());
        assert!(patterns.is_empty());
    }
}
