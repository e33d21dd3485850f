use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// MODELS

/// Targeting rule attached to exactly one flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub attribute: String,
    pub operator: RuleOperator,
    pub value: Value,
    pub priority: i32,
    pub enabled: bool,
    pub return_value: Value,
}

/// Comparison applied between a context attribute and the rule operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

impl RuleOperator {
    pub const ALL: [RuleOperator; 12] = [
        RuleOperator::Equals,
        RuleOperator::NotEquals,
        RuleOperator::In,
        RuleOperator::NotIn,
        RuleOperator::GreaterThan,
        RuleOperator::GreaterThanOrEqual,
        RuleOperator::LessThan,
        RuleOperator::LessThanOrEqual,
        RuleOperator::Contains,
        RuleOperator::StartsWith,
        RuleOperator::EndsWith,
        RuleOperator::Regex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperator::Equals => "equals",
            RuleOperator::NotEquals => "not_equals",
            RuleOperator::In => "in",
            RuleOperator::NotIn => "not_in",
            RuleOperator::GreaterThan => "greater_than",
            RuleOperator::GreaterThanOrEqual => "greater_than_or_equal",
            RuleOperator::LessThan => "less_than",
            RuleOperator::LessThanOrEqual => "less_than_or_equal",
            RuleOperator::Contains => "contains",
            RuleOperator::StartsWith => "starts_with",
            RuleOperator::EndsWith => "ends_with",
            RuleOperator::Regex => "regex",
        }
    }
}

impl fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleOperator::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = RuleOperator::ALL.iter().map(|op| op.as_str()).collect();
                format!(
                    "Invalid operator '{}'. Must be one of: {}",
                    s,
                    allowed.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleRequest {
    pub attribute: String,
    pub operator: String,
    pub value: Value,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub return_value: Value,
}

// HELPER FUNCTIONS

/// Validate the operand shape the operator expects
pub fn validate_rule_value(operator: RuleOperator, value: &Value) -> Result<(), String> {
    match operator {
        RuleOperator::Equals | RuleOperator::NotEquals => {
            if value.is_array() || value.is_object() {
                return Err(format!("Operator '{}' needs a scalar value", operator));
            }
        }
        RuleOperator::In | RuleOperator::NotIn => match value.as_array() {
            Some(items) if !items.is_empty() => {}
            _ => return Err(format!("Operator '{}' needs a non-empty list", operator)),
        },
        RuleOperator::GreaterThan
        | RuleOperator::GreaterThanOrEqual
        | RuleOperator::LessThan
        | RuleOperator::LessThanOrEqual => {
            if crate::evaluation::targeting::as_number(value).is_none() {
                return Err(format!("Operator '{}' needs a numeric value", operator));
            }
        }
        RuleOperator::Contains | RuleOperator::StartsWith | RuleOperator::EndsWith => {
            match value.as_str() {
                Some(s) if !s.is_empty() => {}
                _ => return Err(format!("Operator '{}' needs a non-empty string", operator)),
            }
        }
        RuleOperator::Regex => {
            let pattern = value
                .as_str()
                .ok_or_else(|| "Operator 'regex' needs a string pattern".to_string())?;
            regex::Regex::new(pattern).map_err(|e| format!("Invalid regex '{}': {}", pattern, e))?;
        }
    }

    Ok(())
}

/// Validate a rule request and build the rule it describes
pub fn build_rule(request: &RuleRequest) -> Result<Rule, String> {
    if request.attribute.trim().is_empty() {
        return Err("Rule attribute cannot be empty".to_string());
    }

    let operator: RuleOperator = request.operator.parse()?;
    validate_rule_value(operator, &request.value)?;

    Ok(Rule {
        id: Uuid::new_v4(),
        attribute: request.attribute.trim().to_string(),
        operator,
        value: request.value.clone(),
        priority: request.priority.unwrap_or(0),
        enabled: request.enabled.unwrap_or(true),
        return_value: request.return_value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(operator: &str, value: Value) -> RuleRequest {
        RuleRequest {
            attribute: "country".to_string(),
            operator: operator.to_string(),
            value,
            priority: None,
            enabled: None,
            return_value: json!(true),
        }
    }

    #[test]
    fn test_operator_round_trips_through_str() {
        for op in RuleOperator::ALL {
            assert_eq!(op.as_str().parse::<RuleOperator>().unwrap(), op);
        }
        assert!("like".parse::<RuleOperator>().is_err());
    }

    #[test]
    fn test_validate_rule_value() {
        assert!(validate_rule_value(RuleOperator::Equals, &json!("US")).is_ok());
        assert!(validate_rule_value(RuleOperator::Equals, &json!(["US"])).is_err());

        assert!(validate_rule_value(RuleOperator::In, &json!(["US", "CA"])).is_ok());
        assert!(validate_rule_value(RuleOperator::In, &json!([])).is_err());
        assert!(validate_rule_value(RuleOperator::NotIn, &json!("US")).is_err());

        assert!(validate_rule_value(RuleOperator::GreaterThan, &json!(18)).is_ok());
        assert!(validate_rule_value(RuleOperator::LessThan, &json!("2.5")).is_ok());
        assert!(validate_rule_value(RuleOperator::LessThan, &json!("old")).is_err());

        assert!(validate_rule_value(RuleOperator::Contains, &json!("@company.com")).is_ok());
        assert!(validate_rule_value(RuleOperator::EndsWith, &json!("")).is_err());

        assert!(validate_rule_value(RuleOperator::Regex, &json!("^user-[0-9]+$")).is_ok());
        assert!(validate_rule_value(RuleOperator::Regex, &json!("(unclosed")).is_err());
    }

    #[test]
    fn test_build_rule_defaults() {
        let rule = build_rule(&request("equals", json!("US"))).unwrap();
        assert_eq!(rule.operator, RuleOperator::Equals);
        assert_eq!(rule.priority, 0);
        assert!(rule.enabled);
    }

    #[test]
    fn test_build_rule_rejects_unknown_operator_and_empty_attribute() {
        assert!(build_rule(&request("sounds_like", json!("US"))).is_err());

        let mut blank = request("equals", json!("US"));
        blank.attribute = "  ".to_string();
        assert!(build_rule(&blank).is_err());
    }
}
