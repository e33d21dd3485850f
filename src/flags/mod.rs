pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::rules::{build_rule, Rule, RuleRequest};
use crate::segments::{build_segment_binding, SegmentBinding, SegmentBindingRequest};

pub use registry::FlagRegistry;

// MODELS

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagType {
    Boolean,
    Percentage,
    Segment,
    Environment,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Boolean => "BOOLEAN",
            FlagType::Percentage => "PERCENTAGE",
            FlagType::Segment => "SEGMENT",
            FlagType::Environment => "ENVIRONMENT",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BOOLEAN" => Ok(FlagType::Boolean),
            "PERCENTAGE" => Ok(FlagType::Percentage),
            "SEGMENT" => Ok(FlagType::Segment),
            "ENVIRONMENT" => Ok(FlagType::Environment),
            _ => Err(format!(
                "Invalid flag type '{}'. Must be one of: BOOLEAN, PERCENTAGE, SEGMENT, ENVIRONMENT",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub enabled: bool,
    pub default_value: Value,
    pub percentage_enabled: Option<f64>,
    #[serde(default)]
    pub environments: HashMap<String, Value>,
    /// Insertion order; evaluation sorts by priority.
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub segments: Vec<SegmentBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlagRequest {
    pub key: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: Option<String>,
    pub enabled: Option<bool>,
    pub default_value: Option<Value>,
    pub percentage_enabled: Option<f64>,
    pub environments: Option<HashMap<String, Value>>,
    pub rules: Option<Vec<RuleRequest>>,
    pub segments: Option<Vec<SegmentBindingRequest>>,
}

impl CreateFlagRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            description: None,
            flag_type: None,
            enabled: None,
            default_value: None,
            percentage_enabled: None,
            environments: None,
            rules: None,
            segments: None,
        }
    }
}

/// Partial update; `rules` and `segments` replace the stored sets wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFlagRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: Option<String>,
    pub enabled: Option<bool>,
    pub default_value: Option<Value>,
    pub percentage_enabled: Option<f64>,
    pub environments: Option<HashMap<String, Value>>,
    pub rules: Option<Vec<RuleRequest>>,
    pub segments: Option<Vec<SegmentBindingRequest>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagFilter {
    #[serde(rename = "type")]
    pub flag_type: Option<FlagType>,
    pub enabled: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// 1-based page; out of range values are clamped.
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }

    pub fn everything() -> Self {
        Self {
            page: 1,
            limit: u32::MAX,
        }
    }
}

/// Flag definition subset handed to SDK clients on initialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagSnapshot {
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub default_value: Value,
    pub percentage_enabled: Option<f64>,
    pub environments: HashMap<String, Value>,
}

impl From<&FeatureFlag> for FlagSnapshot {
    fn from(flag: &FeatureFlag) -> Self {
        Self {
            flag_type: flag.flag_type,
            default_value: flag.default_value.clone(),
            percentage_enabled: flag.percentage_enabled,
            environments: flag.environments.clone(),
        }
    }
}

// HELPER FUNCTIONS

// Validating the flag key
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    let Some(first) = key.chars().next() else {
        return Err("Flag key cannot be empty".to_string());
    };

    if key.len() > 64 {
        return Err("Flag key is too long (Max: 64 characters)".to_string());
    }

    if !first.is_ascii_lowercase() {
        return Err("Flag key must start with a lowercase letter".to_string());
    }

    if !key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err("Flag key can only contain lowercase letters, numbers and hyphens".to_string());
    }

    Ok(())
}

// Checks if percentage number is between the number 0 to 100
pub fn validate_percentage(percentage: f64) -> Result<(), String> {
    if !(0.0..=100.0).contains(&percentage) {
        return Err("Percentage must be between 0 and 100".to_string());
    }

    Ok(())
}

/// Validate environment key format
pub fn validate_environment_key(key: &str) -> Result<(), String> {
    let Some(first) = key.chars().next() else {
        return Err("Environment key cannot be empty".to_string());
    };

    if key.len() > 64 {
        return Err("Environment key is too long (Max: 64 characters)".to_string());
    }

    if !first.is_ascii_alphabetic() {
        return Err("Environment key must start with a letter".to_string());
    }

    if !key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err("Environment key can only contain lowercase letters, numbers, underscores, and hyphens".to_string());
    }

    Ok(())
}

fn validate_environments(environments: &HashMap<String, Value>) -> Result<(), String> {
    environments.keys().try_for_each(|name| validate_environment_key(name))
}

fn build_rules(requests: &[RuleRequest]) -> Result<Vec<Rule>, String> {
    requests.iter().map(build_rule).collect()
}

fn build_segments(requests: &[SegmentBindingRequest]) -> Result<Vec<SegmentBinding>, String> {
    requests.iter().map(build_segment_binding).collect()
}

/// Validate a create request and build the flag it describes
pub fn build_flag(request: &CreateFlagRequest) -> Result<FeatureFlag, String> {
    validate_flag_key(&request.key)?;

    let flag_type = match request.flag_type.as_deref() {
        Some(raw) => raw.parse()?,
        None => FlagType::Boolean,
    };

    if let Some(percentage) = request.percentage_enabled {
        validate_percentage(percentage)?;
    }

    let environments = request.environments.clone().unwrap_or_default();
    validate_environments(&environments)?;

    let rules = build_rules(request.rules.as_deref().unwrap_or(&[]))?;
    let segments = build_segments(request.segments.as_deref().unwrap_or(&[]))?;

    let now = Utc::now();
    Ok(FeatureFlag {
        id: Uuid::new_v4(),
        key: request.key.clone(),
        name: request.name.clone().unwrap_or_else(|| request.key.clone()),
        description: request.description.clone(),
        flag_type,
        enabled: request.enabled.unwrap_or(false),
        default_value: request.default_value.clone().unwrap_or(Value::Bool(false)),
        percentage_enabled: request.percentage_enabled,
        environments,
        rules,
        segments,
        created_at: now,
        updated_at: now,
    })
}

/// Validate an update request and apply it to a copy of `current`
pub fn apply_update(current: &FeatureFlag, request: &UpdateFlagRequest) -> Result<FeatureFlag, String> {
    let mut flag = current.clone();

    if let Some(name) = &request.name {
        if name.trim().is_empty() {
            return Err("Flag name cannot be empty".to_string());
        }
        flag.name = name.clone();
    }
    if let Some(description) = &request.description {
        flag.description = Some(description.clone());
    }
    if let Some(raw) = request.flag_type.as_deref() {
        flag.flag_type = raw.parse()?;
    }
    if let Some(enabled) = request.enabled {
        flag.enabled = enabled;
    }
    if let Some(default_value) = &request.default_value {
        flag.default_value = default_value.clone();
    }
    if let Some(percentage) = request.percentage_enabled {
        validate_percentage(percentage)?;
        flag.percentage_enabled = Some(percentage);
    }
    if let Some(environments) = &request.environments {
        validate_environments(environments)?;
        flag.environments = environments.clone();
    }
    if let Some(rules) = &request.rules {
        flag.rules = build_rules(rules)?;
    }
    if let Some(segments) = &request.segments {
        flag.segments = build_segments(segments)?;
    }

    flag.updated_at = Utc::now();
    Ok(flag)
}
