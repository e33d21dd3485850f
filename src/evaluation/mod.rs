pub mod engine;
pub mod rollout;
pub mod targeting;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::flags::{FeatureFlag, FlagType};
use crate::rules::Rule;
use crate::segments::SegmentResolver;

pub use engine::{BulkEntry, BulkEvaluation, EvaluationEngine};
pub use targeting::PatternCache;

// User context for evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub user_id: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl EvaluationContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            environment: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Attribute bag first, then the built-in user and environment fields.
    pub fn attribute(&self, name: &str) -> Option<Cow<'_, Value>> {
        if let Some(value) = self.attributes.get(name) {
            return Some(Cow::Borrowed(value));
        }
        match name {
            "userId" | "user_id" => Some(Cow::Owned(Value::String(self.user_id.clone()))),
            "environment" => self
                .environment
                .as_ref()
                .map(|env| Cow::Owned(Value::String(env.clone()))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    Override,
    FlagDisabled,
    EnvironmentMatch,
    TargetingMatch,
    SegmentMatch,
    PercentageRollout,
    UserNotInRollout,
    DefaultValue,
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub key: String,
    pub value: Value,
    pub reason: EvaluationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<Uuid>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn new(key: impl Into<String>, value: Value, reason: EvaluationReason) -> Self {
        Self {
            key: key.into(),
            value,
            reason,
            matched_rule_id: None,
            evaluated_at: Utc::now(),
        }
    }

    fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.matched_rule_id = Some(rule_id);
        self
    }
}

/// Outcome of the pipeline, flagged when a collaborator failed along the way.
#[derive(Debug, Clone)]
pub struct FlagEvaluation {
    pub result: EvaluationResult,
    pub degraded: bool,
}

/// Enabled rules, highest priority first, insertion order on ties
pub fn ordered_rules(rules: &[Rule]) -> Vec<&Rule> {
    let mut sorted: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    // stable sort keeps insertion order for equal priorities
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
    sorted
}

/// Evaluate a flag definition for a given user
pub async fn evaluate_flag(
    flag: &FeatureFlag,
    context: &EvaluationContext,
    segments: &dyn SegmentResolver,
    patterns: &PatternCache,
) -> FlagEvaluation {
    let mut degraded = false;

    // Step 1: globally disabled flags serve their default
    if !flag.enabled {
        return FlagEvaluation {
            result: EvaluationResult::new(
                &flag.key,
                flag.default_value.clone(),
                EvaluationReason::FlagDisabled,
            ),
            degraded,
        };
    }

    // Step 2: per-environment values
    if flag.flag_type == FlagType::Environment {
        if let Some(value) = context
            .environment
            .as_ref()
            .and_then(|env| flag.environments.get(env))
        {
            return FlagEvaluation {
                result: EvaluationResult::new(&flag.key, value.clone(), EvaluationReason::EnvironmentMatch),
                degraded,
            };
        }
    }

    // Step 3: targeting rules
    for rule in ordered_rules(&flag.rules) {
        match targeting::matches(rule, context, patterns) {
            Ok(true) => {
                return FlagEvaluation {
                    result: EvaluationResult::new(
                        &flag.key,
                        rule.return_value.clone(),
                        EvaluationReason::TargetingMatch,
                    )
                    .with_rule(rule.id),
                    degraded,
                };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(flag_key = %flag.key, rule_id = %rule.id, error = %e, "misconfigured targeting rule treated as non-matching");
            }
        }
    }

    // Step 4: segment bindings in stored order
    for binding in flag.segments.iter().filter(|b| b.enabled) {
        match segments.is_member(&binding.segment_id, context).await {
            Ok(true) => {
                return FlagEvaluation {
                    result: EvaluationResult::new(
                        &flag.key,
                        binding.return_value.clone(),
                        EvaluationReason::SegmentMatch,
                    ),
                    degraded,
                };
            }
            Ok(false) => {}
            Err(e) => {
                degraded = true;
                warn!(flag_key = %flag.key, segment_id = %binding.segment_id, error = %e, "segment lookup failed, treating user as non-member");
            }
        }
    }

    // Step 5: percentage rollout
    if flag.flag_type == FlagType::Percentage {
        if let Some(percentage) = flag.percentage_enabled {
            let result = if rollout::is_in_rollout(&context.user_id, &flag.key, percentage) {
                EvaluationResult::new(&flag.key, Value::Bool(true), EvaluationReason::PercentageRollout)
            } else {
                EvaluationResult::new(&flag.key, Value::Bool(false), EvaluationReason::UserNotInRollout)
            };
            return FlagEvaluation { result, degraded };
        }
    }

    // Step 6: default
    FlagEvaluation {
        result: EvaluationResult::new(&flag.key, flag.default_value.clone(), EvaluationReason::DefaultValue),
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{build_flag, CreateFlagRequest};
    use crate::rules::RuleRequest;
    use crate::segments::{SegmentBindingRequest, SegmentError, StaticSegmentResolver};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenSegments;

    #[async_trait]
    impl SegmentResolver for BrokenSegments {
        async fn is_member(&self, _: &str, _: &EvaluationContext) -> Result<bool, SegmentError> {
            Err(SegmentError::Unavailable("timeout".to_string()))
        }
    }

    fn rule(attribute: &str, operator: &str, value: Value, priority: i32, returns: Value) -> RuleRequest {
        RuleRequest {
            attribute: attribute.to_string(),
            operator: operator.to_string(),
            value,
            priority: Some(priority),
            enabled: Some(true),
            return_value: returns,
        }
    }

    fn segment(id: &str, returns: Value) -> SegmentBindingRequest {
        SegmentBindingRequest {
            segment_id: id.to_string(),
            enabled: Some(true),
            return_value: returns,
        }
    }

    fn flag(configure: impl FnOnce(&mut CreateFlagRequest)) -> FeatureFlag {
        let mut request = CreateFlagRequest::new("test-flag");
        request.enabled = Some(true);
        configure(&mut request);
        build_flag(&request).unwrap()
    }

    async fn evaluate(
        flag: &FeatureFlag,
        context: &EvaluationContext,
        segments: &dyn SegmentResolver,
    ) -> FlagEvaluation {
        evaluate_flag(flag, context, segments, &PatternCache::new()).await
    }

    async fn vip_resolver() -> StaticSegmentResolver {
        let resolver = StaticSegmentResolver::new();
        resolver.add_member("vip", "user123").await;
        resolver
    }

    fn us_user() -> EvaluationContext {
        EvaluationContext::new("user123").with_attribute("country", json!("US"))
    }

    #[tokio::test]
    async fn test_globally_disabled_flag() {
        let f = flag(|r| {
            r.enabled = Some(false);
            r.default_value = Some(json!("off"));
            r.rules = Some(vec![rule("country", "equals", json!("US"), 10, json!("on"))]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.value, json!("off"));
        assert_eq!(eval.result.reason, EvaluationReason::FlagDisabled);
    }

    #[tokio::test]
    async fn test_environment_override() {
        let f = flag(|r| {
            r.flag_type = Some("ENVIRONMENT".to_string());
            r.environments = Some(HashMap::from([("staging".to_string(), json!(true))]));
            r.rules = Some(vec![rule("country", "equals", json!("US"), 10, json!("rule"))]);
        });

        let ctx = us_user().with_environment("staging");
        let eval = evaluate(&f, &ctx, &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::EnvironmentMatch);
        assert_eq!(eval.result.value, json!(true));

        // unknown environment falls through to the rules
        let ctx = us_user().with_environment("production");
        let eval = evaluate(&f, &ctx, &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::TargetingMatch);
    }

    #[tokio::test]
    async fn test_environment_map_ignored_for_other_types() {
        let f = flag(|r| {
            r.environments = Some(HashMap::from([("staging".to_string(), json!(true))]));
        });
        let ctx = us_user().with_environment("staging");
        let eval = evaluate(&f, &ctx, &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::DefaultValue);
    }

    #[tokio::test]
    async fn test_rule_priority() {
        let f = flag(|r| {
            r.rules = Some(vec![
                rule("country", "equals", json!("US"), 5, json!("low")),
                rule("userId", "equals", json!("user123"), 10, json!("high")),
            ]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.value, json!("high"));
        assert_eq!(eval.result.matched_rule_id, Some(f.rules[1].id));
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_insertion_order() {
        let f = flag(|r| {
            r.rules = Some(vec![
                rule("country", "equals", json!("US"), 3, json!("first")),
                rule("userId", "equals", json!("user123"), 3, json!("second")),
            ]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.value, json!("first"));
    }

    #[tokio::test]
    async fn test_disabled_rule_is_skipped() {
        let mut f = flag(|r| {
            r.rules = Some(vec![
                rule("country", "equals", json!("US"), 10, json!("disabled")),
                rule("country", "equals", json!("US"), 1, json!("enabled")),
            ]);
        });
        f.rules[0].enabled = false;

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.value, json!("enabled"));
    }

    #[tokio::test]
    async fn test_rules_outrank_segments() {
        let f = flag(|r| {
            r.rules = Some(vec![rule("country", "equals", json!("US"), 10, json!("rule"))]);
            r.segments = Some(vec![segment("vip", json!("segment"))]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::TargetingMatch);
    }

    #[tokio::test]
    async fn test_segment_match() {
        let f = flag(|r| {
            r.rules = Some(vec![rule("country", "equals", json!("CA"), 10, json!("rule"))]);
            r.segments = Some(vec![segment("staff", json!("staff")), segment("vip", json!("vip"))]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::SegmentMatch);
        assert_eq!(eval.result.value, json!("vip"));
        assert!(!eval.degraded);
    }

    #[tokio::test]
    async fn test_segments_outrank_rollout() {
        let f = flag(|r| {
            r.flag_type = Some("PERCENTAGE".to_string());
            r.percentage_enabled = Some(100.0);
            r.segments = Some(vec![segment("vip", json!("vip"))]);
        });

        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::SegmentMatch);
    }

    #[tokio::test]
    async fn test_segment_failure_degrades() {
        let f = flag(|r| {
            r.default_value = Some(json!("fallback"));
            r.segments = Some(vec![segment("vip", json!("vip"))]);
        });

        let eval = evaluate(&f, &us_user(), &BrokenSegments).await;
        assert_eq!(eval.result.reason, EvaluationReason::DefaultValue);
        assert!(eval.degraded);
    }

    #[tokio::test]
    async fn test_percentage_scenario() {
        let f = flag(|r| {
            r.flag_type = Some("PERCENTAGE".to_string());
            r.percentage_enabled = Some(50.0);
            r.default_value = Some(json!(false));
        });
        let ctx = EvaluationContext::new("user-abc");
        let resolver = StaticSegmentResolver::new();

        let first = evaluate(&f, &ctx, &resolver).await.result;
        assert!(matches!(
            first.reason,
            EvaluationReason::PercentageRollout | EvaluationReason::UserNotInRollout
        ));
        assert!(first.value.is_boolean());
        assert_eq!(
            first.value,
            json!(rollout::is_in_rollout("user-abc", "test-flag", 50.0))
        );

        for _ in 0..5 {
            assert_eq!(evaluate(&f, &ctx, &resolver).await.result.value, first.value);
        }
    }

    #[tokio::test]
    async fn test_misconfigured_rule_falls_through() {
        let mut f = flag(|r| {
            r.default_value = Some(json!("default"));
            r.rules = Some(vec![rule("email", "regex", json!("^a"), 10, json!("rule"))]);
        });
        f.rules[0].value = json!("(unclosed");

        let ctx = us_user().with_attribute("email", json!("a@b.c"));
        let eval = evaluate(&f, &ctx, &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::DefaultValue);
    }

    #[tokio::test]
    async fn test_default_value() {
        let f = flag(|r| r.default_value = Some(json!({"variant": "control"})));
        let eval = evaluate(&f, &us_user(), &vip_resolver().await).await;
        assert_eq!(eval.result.reason, EvaluationReason::DefaultValue);
        assert_eq!(eval.result.value, json!({"variant": "control"}));
        assert!(eval.result.matched_rule_id.is_none());
    }
}
