use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::evaluation::EvaluationContext;

// MODELS

/// Association between a flag and an externally defined user segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBinding {
    pub id: Uuid,
    pub segment_id: String,
    pub enabled: bool,
    pub return_value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentBindingRequest {
    pub segment_id: String,
    pub enabled: Option<bool>,
    pub return_value: Value,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Answers "is this user in that segment".
#[async_trait]
pub trait SegmentResolver: Send + Sync {
    async fn is_member(
        &self,
        segment_id: &str,
        context: &EvaluationContext,
    ) -> Result<bool, SegmentError>;
}

// HELPER FUNCTIONS

pub fn build_segment_binding(request: &SegmentBindingRequest) -> Result<SegmentBinding, String> {
    let segment_id = request.segment_id.trim();
    if segment_id.is_empty() {
        return Err("Segment id cannot be empty".to_string());
    }

    Ok(SegmentBinding {
        id: Uuid::new_v4(),
        segment_id: segment_id.to_string(),
        enabled: request.enabled.unwrap_or(true),
        return_value: request.return_value.clone(),
    })
}

/// Segment membership held in process, keyed by segment id.
#[derive(Default)]
pub struct StaticSegmentResolver {
    members: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticSegmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_member(&self, segment_id: impl Into<String>, user_id: impl Into<String>) {
        self.members
            .write()
            .await
            .entry(segment_id.into())
            .or_default()
            .insert(user_id.into());
    }

    pub async fn remove_member(&self, segment_id: &str, user_id: &str) {
        if let Some(users) = self.members.write().await.get_mut(segment_id) {
            users.remove(user_id);
        }
    }
}

#[async_trait]
impl SegmentResolver for StaticSegmentResolver {
    async fn is_member(
        &self,
        segment_id: &str,
        context: &EvaluationContext,
    ) -> Result<bool, SegmentError> {
        Ok(self
            .members
            .read()
            .await
            .get(segment_id)
            .map(|users| users.contains(&context.user_id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_resolver_membership() {
        let resolver = StaticSegmentResolver::new();
        resolver.add_member("vip", "user-1").await;

        let member = EvaluationContext::new("user-1");
        let stranger = EvaluationContext::new("user-2");

        assert!(resolver.is_member("vip", &member).await.unwrap());
        assert!(!resolver.is_member("vip", &stranger).await.unwrap());
        assert!(!resolver.is_member("unknown", &member).await.unwrap());

        resolver.remove_member("vip", "user-1").await;
        assert!(!resolver.is_member("vip", &member).await.unwrap());
    }

    #[test]
    fn test_build_segment_binding() {
        let binding = build_segment_binding(&SegmentBindingRequest {
            segment_id: " vip ".to_string(),
            enabled: None,
            return_value: json!(true),
        })
        .unwrap();
        assert_eq!(binding.segment_id, "vip");
        assert!(binding.enabled);

        assert!(build_segment_binding(&SegmentBindingRequest {
            segment_id: "".to_string(),
            enabled: None,
            return_value: json!(true),
        })
        .is_err());
    }
}
