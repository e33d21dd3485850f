//! Append-only audit trail of flag mutations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Updated => "updated",
            AuditAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(AuditAction::Created),
            "updated" => Ok(AuditAction::Updated),
            "deleted" => Ok(AuditAction::Deleted),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub action: AuditAction,
    pub actor_id: Option<String>,
    /// Created payload, `{before, after}` for updates, final snapshot for deletes.
    pub changes: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(flag_id: Uuid, action: AuditAction, actor_id: Option<String>, changes: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            flag_id,
            action,
            actor_id,
            changes,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Audit log storage backend
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Most recent entries first.
    async fn list_for_flag(&self, flag_id: Uuid, limit: u32) -> Result<Vec<AuditEntry>, AuditError>;
}

/// Front for an [`AuditStore`] where writes never fail the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        flag_id: Uuid,
        action: AuditAction,
        actor_id: Option<String>,
        changes: Value,
    ) {
        let entry = AuditEntry::new(flag_id, action, actor_id, changes);
        if let Err(e) = self.store.append(&entry).await {
            error!(flag_id = %flag_id, action = %action, error = %e, "failed to write audit entry");
        }
    }

    pub async fn entries(&self, flag_id: Uuid, limit: u32) -> Result<Vec<AuditEntry>, AuditError> {
        self.store.list_for_flag(flag_id, limit).await
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_for_flag(&self, flag_id: Uuid, limit: u32) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.flag_id == flag_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl AuditStore for BrokenStore {
        async fn append(&self, _: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }

        async fn list_for_flag(&self, _: Uuid, _: u32) -> Result<Vec<AuditEntry>, AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_record_and_list_newest_first() {
        let store = Arc::new(InMemoryAuditStore::new());
        let log = AuditLog::new(store.clone());
        let flag_id = Uuid::new_v4();

        log.record(flag_id, AuditAction::Created, Some("admin".into()), json!({"key": "x"})).await;
        log.record(flag_id, AuditAction::Updated, None, json!({})).await;
        log.record(Uuid::new_v4(), AuditAction::Created, None, json!({})).await;

        let entries = log.entries(flag_id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Updated);
        assert_eq!(entries[1].actor_id.as_deref(), Some("admin"));

        assert_eq!(log.entries(flag_id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_swallows_store_failures() {
        let log = AuditLog::new(Arc::new(BrokenStore));
        log.record(Uuid::new_v4(), AuditAction::Deleted, None, json!({})).await;
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("deleted".parse::<AuditAction>().unwrap(), AuditAction::Deleted);
        assert!("archived".parse::<AuditAction>().is_err());
    }
}
