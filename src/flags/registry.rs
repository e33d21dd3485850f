use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    apply_update, build_flag, CreateFlagRequest, FeatureFlag, FlagFilter, FlagSnapshot, Page,
    UpdateFlagRequest,
};
use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::cache::{self, FlagCache};
use crate::error::{FlagError, FlagResult};
use crate::repository::FlagRepository;

/// CRUD over flag definitions, keeping the caches and the audit trail in step.
pub struct FlagRegistry {
    repository: Arc<dyn FlagRepository>,
    cache: Arc<dyn FlagCache>,
    audit: AuditLog,
    definition_ttl: Duration,
    last_known_defaults: RwLock<HashMap<String, Value>>,
}

impl FlagRegistry {
    pub fn new(
        repository: Arc<dyn FlagRepository>,
        cache: Arc<dyn FlagCache>,
        audit: AuditLog,
        definition_ttl: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            audit,
            definition_ttl,
            last_known_defaults: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, request: CreateFlagRequest, actor_id: Option<String>) -> FlagResult<FeatureFlag> {
        let flag = build_flag(&request).map_err(FlagError::Validation)?;

        if self.repository.find_by_key(&flag.key).await?.is_some() {
            return Err(FlagError::Conflict(flag.key));
        }
        self.invalidate(&flag.key).await?;
        self.repository.insert(&flag).await?;

        info!(flag_key = %flag.key, flag_type = %flag.flag_type, "flag created");
        self.audit
            .record(flag.id, AuditAction::Created, actor_id, snapshot(&flag))
            .await;
        self.remember_default(&flag);
        self.invalidate_committed(&flag.key).await;

        Ok(flag)
    }

    pub async fn find_all(&self, filter: &FlagFilter, page: Page) -> FlagResult<(Vec<FeatureFlag>, u64)> {
        Ok(self.repository.list(filter, page).await?)
    }

    /// Cache-aside lookup through the definition cache.
    pub async fn find_by_key(&self, key: &str) -> FlagResult<FeatureFlag> {
        let cache_key = cache::definition_key(key);

        match cache::get_json::<FeatureFlag>(self.cache.as_ref(), &cache_key).await {
            Ok(Some(flag)) => return Ok(flag),
            Ok(None) => {}
            Err(e) => warn!(flag_key = %key, error = %e, "definition cache read failed"),
        }

        let flag = self
            .repository
            .find_by_key(key)
            .await?
            .ok_or_else(|| FlagError::NotFound(key.to_string()))?;

        if let Err(e) = cache::set_json(self.cache.as_ref(), &cache_key, &flag, self.definition_ttl).await {
            warn!(flag_key = %key, error = %e, "definition cache write failed");
        }
        self.remember_default(&flag);

        Ok(flag)
    }

    pub async fn update(
        &self,
        key: &str,
        request: UpdateFlagRequest,
        actor_id: Option<String>,
    ) -> FlagResult<FeatureFlag> {
        let before = self.load(key).await?;
        let after = apply_update(&before, &request).map_err(FlagError::Validation)?;

        self.invalidate(key).await?;
        self.repository.update(&after).await?;

        info!(flag_key = %key, enabled = after.enabled, "flag updated");
        self.audit
            .record(
                after.id,
                AuditAction::Updated,
                actor_id,
                json!({ "before": snapshot(&before), "after": snapshot(&after) }),
            )
            .await;
        self.remember_default(&after);
        self.invalidate_committed(key).await;

        Ok(after)
    }

    pub async fn toggle(&self, key: &str, enabled: bool, actor_id: Option<String>) -> FlagResult<FeatureFlag> {
        let request = UpdateFlagRequest {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update(key, request, actor_id).await
    }

    pub async fn delete(&self, key: &str, actor_id: Option<String>) -> FlagResult<()> {
        let flag = self.load(key).await?;

        self.invalidate(key).await?;
        if !self.repository.delete(flag.id).await? {
            return Err(FlagError::NotFound(key.to_string()));
        }

        info!(flag_key = %key, "flag deleted");
        self.audit
            .record(flag.id, AuditAction::Deleted, actor_id, snapshot(&flag))
            .await;
        self.forget_default(key);
        self.invalidate_committed(key).await;

        Ok(())
    }

    pub async fn audit_log(&self, key: &str, limit: u32) -> FlagResult<Vec<AuditEntry>> {
        let flag = self.load(key).await?;
        Ok(self.audit.entries(flag.id, limit).await?)
    }

    pub async fn enabled_flags(&self) -> FlagResult<Vec<FeatureFlag>> {
        let filter = FlagFilter {
            enabled: Some(true),
            ..Default::default()
        };
        let (flags, _) = self.repository.list(&filter, Page::everything()).await?;
        Ok(flags)
    }

    pub async fn enabled_snapshot(&self) -> FlagResult<HashMap<String, FlagSnapshot>> {
        Ok(self
            .enabled_flags()
            .await?
            .iter()
            .map(|flag| (flag.key.clone(), FlagSnapshot::from(flag)))
            .collect())
    }

    /// Default value of the last successfully loaded definition of `key`.
    pub fn last_known_default(&self, key: &str) -> Option<Value> {
        self.last_known_defaults
            .read()
            .ok()
            .and_then(|defaults| defaults.get(key).cloned())
    }

    /// Drop the cached definition and every cached evaluation of `key`.
    pub async fn invalidate(&self, key: &str) -> FlagResult<()> {
        self.cache.delete(&cache::definition_key(key)).await?;
        let removed = self.cache.delete_pattern(&cache::evaluation_pattern(key)).await?;
        debug!(flag_key = %key, removed, "flag caches invalidated");
        Ok(())
    }

    // The write is already durable, so a failure here only leaves entries to expire by TTL.
    async fn invalidate_committed(&self, key: &str) {
        if let Err(e) = self.invalidate(key).await {
            error!(flag_key = %key, error = %e, "cache invalidation failed after commit, stale entries expire by TTL");
        }
    }

    // Mutations read from the repository so the before-snapshot is never stale.
    async fn load(&self, key: &str) -> FlagResult<FeatureFlag> {
        self.repository
            .find_by_key(key)
            .await?
            .ok_or_else(|| FlagError::NotFound(key.to_string()))
    }

    fn remember_default(&self, flag: &FeatureFlag) {
        if let Ok(mut defaults) = self.last_known_defaults.write() {
            defaults.insert(flag.key.clone(), flag.default_value.clone());
        }
    }

    fn forget_default(&self, key: &str) {
        if let Ok(mut defaults) = self.last_known_defaults.write() {
            defaults.remove(key);
        }
    }
}

fn snapshot(flag: &FeatureFlag) -> Value {
    serde_json::to_value(flag).unwrap_or(Value::Null)
}
