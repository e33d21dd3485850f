pub mod postgres;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::flags::{FeatureFlag, FlagFilter, Page};

pub use postgres::PgFlagRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("flag key '{0}' already exists")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored flag could not be decoded: {0}")]
    Decode(String),

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Persistence for flags together with their rules and segment bindings.
///
/// `insert` and `update` are all-or-nothing; `update` replaces the rule and
/// segment sets wholesale with the ones on `flag`.
#[async_trait]
pub trait FlagRepository: Send + Sync {
    async fn find_by_key(&self, key: &str) -> RepositoryResult<Option<FeatureFlag>>;

    /// Page of matching flags, newest first, plus the total match count.
    async fn list(&self, filter: &FlagFilter, page: Page) -> RepositoryResult<(Vec<FeatureFlag>, u64)>;

    async fn insert(&self, flag: &FeatureFlag) -> RepositoryResult<()>;

    async fn update(&self, flag: &FeatureFlag) -> RepositoryResult<()>;

    /// Returns false when no flag had this id.
    async fn delete(&self, id: Uuid) -> RepositoryResult<bool>;
}

pub(crate) fn matches_filter(flag: &FeatureFlag, filter: &FlagFilter) -> bool {
    if filter.flag_type.is_some_and(|t| t != flag.flag_type) {
        return false;
    }
    if filter.enabled.is_some_and(|e| e != flag.enabled) {
        return false;
    }
    match filter.search.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => {
            let needle = text.to_lowercase();
            flag.key.to_lowercase().contains(&needle) || flag.name.to_lowercase().contains(&needle)
        }
        _ => true,
    }
}

#[derive(Default)]
pub struct InMemoryFlagRepository {
    flags: RwLock<HashMap<String, FeatureFlag>>,
}

impl InMemoryFlagRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagRepository for InMemoryFlagRepository {
    async fn find_by_key(&self, key: &str) -> RepositoryResult<Option<FeatureFlag>> {
        Ok(self.flags.read().await.get(key).cloned())
    }

    async fn list(&self, filter: &FlagFilter, page: Page) -> RepositoryResult<(Vec<FeatureFlag>, u64)> {
        let flags = self.flags.read().await;
        let mut matching: Vec<&FeatureFlag> = flags.values().filter(|f| matches_filter(f, filter)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));

        let total = matching.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn insert(&self, flag: &FeatureFlag) -> RepositoryResult<()> {
        let mut flags = self.flags.write().await;
        if flags.contains_key(&flag.key) {
            return Err(RepositoryError::Conflict(flag.key.clone()));
        }
        flags.insert(flag.key.clone(), flag.clone());
        Ok(())
    }

    async fn update(&self, flag: &FeatureFlag) -> RepositoryResult<()> {
        let mut flags = self.flags.write().await;
        match flags.get_mut(&flag.key) {
            Some(stored) if stored.id == flag.id => {
                *stored = flag.clone();
                Ok(())
            }
            _ => Err(RepositoryError::Unavailable(format!(
                "flag '{}' vanished during update",
                flag.key
            ))),
        }
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut flags = self.flags.write().await;
        let before = flags.len();
        flags.retain(|_, f| f.id != id);
        Ok(flags.len() < before)
    }
}
