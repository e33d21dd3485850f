//! Key/value cache shared by the flag registry and the evaluation engine.

pub mod memory;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::evaluation::EvaluationContext;

pub use memory::InMemoryCache;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Cache store with TTLs and glob-style pattern deletion (`*` wildcard).
#[async_trait]
pub trait FlagCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key matching `pattern`, returning how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64>;
}

/// Read and deserialize a JSON entry.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn FlagCache, key: &str) -> CacheResult<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON entry.
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn FlagCache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> CacheResult<()> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw, ttl).await
}

// CACHE KEYS

const DEFINITION_PREFIX: &str = "flag-def";
const EVALUATION_PREFIX: &str = "flag-eval";

pub fn definition_key(flag_key: &str) -> String {
    format!("{}:{}", DEFINITION_PREFIX, flag_key)
}

/// `flag-eval:{flag}:{context fingerprint}`
///
/// Flag keys never contain `:`, and everything caller-supplied goes through
/// the fingerprint, so distinct contexts cannot collide on a separator.
pub fn evaluation_key(flag_key: &str, context: &EvaluationContext) -> String {
    format!("{}:{}:{}", EVALUATION_PREFIX, flag_key, context_fingerprint(context))
}

/// Pattern matching every cached evaluation of a flag.
pub fn evaluation_pattern(flag_key: &str) -> String {
    format!("{}:{}:*", EVALUATION_PREFIX, flag_key)
}

// 128 bits of SHA-256 over canonical JSON of environment, user and sorted attributes
fn context_fingerprint(context: &EvaluationContext) -> String {
    let attributes: BTreeMap<&String, &serde_json::Value> = context.attributes.iter().collect();
    let canonical = serde_json::to_vec(&(&context.environment, &context.user_id, attributes))
        .unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compile a cache key pattern where `*` stands for any run of characters.
pub fn compile_pattern(pattern: &str) -> CacheResult<Regex> {
    let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("(?s)^{}$", body.join(".*")))
        .map_err(|e| CacheError::Backend(format!("invalid key pattern '{}': {}", pattern, e)))
}
