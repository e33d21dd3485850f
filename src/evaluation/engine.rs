use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use super::{evaluate_flag, EvaluationContext, EvaluationReason, EvaluationResult, PatternCache};
use crate::cache::{self, FlagCache};
use crate::error::{FlagError, FlagResult};
use crate::flags::FlagRegistry;
use crate::overrides::FlagOverrides;
use crate::segments::SegmentResolver;

/// Per-key outcome of a bulk evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BulkEntry {
    Evaluated(EvaluationResult),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkEvaluation {
    pub user_id: String,
    pub results: HashMap<String, BulkEntry>,
    pub count: usize,
}

/// Runs the per-user evaluation pipeline behind the evaluation cache.
pub struct EvaluationEngine {
    registry: Arc<FlagRegistry>,
    segments: Arc<dyn SegmentResolver>,
    cache: Arc<dyn FlagCache>,
    overrides: Arc<FlagOverrides>,
    patterns: PatternCache,
    evaluation_ttl: Duration,
    latency_budget: Duration,
}

impl EvaluationEngine {
    pub fn new(
        registry: Arc<FlagRegistry>,
        segments: Arc<dyn SegmentResolver>,
        cache: Arc<dyn FlagCache>,
        overrides: Arc<FlagOverrides>,
        evaluation_ttl: Duration,
        latency_budget: Duration,
    ) -> Self {
        Self {
            registry,
            segments,
            cache,
            overrides,
            patterns: PatternCache::new(),
            evaluation_ttl,
            latency_budget,
        }
    }

    /// Evaluate one flag for one user.
    pub async fn evaluate(&self, key: &str, context: &EvaluationContext) -> FlagResult<EvaluationResult> {
        let started = Instant::now();
        let result = self.evaluate_uninstrumented(key, context).await;

        let elapsed = started.elapsed();
        if elapsed > self.latency_budget {
            warn!(
                flag_key = %key,
                user_id = %context.user_id,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                budget_ms = self.latency_budget.as_millis() as u64,
                "flag evaluation exceeded latency budget"
            );
        }
        result
    }

    async fn evaluate_uninstrumented(&self, key: &str, context: &EvaluationContext) -> FlagResult<EvaluationResult> {
        if let Some(value) = self.overrides.get(key) {
            return Ok(EvaluationResult::new(key, value.clone(), EvaluationReason::Override));
        }

        let cache_key = cache::evaluation_key(key, context);
        match cache::get_json::<EvaluationResult>(self.cache.as_ref(), &cache_key).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => {}
            Err(e) => warn!(flag_key = %key, error = %e, "evaluation cache read failed"),
        }

        let flag = match self.registry.find_by_key(key).await {
            Ok(flag) => flag,
            Err(FlagError::Dependency(e)) => {
                return match self.registry.last_known_default(key) {
                    Some(default_value) => {
                        error!(flag_key = %key, error = %e, "flag definition unavailable, serving last known default");
                        Ok(EvaluationResult::new(key, default_value, EvaluationReason::DefaultValue))
                    }
                    None => Err(FlagError::Dependency(e)),
                };
            }
            Err(e) => return Err(e),
        };

        let evaluation = evaluate_flag(&flag, context, self.segments.as_ref(), &self.patterns).await;

        // degraded results are not cached so the next request retries the resolver
        if !evaluation.degraded {
            if let Err(e) =
                cache::set_json(self.cache.as_ref(), &cache_key, &evaluation.result, self.evaluation_ttl).await
            {
                warn!(flag_key = %key, error = %e, "evaluation cache write failed");
            }
        }

        Ok(evaluation.result)
    }

    /// Evaluate several flags concurrently, one task per flag.
    ///
    /// `None` evaluates every enabled flag. A failing flag is reported under
    /// its own key and never affects the others.
    pub async fn bulk_evaluate(
        self: &Arc<Self>,
        flag_keys: Option<Vec<String>>,
        context: EvaluationContext,
    ) -> FlagResult<BulkEvaluation> {
        let keys = match flag_keys {
            Some(keys) => keys,
            None => self
                .registry
                .enabled_flags()
                .await?
                .into_iter()
                .map(|flag| flag.key)
                .collect(),
        };

        let context = Arc::new(context);
        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let engine = Arc::clone(self);
                let context = Arc::clone(&context);
                let task_key = key.clone();
                let handle = tokio::spawn(async move { engine.evaluate(&task_key, &context).await });
                (key, handle)
            })
            .collect();

        let mut results = HashMap::with_capacity(handles.len());
        for (key, handle) in handles {
            let entry = match handle.await {
                Ok(Ok(result)) => BulkEntry::Evaluated(result),
                Ok(Err(e)) => BulkEntry::Failed { error: e.to_string() },
                Err(e) => {
                    error!(flag_key = %key, error = %e, "flag evaluation task failed");
                    BulkEntry::Failed {
                        error: "evaluation task failed".to_string(),
                    }
                }
            };
            results.insert(key, entry);
        }

        Ok(BulkEvaluation {
            user_id: context.user_id.clone(),
            count: results.len(),
            results,
        })
    }
}
