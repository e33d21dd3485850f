//! Feature-flag targeting and evaluation.
//!
//! [`flags::FlagRegistry`] owns flag definitions: CRUD against a
//! [`repository::FlagRepository`], a short-lived definition cache and an audit
//! trail. [`evaluation::EvaluationEngine`] decides what value a flag takes for
//! a user, in this order: override, disabled, environment, targeting rules,
//! segments, percentage rollout, default.

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod flags;
pub mod overrides;
pub mod repository;
pub mod routes;
pub mod rules;
pub mod segments;
pub mod state;

pub use error::{DependencyError, FlagError, FlagResult};
pub use evaluation::{EvaluationContext, EvaluationEngine, EvaluationReason, EvaluationResult};
pub use flags::{FeatureFlag, FlagRegistry, FlagType};
