use std::sync::Arc;

use crate::evaluation::EvaluationEngine;
use crate::flags::FlagRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FlagRegistry>,
    pub engine: Arc<EvaluationEngine>,
    pub jwt_secret: Arc<str>,
    pub sdk_key: Arc<str>,
}
