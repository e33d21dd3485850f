pub mod routes;

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::evaluation::EvaluationContext;

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub user_id: String,
    pub environment: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct BulkEvaluateRequest {
    pub user_id: String,
    pub flag_keys: Option<Vec<String>>,
    pub environment: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

pub fn evaluation_context(
    user_id: String,
    environment: Option<String>,
    attributes: HashMap<String, Value>,
) -> Result<EvaluationContext, String> {
    if user_id.trim().is_empty() {
        return Err("user_id cannot be empty".to_string());
    }
    Ok(EvaluationContext {
        user_id,
        environment,
        attributes,
    })
}
