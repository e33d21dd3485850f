use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use super::{evaluation_context, BulkEvaluateRequest, EvaluateRequest};
use crate::error::FlagError;
use crate::state::AppState;

/// Evaluate one flag for the user in the request
pub async fn evaluate(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, FlagError> {
    let context = evaluation_context(request.user_id, request.environment, request.context)
        .map_err(FlagError::Validation)?;

    Ok(Json(state.engine.evaluate(&key, &context).await?))
}

/// Evaluate the requested flags, or every enabled flag, for one user
pub async fn bulk_evaluate(
    State(state): State<AppState>,
    Json(request): Json<BulkEvaluateRequest>,
) -> Result<impl IntoResponse, FlagError> {
    let context = evaluation_context(request.user_id, request.environment, request.context)
        .map_err(FlagError::Validation)?;

    Ok(Json(state.engine.bulk_evaluate(request.flag_keys, context).await?))
}

/// Definitions of every enabled flag, for SDK initialization
pub async fn snapshot(State(state): State<AppState>) -> Result<impl IntoResponse, FlagError> {
    Ok(Json(state.registry.enabled_snapshot().await?))
}
