use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::{AuditQuery, FlagListResponse, ListFlagsQuery, ToggleRequest};
use crate::error::FlagError;
use crate::flags::{CreateFlagRequest, UpdateFlagRequest};
use crate::routes::middleware_auth::Actor;
use crate::state::AppState;

/// Create a new feature flag
pub async fn create(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(payload): Json<CreateFlagRequest>,
) -> Result<impl IntoResponse, FlagError> {
    let flag = state.registry.create(payload, Some(actor)).await?;
    Ok((StatusCode::CREATED, Json(flag)))
}

/// List flags with optional filters
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListFlagsQuery>,
) -> Result<impl IntoResponse, FlagError> {
    let filter = query.filter().map_err(FlagError::Validation)?;
    let page = query.page();
    let (flags, total) = state.registry.find_all(&filter, page).await?;

    Ok(Json(FlagListResponse {
        flags,
        total,
        page: page.page,
        limit: page.limit,
    }))
}

/// Get a single flag by key
pub async fn get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    Ok(Json(state.registry.find_by_key(&key).await?))
}

/// Update a feature flag
pub async fn update(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
    Json(payload): Json<UpdateFlagRequest>,
) -> Result<impl IntoResponse, FlagError> {
    Ok(Json(state.registry.update(&key, payload, Some(actor)).await?))
}

/// Delete a feature flag
pub async fn delete(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    state.registry.delete(&key, Some(actor)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Set a flag's enabled state
pub async fn toggle(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
    Json(payload): Json<ToggleRequest>,
) -> Result<impl IntoResponse, FlagError> {
    Ok(Json(state.registry.toggle(&key, payload.enabled, Some(actor)).await?))
}

/// Mutation history of a flag, newest first
pub async fn audit(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, FlagError> {
    Ok(Json(state.registry.audit_log(&key, query.limit()).await?))
}
