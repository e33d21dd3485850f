use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod flags;
mod health;
mod middleware_auth;
mod sdk;
mod sdk_auth;

pub use health::health;

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    let flag_router = Router::new()
        .route("/", post(flags::routes::create).get(flags::routes::list))
        .route(
            "/{key}",
            get(flags::routes::get)
                .put(flags::routes::update)
                .delete(flags::routes::delete),
        )
        .route("/{key}/toggle", post(flags::routes::toggle))
        .route("/{key}/audit", get(flags::routes::audit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_auth::require_auth,
        ));

    let sdk_router = Router::new()
        .route("/flags/{key}/evaluate", post(sdk::routes::evaluate))
        .route("/evaluate", post(sdk::routes::bulk_evaluate))
        .route("/snapshot", get(sdk::routes::snapshot))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            sdk_auth::require_sdk_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/flags", flag_router)
        .nest("/sdk", sdk_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Feature flag evaluation service"
}
