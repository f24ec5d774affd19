use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::{handlers, middleware};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/webhook", post(handlers::webhook))
        .route("/jobs", get(handlers::jobs))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/metrics", get(handlers::metrics))
        .merge(protected)
        .layer(axum_middleware::from_fn(middleware::metrics_middleware))
        .with_state(state)
}
