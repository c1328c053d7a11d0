use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::middleware::{Throttle, log_errors, rate_limit};
use crate::{AppState, routes};

// 管理相关的路由
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(routes::admin::health))
        .route("/admin/metrics", get(routes::admin::metrics_snapshot))
        .route("/admin/metrics/reports", get(routes::admin::metrics_reports))
        .route(
            "/admin/rate-limit/{identifier}",
            get(routes::admin::peek_rate_limit).delete(routes::admin::reset_rate_limit),
        )
        .route("/admin/cache/flush", post(routes::admin::flush_cache))
}

// 缓存读写路由
pub fn cache_routes() -> Router<AppState> {
    Router::new().route(
        "/cache/{key}",
        get(routes::cache::get_entry)
            .put(routes::cache::put_entry)
            .delete(routes::cache::delete_entry),
    )
}

// 创建主路由，所有路由都经过限流
pub fn create_router(state: AppState, throttle: Arc<Throttle>) -> Router {
    let base_uri = state.config.api_base_uri.clone();
    let api = Router::new().merge(admin_routes()).merge(cache_routes());

    let router = if base_uri.is_empty() || base_uri == "/" {
        api
    } else {
        Router::new().nest(&base_uri, api)
    };

    router
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn_with_state(throttle, rate_limit))
        .with_state(state)
}
