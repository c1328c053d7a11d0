use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::model::{
    HealthResponse, MetricsSnapshotResponse, RateLimitStatusResponse, ReportsQuery, ResetResponse,
};
use crate::AppState;
use crate::metrics::{NamespaceSummary, REPORT_RETENTION};
use crate::middleware::validate_identifier;
use crate::utils::{error_codes, error_to_api_response, success_to_api_response};

#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response(HealthResponse {
        status: "ok",
        durable_store: state.durable_store,
    })
}

#[axum::debug_handler]
pub async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let namespaces = state
        .metrics
        .snapshot()
        .into_iter()
        .map(|(ns, counters)| {
            let hit_rate = counters.hit_rate();
            (ns, NamespaceSummary { counters, hit_rate })
        })
        .collect();
    success_to_api_response(MetricsSnapshotResponse { namespaces })
}

#[axum::debug_handler]
pub async fn metrics_reports(
    State(state): State<AppState>,
    Query(query): Query<ReportsQuery>,
) -> impl IntoResponse {
    let since = query.since.unwrap_or_else(|| {
        state.limiter.clock().now_ms() - REPORT_RETENTION.as_millis() as i64
    });
    match state.metrics.recent_reports(since).await {
        Ok(reports) => (StatusCode::OK, success_to_api_response(reports)),
        Err(e) => {
            tracing::error!("Failed to read metrics reports: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                error_to_api_response(error_codes::STORE_UNAVAILABLE, "读取指标报告失败".to_string()),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn peek_rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_identifier(&identifier) {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response(error_codes::VALIDATION_ERROR, e.to_string()),
        );
    }
    // peek 不会触发封禁
    let decision = state.limiter.peek(&identifier).await;
    (
        StatusCode::OK,
        success_to_api_response(RateLimitStatusResponse {
            identifier,
            decision,
        }),
    )
}

#[axum::debug_handler]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_identifier(&identifier) {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response(error_codes::VALIDATION_ERROR, e.to_string()),
        );
    }
    match state.limiter.reset(&identifier).await {
        Ok(()) => (
            StatusCode::OK,
            success_to_api_response(ResetResponse { identifier }),
        ),
        Err(e) => {
            tracing::error!("Failed to reset rate limit for {}: {}", identifier, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                error_to_api_response(error_codes::STORE_UNAVAILABLE, "重置限流状态失败".to_string()),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn flush_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.cache.flush().await;
    (StatusCode::OK, Json(serde_json::json!({ "code": error_codes::SUCCESS, "msg": "success" })))
}
