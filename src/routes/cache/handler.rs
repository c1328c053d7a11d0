use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::model::{EntryResponse, PutEntryRequest};
use crate::AppState;
use crate::cache::keys::namespace_of;
use crate::error::ThrottleError;
use crate::utils::{error_codes, error_to_api_response, success_to_api_response};

#[axum::debug_handler]
pub async fn get_entry(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    let namespace = namespace_of(&key).to_string();
    let started = Instant::now();
    match state.cache.get::<serde_json::Value>(&key).await {
        Some(value) => {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            state.metrics.record_hit(&namespace, elapsed);
            (
                StatusCode::OK,
                success_to_api_response(EntryResponse {
                    key,
                    value: Some(value),
                }),
            )
        }
        None => {
            state.metrics.record_miss(&namespace);
            (
                StatusCode::NOT_FOUND,
                error_to_api_response(error_codes::NOT_FOUND, format!("缓存项 {} 不存在", key)),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn put_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<PutEntryRequest>,
) -> impl IntoResponse {
    let ttl = req.ttl_secs.unwrap_or(state.cache.config().default_ttl_secs);
    match state.cache.set(&key, &req.value, ttl).await {
        Ok(()) => {
            state.metrics.record_set(namespace_of(&key));
            (
                StatusCode::OK,
                success_to_api_response(EntryResponse { key, value: None }),
            )
        }
        Err(ThrottleError::Configuration(msg)) => (
            StatusCode::BAD_REQUEST,
            error_to_api_response(error_codes::VALIDATION_ERROR, msg),
        ),
        Err(e) => {
            tracing::error!("Failed to cache {}: {}", key, e);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                error_to_api_response(error_codes::VALIDATION_ERROR, e.to_string()),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn delete_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    state.cache.delete(&key).await;
    success_to_api_response(EntryResponse { key, value: None })
}
