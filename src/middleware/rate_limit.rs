use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use super::throttle::{RateLimitHeaders, Rejection, Throttle};
use crate::error::ThrottleError;
use crate::utils::caller_identifier;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// 写入 `X-RateLimit-*` 响应头
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitHeaders) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset));
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Denied(denial) => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(denial.body())).into_response();
                let headers = response.headers_mut();
                apply_rate_limit_headers(headers, &denial.headers);
                headers.insert(RETRY_AFTER, HeaderValue::from(denial.retry_after_secs));
                response
            }
            Rejection::InvalidIdentifier(reason) => {
                ThrottleError::InvalidIdentifier(reason).into_response()
            }
        }
    }
}

/// 取客户端 IP：`x-real-ip`，其次 `x-forwarded-for` 的第一个非空项，最后是连接地址
pub fn client_ip(req: &Request<Body>) -> Option<String> {
    // 从连接信息获取原始IP
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .map(|ip| ip.trim().to_string())
        .or(remote_ip) // 降级使用连接IP
}

/// 限流使用的路由：匹配到的路由模板（如 `/api/cache/{key}`），未匹配时退回原始路径
pub fn route_of(req: &Request<Body>) -> &str {
    req.extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or_else(|| req.uri().path())
}

/// 按「客户端 IP + 路由」限流的 axum 中间件
pub async fn rate_limit(
    State(throttle): State<Arc<Throttle>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(ip) = client_ip(&req) else {
        tracing::warn!("Rejecting request without a resolvable client address");
        return Rejection::InvalidIdentifier("client address unavailable".into()).into_response();
    };
    let identifier = caller_identifier(&ip, route_of(&req));

    match throttle.admit(&identifier).await {
        Ok(info) => {
            let mut response = next.run(req).await;
            apply_rate_limit_headers(response.headers_mut(), &info);
            response
        }
        Err(rejection) => {
            tracing::info!(ip = %ip, path = %req.uri().path(), "{}", rejection);
            rejection.into_response()
        }
    }
}
