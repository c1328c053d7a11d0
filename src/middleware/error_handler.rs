use axum::{
    body::{Body, Bytes},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use futures_util::{StreamExt, stream};
use tracing::{debug, error};

/// 错误响应体最多记录的字节数
const MAX_LOGGED_BODY: usize = 1024;

/// 记录 5xx 响应及其响应体前缀，429 只记录调试日志
///
/// 只读取日志所需的前几个数据块，响应体原样转发给客户端。
pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        debug!("Throttled {} {}", method, path);
        return response;
    }
    if !status.is_server_error() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let mut rest = body.into_data_stream();
    let mut head: Vec<Result<Bytes, axum::Error>> = Vec::new();
    let mut read = 0usize;
    while read <= MAX_LOGGED_BODY {
        match rest.next().await {
            Some(Ok(chunk)) => {
                read += chunk.len();
                head.push(Ok(chunk));
            }
            Some(Err(e)) => {
                error!("Failed to read error response body for {} {}: {}", method, path, e);
                head.push(Err(e));
                break;
            }
            None => break,
        }
    }

    let mut prefix = Vec::with_capacity(read.min(MAX_LOGGED_BODY));
    for chunk in head.iter().flatten() {
        let take = (MAX_LOGGED_BODY - prefix.len()).min(chunk.len());
        prefix.extend_from_slice(&chunk[..take]);
    }
    error!(
        "Server error on {} {} - Status: {}, Body: {}{}",
        method,
        path,
        parts.status,
        String::from_utf8_lossy(&prefix),
        if read > MAX_LOGGED_BODY { "..." } else { "" }
    );

    // 已读出的数据块放回响应体最前面
    let body = Body::from_stream(stream::iter(head).chain(rest));
    Response::from_parts(parts, body)
}
