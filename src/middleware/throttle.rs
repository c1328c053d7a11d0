//! 限流包装
//!
//! `ThrottleMiddleware::wrap` 把任意异步操作包装成受限流保护的操作。调用方标识由调用方注入，
//! 这里只负责校验。被拒绝时不执行操作，直接返回带重试时间的结构化拒绝结果；允许时执行操作，
//! 并在结果上附带 limit / remaining / reset 信息。
//!
//! 尝试次数在放行的同时记录（`check_and_record`），与被包装操作本身成功与否无关。

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::ThrottleResult;
use crate::limiter::{RateLimitDecision, RateLimiter};
use crate::metrics::MetricsCollector;
use crate::store::DurableStore;

/// 标识最大长度（字节）
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// 附加到每个响应上的限流信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// 窗口重置时间（Unix 毫秒）
    pub reset: i64,
}

/// 放行后的操作结果
#[derive(Debug, Clone, PartialEq)]
pub struct Throttled<T> {
    pub value: T,
    pub headers: RateLimitHeaders,
}

/// 限流拒绝
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub headers: RateLimitHeaders,
    pub retry_after_secs: u64,
    pub blocked_until: Option<i64>,
    /// 因存储不可用按失败即拒绝策略拒绝
    pub degraded: bool,
}

impl Denial {
    /// HTTP 429
    pub const STATUS: u16 = 429;

    pub fn body(&self) -> DenialBody {
        DenialBody {
            error: "Too Many Requests".to_string(),
            message: format!("请求过于频繁，请在{}秒后重试", self.retry_after_secs),
            retry_after: self.retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("rate limit exceeded, retry after {} seconds", .0.retry_after_secs)]
    Denied(Denial),
    #[error("invalid caller identifier: {0}")]
    InvalidIdentifier(String),
}

/// 校验调用方标识：非空、长度有限、不含控制字符
pub fn validate_identifier(identifier: &str) -> Result<(), Rejection> {
    if identifier.trim().is_empty() {
        return Err(Rejection::InvalidIdentifier("identifier is empty".into()));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(Rejection::InvalidIdentifier(format!(
            "identifier longer than {} bytes",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.chars().any(char::is_control) {
        return Err(Rejection::InvalidIdentifier(
            "identifier contains control characters".into(),
        ));
    }
    Ok(())
}

/// 限流包装工厂，持有共享的存储、时钟和指标
#[derive(Debug, Clone)]
pub struct ThrottleMiddleware {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    metrics: Option<MetricsCollector>,
}

impl ThrottleMiddleware {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 按配置创建一个限流闸门
    pub fn throttle(&self, config: RateLimitConfig) -> ThrottleResult<Throttle> {
        let mut limiter = RateLimiter::new(self.store.clone(), self.clock.clone(), config)?;
        if let Some(metrics) = &self.metrics {
            limiter = limiter.with_metrics(metrics.clone());
        }
        Ok(Throttle::new(Arc::new(limiter)))
    }

    /// 包装操作，配置非法时立即失败
    pub fn wrap<F>(&self, operation: F, config: RateLimitConfig) -> ThrottleResult<ThrottledOperation<F>> {
        Ok(ThrottledOperation {
            throttle: self.throttle(config)?,
            operation,
        })
    }
}

/// 限流闸门：校验标识并做一次原子的检查加记录
#[derive(Debug, Clone)]
pub struct Throttle {
    limiter: Arc<RateLimiter>,
}

impl Throttle {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn admit(&self, identifier: &str) -> Result<RateLimitHeaders, Rejection> {
        validate_identifier(identifier)?;

        let decision = self.limiter.check_and_record(identifier).await;
        let now = self.limiter.clock().now_ms();
        let headers = self.headers(&decision, now);

        if decision.allowed {
            return Ok(headers);
        }

        let target = decision.blocked_until.unwrap_or(headers.reset);
        let denial = Denial {
            headers,
            retry_after_secs: retry_after_secs(target, now),
            blocked_until: decision.blocked_until,
            degraded: decision.degraded,
        };
        tracing::debug!(
            retry_after = denial.retry_after_secs,
            degraded = denial.degraded,
            "Request throttled"
        );
        Err(Rejection::Denied(denial))
    }

    fn headers(&self, decision: &RateLimitDecision, now: i64) -> RateLimitHeaders {
        let window_end = now + self.limiter.config().window_ms as i64;
        RateLimitHeaders {
            limit: decision.limit,
            remaining: decision.attempts_remaining,
            reset: decision.reset_time.unwrap_or(window_end),
        }
    }
}

/// 受限流保护的操作
#[derive(Debug, Clone)]
pub struct ThrottledOperation<F> {
    throttle: Throttle,
    operation: F,
}

impl<F> ThrottledOperation<F> {
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// 以 `identifier` 的名义执行操作
    pub async fn call<I, Fut, T>(&self, identifier: &str, input: I) -> Result<Throttled<T>, Rejection>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        let headers = self.throttle.admit(identifier).await?;
        let value = (self.operation)(input).await;
        Ok(Throttled { value, headers })
    }
}

/// `ceil((target - now) / 1000)`，至少 1 秒
fn retry_after_secs(target: i64, now: i64) -> u64 {
    let remaining_ms = (target - now).max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn middleware() -> (ThrottleMiddleware, Arc<MemoryStore>, MockClock) {
        let clock = MockClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let middleware = ThrottleMiddleware::new(store.clone(), Arc::new(clock.clone()));
        (middleware, store, clock)
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(10_001, 0), 11);
        assert_eq!(retry_after_secs(10_000, 0), 10);
        assert_eq!(retry_after_secs(0, 0), 1);
        assert_eq!(retry_after_secs(-5, 0), 1);
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("10.0.0.1|/login").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("   ").is_err());
        assert!(validate_identifier("a\nb").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_denied_operation_is_not_invoked() {
        let (middleware, _, clock) = middleware();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = middleware
            .wrap(
                move |n: u32| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        n * 2
                    }
                },
                RateLimitConfig {
                    max_attempts: 2,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap();

        let start = clock.now_ms();
        let first = op.call("u1", 1).await.unwrap();
        assert_eq!(first.value, 2);
        assert_eq!(
            first.headers,
            RateLimitHeaders {
                limit: 2,
                remaining: 1,
                reset: start + 900_000
            }
        );
        assert_eq!(op.call("u1", 2).await.unwrap().headers.remaining, 0);

        clock.advance_ms(500);
        match op.call("u1", 3).await {
            Err(Rejection::Denied(denial)) => {
                assert_eq!(denial.retry_after_secs, 3600);
                assert_eq!(denial.headers.remaining, 0);
                assert_eq!(denial.blocked_until, Some(start + 500 + 3_600_000));
                assert_eq!(denial.body().retry_after, 3600);
            }
            other => panic!("expected denial, got {:?}", other.map(|t| t.value)),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_operations_still_count() {
        let (middleware, _, _) = middleware();
        let op = middleware
            .wrap(
                |_: ()| async { Err::<(), &str>("bad password") },
                RateLimitConfig {
                    max_attempts: 1,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap();

        let result = op.call("u1", ()).await.unwrap();
        assert!(result.value.is_err());
        assert!(matches!(op.call("u1", ()).await, Err(Rejection::Denied(_))));
    }

    #[tokio::test]
    async fn test_invalid_identifier_never_reaches_limiter() {
        let (middleware, store, _) = middleware();
        let op = middleware
            .wrap(|_: ()| async {}, RateLimitConfig::default())
            .unwrap();

        assert!(matches!(
            op.call("", ()).await,
            Err(Rejection::InvalidIdentifier(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fail_closed_denial_uses_window_for_retry() {
        let (middleware, store, _) = middleware();
        let op = middleware
            .wrap(
                |_: ()| async {},
                RateLimitConfig {
                    fail_open: false,
                    window_ms: 60_000,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap();
        store.set_online(false);

        match op.call("u1", ()).await {
            Err(Rejection::Denied(denial)) => {
                assert!(denial.degraded);
                assert_eq!(denial.retry_after_secs, 60);
            }
            _ => panic!("expected fail-closed denial"),
        }
    }

    #[tokio::test]
    async fn test_fail_open_still_attaches_headers() {
        let (middleware, store, clock) = middleware();
        let op = middleware
            .wrap(|_: ()| async { "ok" }, RateLimitConfig::default())
            .unwrap();
        store.set_online(false);

        let result = op.call("u1", ()).await.unwrap();
        assert_eq!(result.value, "ok");
        assert_eq!(result.headers.remaining, 5);
        assert_eq!(result.headers.reset, clock.now_ms() + 900_000);
    }

    #[test]
    fn test_wrap_rejects_invalid_config() {
        let (middleware, _, _) = middleware();
        let result = middleware.wrap(
            |_: ()| async {},
            RateLimitConfig {
                window_ms: 0,
                ..RateLimitConfig::default()
            },
        );
        assert!(result.is_err());
    }
}
