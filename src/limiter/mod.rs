//! 固定窗口限流与封禁升级
//!
//! 每个调用方标识在一个固定窗口内最多尝试 `max_attempts` 次。窗口在到期后的第一次尝试时
//! 重新开始（固定窗口而非滑动窗口，精度换简单，需要保持兼容）。窗口内次数用完后，
//! 下一次 `check` 会把标识置为封禁状态，直到 `block_duration` 结束。
//!
//! 状态流转：
//!
//! ```text
//! FRESH --record--> WITHIN_WINDOW(1) --record--> ... WITHIN_WINDOW(N)
//!   ^                                                   |
//!   |                                   check 发现 attempts >= N
//!   |                                                   v
//!   +------------- 窗口与封禁均结束 ------------------ BLOCKED
//! ```
//!
//! `check_and_record` 在同一进程内按标识加锁，把检查和记录合并为一步；多个进程共享同一个
//! 存储时仍可能出现先查后写的竞争，这一点由存储本身的一致性决定。

mod entry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::keys::rate_limit_key;
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::{ThrottleError, ThrottleResult};
use crate::metrics::MetricsCollector;
use crate::store::{DurableStore, SweepGate};

pub use entry::{RateLimitDecision, RateLimitEntry};

/// 存储错误计入的指标命名空间
pub const METRICS_NAMESPACE: &str = "rate_limit";

#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    metrics: Option<MetricsCollector>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sweep: SweepGate,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> ThrottleResult<Self> {
        config.validate()?;
        let sweep = SweepGate::new(clock.now_ms());
        Ok(Self {
            store,
            clock,
            config,
            metrics: None,
            locks: Mutex::new(HashMap::new()),
            sweep,
        })
    }

    /// 挂接指标收集器，存储错误计入 `rate_limit` 命名空间
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 检查是否允许本次尝试
    ///
    /// 窗口内次数已用完时，本次检查会把标识置为封禁状态并持久化，即检查本身就是触发封禁的动作。
    /// 只想展示剩余次数时请使用 `peek`。
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        self.sweep_expired().await;
        self.evaluate(identifier, true).await
    }

    /// 与 `check` 相同的判定，但不会写入任何状态
    pub async fn peek(&self, identifier: &str) -> RateLimitDecision {
        self.evaluate(identifier, false).await
    }

    /// 记录一次已经执行的尝试
    pub async fn record(&self, identifier: &str) {
        self.sweep_expired().await;
        self.record_attempt(identifier).await;
    }

    /// 检查并在允许时记录，同一进程内对同一标识串行执行
    pub async fn check_and_record(&self, identifier: &str) -> RateLimitDecision {
        self.sweep_expired().await;
        let lock = self.key_lock(identifier);
        let decision = {
            let _guard = lock.lock().await;
            let mut decision = self.evaluate(identifier, true).await;
            if decision.allowed && !decision.degraded {
                if let Some(entry) = self.record_attempt(identifier).await {
                    decision.attempts_remaining =
                        self.config.max_attempts.saturating_sub(entry.attempts);
                    decision.reset_time = Some(entry.window_end(&self.config));
                }
            }
            decision
        };
        self.release_key_lock(identifier, lock);
        decision
    }

    /// 清除标识的全部状态（管理操作）
    pub async fn reset(&self, identifier: &str) -> ThrottleResult<()> {
        self.store.delete(&rate_limit_key(identifier)).await?;
        tracing::info!("Rate limit state reset for {}", identifier);
        Ok(())
    }

    async fn evaluate(&self, identifier: &str, mutate: bool) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let limit = self.config.max_attempts;

        let entry = match self.load(identifier).await {
            Ok(entry) => entry,
            Err(e) => return self.degraded(identifier, now, &e),
        };
        let Some(mut entry) = entry else {
            return RateLimitDecision::fresh(limit);
        };

        if let Some(until) = entry.blocked_until.filter(|_| entry.is_blocked(now)) {
            return RateLimitDecision::blocked(limit, until);
        }

        if entry.is_stale(now, &self.config) {
            if mutate {
                // 顺带清理已失效的条目
                if let Err(e) = self.store.delete(&rate_limit_key(identifier)).await {
                    self.report_store_error("gc", identifier, &e);
                }
            }
            return RateLimitDecision::fresh(limit);
        }

        if entry.attempts >= limit {
            if !mutate {
                return RateLimitDecision {
                    allowed: false,
                    limit,
                    attempts_remaining: 0,
                    reset_time: Some(entry.window_end(&self.config)),
                    blocked_until: None,
                    degraded: false,
                };
            }
            let until = now + self.config.block_duration_ms as i64;
            entry.blocked_until = Some(until);
            tracing::warn!(
                attempts = entry.attempts,
                "Rate limit exceeded for {}, blocked until {}",
                identifier,
                until
            );
            self.save(identifier, &entry, now).await;
            return RateLimitDecision::blocked(limit, until);
        }

        RateLimitDecision {
            allowed: true,
            limit,
            attempts_remaining: limit - entry.attempts,
            reset_time: Some(entry.window_end(&self.config)),
            blocked_until: None,
            degraded: false,
        }
    }

    async fn record_attempt(&self, identifier: &str) -> Option<RateLimitEntry> {
        let now = self.clock.now_ms();
        let existing = match self.load(identifier).await {
            Ok(entry) => entry,
            Err(e) => {
                self.report_store_error("record", identifier, &e);
                return None;
            }
        };

        let entry = match existing {
            Some(mut entry) if !entry.is_stale(now, &self.config) => {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_attempt = now;
                entry
            }
            _ => RateLimitEntry::first_attempt(now),
        };
        tracing::debug!(attempts = entry.attempts, "Recorded attempt for {}", identifier);
        self.save(identifier, &entry, now).await;
        Some(entry)
    }

    async fn load(&self, identifier: &str) -> ThrottleResult<Option<RateLimitEntry>> {
        let Some(json) = self.store.get(&rate_limit_key(identifier)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // 损坏的条目按不存在处理，下一次写入会覆盖它
                tracing::warn!("Discarding unreadable rate limit entry for {}: {}", identifier, e);
                self.report_error();
                Ok(None)
            }
        }
    }

    async fn save(&self, identifier: &str, entry: &RateLimitEntry, now: i64) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                self.report_store_error("save", identifier, &ThrottleError::from(e));
                return;
            }
        };
        let ttl_ms = (entry.expires_at(&self.config) - now).max(1) as u64;
        if let Err(e) = self
            .store
            .set_ex(&rate_limit_key(identifier), json, Duration::from_millis(ttl_ms))
            .await
        {
            self.report_store_error("save", identifier, &e);
        }
    }

    fn degraded(&self, identifier: &str, now: i64, err: &ThrottleError) -> RateLimitDecision {
        self.report_store_error("check", identifier, err);
        let limit = self.config.max_attempts;
        if self.config.fail_open {
            RateLimitDecision {
                allowed: true,
                limit,
                attempts_remaining: limit,
                reset_time: None,
                blocked_until: None,
                degraded: true,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit,
                attempts_remaining: 0,
                reset_time: Some(now + self.config.window_ms as i64),
                blocked_until: None,
                degraded: true,
            }
        }
    }

    /// 周期性清理存储中只被访问过一次、早已过期的条目
    async fn sweep_expired(&self) {
        if !self.sweep.try_begin(self.clock.now_ms()) {
            return;
        }
        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Swept expired store entries"),
            Err(e) => self.report_store_error("sweep", "*", &e),
        }
    }

    fn key_lock(&self, identifier: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(identifier.to_string()).or_default().clone()
    }

    fn release_key_lock(&self, identifier: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // 表中一份加上手里这一份，说明没有其他任务在等待
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(identifier);
        }
    }

    fn report_store_error(&self, op: &str, identifier: &str, err: &ThrottleError) {
        tracing::warn!(
            op,
            fail_open = self.config.fail_open,
            "Rate limit store error for {}: {}",
            identifier,
            err
        );
        self.report_error();
    }

    fn report_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(METRICS_NAMESPACE);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;

    const HOUR_MS: i64 = 3_600_000;

    struct Fixture {
        limiter: RateLimiter,
        store: Arc<MemoryStore>,
        clock: MockClock,
        metrics: MetricsCollector,
    }

    fn fixture(config: RateLimitConfig) -> Fixture {
        let clock = MockClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let metrics = MetricsCollector::new(None, Arc::new(clock.clone()));
        let limiter = RateLimiter::new(store.clone(), Arc::new(clock.clone()), config)
            .unwrap()
            .with_metrics(metrics.clone());
        Fixture {
            limiter,
            store,
            clock,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_fresh_identifier_has_full_quota() {
        let f = fixture(RateLimitConfig::default());
        let decision = f.limiter.check("u1").await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts_remaining, 5);
        assert_eq!(decision.reset_time, None);
        assert_eq!(decision.blocked_until, None);
    }

    #[tokio::test]
    async fn test_block_after_max_attempts_and_recovery() {
        let f = fixture(RateLimitConfig::default());
        for _ in 0..5 {
            assert!(f.limiter.check("u1").await.allowed);
            f.limiter.record("u1").await;
        }

        let now = f.clock.now_ms();
        let decision = f.limiter.check("u1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_until, Some(now + HOUR_MS));

        f.clock.advance_ms(HOUR_MS + 1_000);
        let decision = f.limiter.check("u1").await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts_remaining, 5);
    }

    #[tokio::test]
    async fn test_block_is_monotonic_until_expiry() {
        let f = fixture(RateLimitConfig::default());
        for _ in 0..5 {
            f.limiter.record("u1").await;
        }
        let until = f.limiter.check("u1").await.blocked_until.unwrap();

        f.clock.set(until - 1);
        let decision = f.limiter.check("u1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_until, Some(until));

        f.clock.set(until);
        let decision = f.limiter.check("u1").await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts_remaining, 5);
    }

    #[tokio::test]
    async fn test_window_reset_restores_quota() {
        let f = fixture(RateLimitConfig::default());
        for _ in 0..4 {
            f.limiter.record("u1").await;
        }
        assert_eq!(f.limiter.check("u1").await.attempts_remaining, 1);

        f.clock.advance_ms(900_000);
        assert_eq!(f.limiter.check("u1").await.attempts_remaining, 5);

        // 过期后的第一次记录开启新窗口
        f.limiter.record("u1").await;
        assert_eq!(f.limiter.check("u1").await.attempts_remaining, 4);
    }

    #[tokio::test]
    async fn test_block_shorter_than_window_resets_to_fresh() {
        let f = fixture(RateLimitConfig {
            block_duration_ms: 1_000,
            ..RateLimitConfig::default()
        });
        for _ in 0..5 {
            f.limiter.record("u1").await;
        }
        assert!(!f.limiter.check("u1").await.allowed);

        f.clock.advance_ms(1_000);
        let decision = f.limiter.check("u1").await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts_remaining, 5);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let f = fixture(RateLimitConfig::default());
        for _ in 0..5 {
            f.limiter.record("u1").await;
        }
        assert!(!f.limiter.check("u1").await.allowed);

        f.limiter.reset("u1").await.unwrap();
        f.limiter.reset("u1").await.unwrap();
        assert_eq!(f.limiter.check("u1").await.attempts_remaining, 5);
    }

    #[tokio::test]
    async fn test_peek_never_blocks() {
        let f = fixture(RateLimitConfig::default());
        for _ in 0..5 {
            f.limiter.record("u1").await;
        }
        for _ in 0..3 {
            let decision = f.limiter.peek("u1").await;
            assert!(!decision.allowed);
            assert_eq!(decision.blocked_until, None);
        }
        let stored = f.store.get("rate_limit:u1").await.unwrap().unwrap();
        let entry: RateLimitEntry = serde_json::from_str(&stored).unwrap();
        assert_eq!(entry.blocked_until, None);
    }

    #[tokio::test]
    async fn test_check_and_record_counts_current_attempt() {
        let f = fixture(RateLimitConfig::default());
        let start = f.clock.now_ms();
        for expected in (0..5).rev() {
            let decision = f.limiter.check_and_record("u1").await;
            assert!(decision.allowed);
            assert_eq!(decision.attempts_remaining, expected);
            assert_eq!(decision.reset_time, Some(start + 900_000));
        }
        let decision = f.limiter.check_and_record("u1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_until, Some(start + HOUR_MS));
        assert_eq!(f.limiter.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_check_and_record_never_exceeds_quota() {
        let f = fixture(RateLimitConfig {
            max_attempts: 3,
            ..RateLimitConfig::default()
        });
        let limiter = Arc::new(f.limiter);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_record("shared").await.allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(limiter.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_down() {
        let f = fixture(RateLimitConfig::default());
        f.store.set_online(false);

        let decision = f.limiter.check("u1").await;
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.attempts_remaining, 5);
        assert_eq!(f.metrics.get(METRICS_NAMESPACE).errors, 1);

        // 记录失败同样被吞掉
        f.limiter.record("u1").await;
        assert_eq!(f.metrics.get(METRICS_NAMESPACE).errors, 2);
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_down() {
        let f = fixture(RateLimitConfig {
            fail_open: false,
            ..RateLimitConfig::default()
        });
        f.store.set_online(false);

        let decision = f.limiter.check_and_record("u1").await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.reset_time, Some(f.clock.now_ms() + 900_000));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_treated_as_fresh() {
        let f = fixture(RateLimitConfig::default());
        f.store
            .set_ex("rate_limit:u1", "garbage".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(f.limiter.check("u1").await.attempts_remaining, 5);
        assert_eq!(f.metrics.get(METRICS_NAMESPACE).errors, 1);
    }

    #[tokio::test]
    async fn test_stale_entries_are_collected_on_check() {
        let f = fixture(RateLimitConfig::default());
        f.limiter.record("u1").await;
        f.clock.advance_ms(900_000);

        // 存储 TTL 与窗口相同，条目此时已由存储过期；这里手动写回一份模拟 TTL 更长的后端
        let stale = RateLimitEntry::first_attempt(f.clock.now_ms() - 900_000);
        f.store
            .set_ex(
                "rate_limit:u1",
                serde_json::to_string(&stale).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        f.limiter.check("u1").await;
        assert!(f.store.get("rate_limit:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_off_identifiers_are_swept() {
        let f = fixture(RateLimitConfig::default());
        for i in 0..1000 {
            f.limiter.record(&format!("once-{}", i)).await;
        }
        assert_eq!(f.store.held_keys(), 1000);

        f.clock.advance_ms(5 * HOUR_MS);
        for i in 0..10 {
            f.limiter.check(&format!("other-{}", i)).await;
        }
        assert_eq!(f.store.held_keys(), 0);
        assert_eq!(f.store.flush("rate_limit:").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_interval() {
        let f = fixture(RateLimitConfig {
            window_ms: 1_000,
            block_duration_ms: 1_000,
            ..RateLimitConfig::default()
        });
        f.limiter.record("u1").await;
        f.clock.advance_ms(1_000);

        f.limiter.check("u2").await;
        assert_eq!(f.store.held_keys(), 1);

        f.clock.advance_ms(crate::store::SWEEP_INTERVAL_MS);
        f.limiter.check("u2").await;
        assert_eq!(f.store.held_keys(), 0);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let clock = MockClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let result = RateLimiter::new(
            store,
            Arc::new(clock),
            RateLimitConfig {
                max_attempts: 0,
                ..RateLimitConfig::default()
            },
        );
        assert!(matches!(result, Err(ThrottleError::Configuration(_))));
    }
}
