/// 持久存储抽象
/// 限流条目、缓存条目和指标报告共用同一个存储，通过键前缀区分

pub mod memory;
pub mod redis_store;

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};

use crate::error::ThrottleResult;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// 网络键值存储接口
///
/// 实现方可能随时失败（网络抖动、服务下线），所有失败都以
/// `ThrottleError::StoreUnavailable` 返回，由调用方决定降级策略。
pub trait DurableStore: Send + Sync + Debug {
    /// 读取字符串值
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<Option<String>>>;

    /// 写入并设置过期时间
    fn set_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, ThrottleResult<()>>;

    /// 删除单个键
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<()>>;

    /// 原子自增，首次创建时设置过期时间，返回自增后的值
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, ThrottleResult<i64>>;

    /// 删除所有以 `prefix` 开头的键，返回删除数量
    fn flush<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ThrottleResult<u64>>;

    /// 向按时间排序的日志追加一条记录
    fn log_append<'a>(
        &'a self,
        key: &'a str,
        score: i64,
        entry: String,
    ) -> BoxFuture<'a, ThrottleResult<()>>;

    /// 删除分值小于 `min_score` 的日志记录，返回删除数量
    fn log_trim<'a>(&'a self, key: &'a str, min_score: i64) -> BoxFuture<'a, ThrottleResult<u64>>;

    /// 读取分值在 `[min_score, max_score]` 内的日志记录（按分值升序）
    fn log_range<'a>(
        &'a self,
        key: &'a str,
        min_score: i64,
        max_score: i64,
    ) -> BoxFuture<'a, ThrottleResult<Vec<String>>>;

    /// 清理已过期但仍占用内存的键，返回清理数量
    ///
    /// 自带过期淘汰的后端（如 Redis）保持默认实现即可。
    fn purge_expired(&self) -> BoxFuture<'_, ThrottleResult<u64>> {
        Box::pin(future::ready(Ok(0)))
    }
}

/// 两次过期清理之间的最短间隔（毫秒）
pub const SWEEP_INTERVAL_MS: i64 = 60_000;

/// 过期清理的节流阀
///
/// 距上次清理不足 `SWEEP_INTERVAL_MS` 时拒绝；并发调用中只有一个能拿到本轮清理权。
#[derive(Debug)]
pub(crate) struct SweepGate {
    last_ms: AtomicI64,
}

impl SweepGate {
    pub(crate) fn new(now: i64) -> Self {
        Self {
            last_ms: AtomicI64::new(now),
        }
    }

    pub(crate) fn try_begin(&self, now: i64) -> bool {
        let last = self.last_ms.load(Ordering::Acquire);
        now - last >= SWEEP_INTERVAL_MS
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// TTL 向上取整到秒，且至少为 1 秒
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_sweep_gate_opens_once_per_interval() {
        let gate = SweepGate::new(0);
        assert!(!gate.try_begin(SWEEP_INTERVAL_MS - 1));
        assert!(gate.try_begin(SWEEP_INTERVAL_MS));
        assert!(!gate.try_begin(SWEEP_INTERVAL_MS + 1));
        assert!(gate.try_begin(2 * SWEEP_INTERVAL_MS));
    }
}
