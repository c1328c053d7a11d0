//! 时钟抽象
//!
//! 所有时间戳均为 Unix 毫秒。生产环境使用 `SystemClock`，测试中使用可手动推进的 `MockClock`。

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// 获取当前时间的接口
pub trait Clock: Send + Sync + Debug {
    /// 当前时间（Unix 毫秒）
    fn now_ms(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 测试用时钟
///
/// 克隆出的实例共享同一个时间值，在任意一个克隆上推进时间对所有克隆可见。
#[derive(Debug, Clone)]
pub struct MockClock {
    current_ms: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            current_ms: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.current_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}
