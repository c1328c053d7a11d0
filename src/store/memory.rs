use std::collections::HashMap;
use std::future::ready;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::DurableStore;
use crate::clock::Clock;
use crate::error::{ThrottleError, ThrottleResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: i64,
}

/// 进程内存储
///
/// 未配置 Redis 时作为单进程部署的持久层使用，过期时间由注入的时钟驱动。
/// `set_online(false)` 可模拟存储故障，此时所有操作返回 `StoreUnavailable`。
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, StoredValue>>,
    logs: Mutex<HashMap<String, Vec<(i64, String)>>>,
    online: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            clock,
        }
    }

    /// 切换在线状态
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// 当前未过期的键数量
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.values()
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 实际占用的键数量，包括已过期但尚未清理的键
    pub fn held_keys(&self) -> usize {
        self.values().len()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        // 锁内不会 panic，中毒时直接沿用内部数据
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, Vec<(i64, String)>>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_online(&self) -> ThrottleResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ThrottleError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        self.clock.now_ms() + ttl.as_millis() as i64
    }

    fn get_sync(&self, key: &str) -> ThrottleResult<Option<String>> {
        self.ensure_online()?;
        let now = self.clock.now_ms();
        let mut values = self.values();
        match values.get(key) {
            Some(v) if v.expires_at > now => Ok(Some(v.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_sync(&self, key: &str, value: String, ttl: Duration) -> ThrottleResult<()> {
        self.ensure_online()?;
        let expires_at = self.expiry(ttl);
        self.values()
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    fn delete_sync(&self, key: &str) -> ThrottleResult<()> {
        self.ensure_online()?;
        self.values().remove(key);
        Ok(())
    }

    fn incr_sync(&self, key: &str, ttl: Duration) -> ThrottleResult<i64> {
        self.ensure_online()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut values = self.values();

        let current = match values.get(key) {
            Some(v) if v.expires_at > now => Some(v),
            _ => None,
        };
        let (count, expires_at) = match current {
            Some(v) => {
                let count = v.value.parse::<i64>().map_err(|_| {
                    ThrottleError::StoreUnavailable(format!("value at {} is not an integer", key))
                })?;
                (count + 1, v.expires_at)
            }
            None => (1, expires_at),
        };
        values.insert(
            key.to_string(),
            StoredValue {
                value: count.to_string(),
                expires_at,
            },
        );
        Ok(count)
    }

    fn purge_sync(&self) -> ThrottleResult<u64> {
        self.ensure_online()?;
        let now = self.clock.now_ms();
        let mut values = self.values();
        let before = values.len();
        values.retain(|_, v| v.expires_at > now);
        Ok((before - values.len()) as u64)
    }

    fn flush_sync(&self, prefix: &str) -> ThrottleResult<u64> {
        self.ensure_online()?;
        let mut values = self.values();
        let before = values.len();
        values.retain(|k, _| !k.starts_with(prefix));
        let mut removed = (before - values.len()) as u64;

        let mut logs = self.logs();
        let before = logs.len();
        logs.retain(|k, _| !k.starts_with(prefix));
        removed += (before - logs.len()) as u64;
        Ok(removed)
    }

    fn log_append_sync(&self, key: &str, score: i64, entry: String) -> ThrottleResult<()> {
        self.ensure_online()?;
        let mut logs = self.logs();
        let log = logs.entry(key.to_string()).or_default();
        let pos = log.partition_point(|(s, _)| *s <= score);
        log.insert(pos, (score, entry));
        Ok(())
    }

    fn log_trim_sync(&self, key: &str, min_score: i64) -> ThrottleResult<u64> {
        self.ensure_online()?;
        let mut logs = self.logs();
        let Some(log) = logs.get_mut(key) else {
            return Ok(0);
        };
        let cut = log.partition_point(|(s, _)| *s < min_score);
        log.drain(..cut);
        Ok(cut as u64)
    }

    fn log_range_sync(&self, key: &str, min: i64, max: i64) -> ThrottleResult<Vec<String>> {
        self.ensure_online()?;
        let logs = self.logs();
        Ok(logs
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|(s, _)| *s >= min && *s <= max)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl DurableStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<Option<String>>> {
        Box::pin(ready(self.get_sync(key)))
    }

    fn set_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(ready(self.set_sync(key, value, ttl)))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(ready(self.delete_sync(key)))
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, ThrottleResult<i64>> {
        Box::pin(ready(self.incr_sync(key, ttl)))
    }

    fn flush<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ThrottleResult<u64>> {
        Box::pin(ready(self.flush_sync(prefix)))
    }

    fn log_append<'a>(
        &'a self,
        key: &'a str,
        score: i64,
        entry: String,
    ) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(ready(self.log_append_sync(key, score, entry)))
    }

    fn log_trim<'a>(&'a self, key: &'a str, min_score: i64) -> BoxFuture<'a, ThrottleResult<u64>> {
        Box::pin(ready(self.log_trim_sync(key, min_score)))
    }

    fn log_range<'a>(
        &'a self,
        key: &'a str,
        min_score: i64,
        max_score: i64,
    ) -> BoxFuture<'a, ThrottleResult<Vec<String>>> {
        Box::pin(ready(self.log_range_sync(key, min_score, max_score)))
    }

    fn purge_expired(&self) -> BoxFuture<'_, ThrottleResult<u64>> {
        Box::pin(ready(self.purge_sync()))
    }
}
