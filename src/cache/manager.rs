use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::keys::{CACHE_PREFIX, durable_cache_key, namespace_of};
use super::models::CacheEntry;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{ThrottleError, ThrottleResult};
use crate::metrics::MetricsCollector;
use crate::store::{DurableStore, SweepGate};

/// 两级缓存
///
/// 读取时先查持久层，持久层出错或未命中时回退到进程内表。写入时总是先写进程内表，
/// 再写持久层，这样即使持久层写入失败或调用方在等待期间被取消，回退层也是热的。
///
/// 持久层错误只记录日志和错误计数，不会返回给调用方。
#[derive(Debug)]
pub struct CacheManager {
    store: Option<Arc<dyn DurableStore>>,
    local: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    metrics: Option<MetricsCollector>,
    sweep: SweepGate,
}

impl CacheManager {
    /// `store` 为空时只使用进程内表
    pub fn new(
        store: Option<Arc<dyn DurableStore>>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> ThrottleResult<Self> {
        config.validate()?;
        let sweep = SweepGate::new(clock.now_ms());
        Ok(Self {
            store,
            local: Mutex::new(HashMap::new()),
            clock,
            config,
            metrics: None,
            sweep,
        })
    }

    /// 挂接指标收集器，持久层错误和删除操作会计入对应命名空间
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn local(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(store) = &self.store {
            let durable_key = durable_cache_key(key);
            match store.get(&durable_key).await {
                Ok(Some(json)) => return self.decode(key, &json),
                Ok(None) => {}
                Err(e) => self.report_store_error("get", key, &e),
            }
        }

        let json = self.local_get(key)?;
        self.decode(key, &json)
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> ThrottleResult<()> {
        if ttl_secs == 0 {
            return Err(ThrottleError::Configuration(format!(
                "ttl for {} must be greater than 0",
                key
            )));
        }
        let json = serde_json::to_string(value).map_err(|e| {
            self.report_error(key);
            ThrottleError::from(e)
        })?;

        let now = self.clock.now_ms();
        if self.sweep.try_begin(now) {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired local cache entries");
            }
        }

        let expires_at = now + (ttl_secs as i64) * 1000;
        self.local_insert(key, CacheEntry::new(json.clone(), expires_at));

        if let Some(store) = &self.store {
            let durable_key = durable_cache_key(key);
            if let Err(e) = store
                .set_ex(&durable_key, json, Duration::from_secs(ttl_secs))
                .await
            {
                self.report_store_error("set", key, &e);
            }
        }
        Ok(())
    }

    /// 使用默认 TTL 写入
    pub async fn set_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ThrottleResult<()> {
        self.set(key, value, self.config.default_ttl_secs).await
    }

    pub async fn delete(&self, key: &str) {
        self.local().remove(key);
        if let Some(metrics) = &self.metrics {
            metrics.record_delete(namespace_of(key));
        }

        if let Some(store) = &self.store {
            let durable_key = durable_cache_key(key);
            if let Err(e) = store.delete(&durable_key).await {
                self.report_store_error("delete", key, &e);
            }
        }
    }

    /// 清空两级缓存，不影响存储中的限流条目
    pub async fn flush(&self) {
        let cleared = {
            let mut local = self.local();
            let n = local.len();
            local.clear();
            n
        };

        if let Some(store) = &self.store {
            match store.flush(CACHE_PREFIX).await {
                Ok(removed) => {
                    tracing::info!(cleared, removed, "cache flushed");
                }
                Err(e) => self.report_store_error("flush", CACHE_PREFIX, &e),
            }
        } else {
            tracing::info!(cleared, "cache flushed");
        }
    }

    /// 清理进程内表中已过期的条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut local = self.local();
        let before = local.len();
        local.retain(|_, entry| entry.is_live(now));
        before - local.len()
    }

    /// 进程内表当前条目数（含尚未清理的过期条目）
    pub fn local_len(&self) -> usize {
        self.local().len()
    }

    fn local_get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        let mut local = self.local();
        match local.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    fn local_insert(&self, key: &str, entry: CacheEntry) {
        let now = self.clock.now_ms();
        let mut local = self.local();

        if let Some(capacity) = self.config.local_capacity {
            if !local.contains_key(key) && local.len() >= capacity {
                local.retain(|_, e| e.is_live(now));
            }
            while !local.contains_key(key) && local.len() >= capacity {
                // 优先淘汰最早过期的条目
                let victim = local
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(victim) => {
                        tracing::debug!("Evicting {} from local cache tier", victim);
                        local.remove(&victim);
                    }
                    None => break,
                }
            }
        }

        local.insert(key.to_string(), entry);
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, json: &str) -> Option<T> {
        match serde_json::from_str(json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Cached value for {} could not be decoded: {}", key, e);
                self.report_error(key);
                None
            }
        }
    }

    fn report_store_error(&self, op: &str, key: &str, err: &ThrottleError) {
        tracing::warn!(op, key, "Cache durable store error, using local tier: {}", err);
        self.report_error(key);
    }

    fn report_error(&self, key: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(namespace_of(key));
        }
    }
}
