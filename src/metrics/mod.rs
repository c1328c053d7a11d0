//! 缓存指标
//!
//! 按命名空间（缓存键的第一段，如 `jobs`、`profile`）累计命中、未命中、写入、删除和错误次数。
//! 计数器是区间计数：每次周期性上报后清零，而不是累计总数。
//!
//! 记录操作只在内存中加锁更新，不涉及 I/O，可以放在请求热路径上。

mod reporter;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::cache::keys::{METRICS_LOG_KEY, namespace_of};
use crate::clock::Clock;
use crate::error::ThrottleResult;
use crate::store::DurableStore;

pub use reporter::ReporterHandle;

/// 报告在持久日志中保留的时长
pub const REPORT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// 单个命名空间的计数器
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetricsEntry {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// 命中时响应时间的滑动平均值（毫秒）
    pub avg_response_time_ms: f64,
}

impl CacheMetricsEntry {
    /// 命中率，无请求时为 0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits.saturating_add(self.misses);
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn record_hit(&mut self, response_time_ms: f64) {
        self.hits += 1;
        let sample = response_time_ms.max(0.0);
        self.avg_response_time_ms += (sample - self.avg_response_time_ms) / self.hits as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    #[serde(flatten)]
    pub counters: CacheMetricsEntry,
    pub hit_rate: f64,
}

/// 一次周期性上报的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// 上报时间（Unix 毫秒）
    pub timestamp: i64,
    pub namespaces: BTreeMap<String, NamespaceSummary>,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    counters: Mutex<HashMap<String, CacheMetricsEntry>>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
}

impl MetricsCollector {
    /// `store` 为空时只在内存中统计，上报不落盘
    pub fn new(store: Option<Arc<dyn DurableStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counters: Mutex::new(HashMap::new()),
                store,
                clock,
            }),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<String, CacheMetricsEntry>> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn update<F: FnOnce(&mut CacheMetricsEntry)>(&self, namespace: &str, f: F) {
        let mut counters = self.counters();
        match counters.get_mut(namespace) {
            Some(entry) => f(entry),
            None => {
                let mut entry = CacheMetricsEntry::default();
                f(&mut entry);
                counters.insert(namespace.to_string(), entry);
            }
        }
    }

    pub fn record_hit(&self, namespace: &str, response_time_ms: f64) {
        self.update(namespace, |e| e.record_hit(response_time_ms));
    }

    pub fn record_miss(&self, namespace: &str) {
        self.update(namespace, |e| e.misses += 1);
    }

    pub fn record_set(&self, namespace: &str) {
        self.update(namespace, |e| e.sets += 1);
    }

    pub fn record_delete(&self, namespace: &str) {
        self.update(namespace, |e| e.deletes += 1);
    }

    pub fn record_error(&self, namespace: &str) {
        self.update(namespace, |e| e.errors += 1);
    }

    pub fn hit_rate(&self, namespace: &str) -> f64 {
        self.counters()
            .get(namespace)
            .map_or(0.0, CacheMetricsEntry::hit_rate)
    }

    /// 指定命名空间的当前计数
    pub fn get(&self, namespace: &str) -> CacheMetricsEntry {
        self.counters().get(namespace).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CacheMetricsEntry> {
        self.counters()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.counters().clear();
    }

    /// 带指标的读穿缓存
    ///
    /// 先调用 `get_cached`；命中则记录命中与耗时后返回。未命中时执行 `operation`，
    /// 成功后通过 `set_cached` 写回缓存并记录写入。`operation` 的错误记为一次错误并原样返回。
    pub async fn with_metrics<T, E, Op, OpFut, Get, GetFut, Set, SetFut>(
        &self,
        namespace: &str,
        operation: Op,
        get_cached: Get,
        set_cached: Set,
    ) -> Result<T, E>
    where
        T: Clone,
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
        Get: FnOnce() -> GetFut,
        GetFut: Future<Output = Option<T>>,
        Set: FnOnce(T) -> SetFut,
        SetFut: Future<Output = ()>,
    {
        let started = Instant::now();
        if let Some(value) = get_cached().await {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            self.record_hit(namespace, elapsed);
            tracing::debug!(namespace, elapsed_ms = elapsed, "cache hit");
            return Ok(value);
        }

        self.record_miss(namespace);
        match operation().await {
            Ok(value) => {
                set_cached(value.clone()).await;
                self.record_set(namespace);
                Ok(value)
            }
            Err(e) => {
                self.record_error(namespace);
                Err(e)
            }
        }
    }

    /// 绑定到 `CacheManager` 的 `with_metrics`，命名空间取自键的第一段
    pub async fn cached<T, E, Op, OpFut>(
        &self,
        cache: &CacheManager,
        key: &str,
        ttl_secs: u64,
        operation: Op,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone,
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
    {
        let namespace = namespace_of(key);
        self.with_metrics(
            namespace,
            operation,
            || cache.get::<T>(key),
            |value: T| async move {
                if let Err(e) = cache.set(key, &value, ttl_secs).await {
                    tracing::warn!("Failed to cache value for {}: {}", key, e);
                }
            },
        )
        .await
    }

    /// 上报并清零
    ///
    /// 计数器在锁内整体取出，上报期间产生的新计数进入下一个区间。
    /// 持久化失败只记录日志，不影响缓存本身。
    pub async fn report(&self) -> MetricsReport {
        let timestamp = self.inner.clock.now_ms();
        let counters = std::mem::take(&mut *self.counters());
        let report = MetricsReport {
            timestamp,
            namespaces: counters
                .into_iter()
                .map(|(ns, counters)| {
                    let hit_rate = counters.hit_rate();
                    (ns, NamespaceSummary { counters, hit_rate })
                })
                .collect(),
        };

        if let Some(store) = &self.inner.store {
            if let Err(e) = Self::persist(store.as_ref(), &report).await {
                tracing::warn!("Failed to persist cache metrics report: {}", e);
            }
        }

        tracing::info!(
            namespaces = report.namespaces.len(),
            "cache metrics report flushed"
        );
        report
    }

    async fn persist(store: &dyn DurableStore, report: &MetricsReport) -> ThrottleResult<()> {
        let json = serde_json::to_string(report)?;
        store
            .log_append(METRICS_LOG_KEY, report.timestamp, json)
            .await?;
        let cutoff = report.timestamp - REPORT_RETENTION.as_millis() as i64;
        let trimmed = store.log_trim(METRICS_LOG_KEY, cutoff).await?;
        if trimmed > 0 {
            tracing::debug!(trimmed, "trimmed expired metrics reports");
        }
        Ok(())
    }

    /// 读取 `since_ms` 之后的已持久化报告
    pub async fn recent_reports(&self, since_ms: i64) -> ThrottleResult<Vec<MetricsReport>> {
        let Some(store) = &self.inner.store else {
            return Ok(Vec::new());
        };
        let raw = store.log_range(METRICS_LOG_KEY, since_ms, i64::MAX).await?;
        Ok(raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!("Skipping unreadable metrics report: {}", e);
                    None
                }
            })
            .collect())
    }

    /// 启动后台上报任务
    pub fn spawn_reporter(&self, interval: Duration) -> ReporterHandle {
        reporter::spawn(self.clone(), interval)
    }
}
