//! Redis 持久存储
//!
//! 复用一个多路复用连接，连接失败后在下次调用时重建。每条命令都受
//! `timeout` 约束，Redis 卡住时不会无限期挂起请求。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::Mutex;

use super::{DurableStore, ttl_secs};
use crate::error::{ThrottleError, ThrottleResult};

pub struct RedisStore {
    redis: Arc<RedisClient>,
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// 创建存储，不会立即建立连接
    pub fn new(redis: RedisClient, timeout: Duration) -> Self {
        Self {
            redis: Arc::new(redis),
            connection: Mutex::new(None),
            timeout,
        }
    }

    pub fn open(url: &str, timeout: Duration) -> ThrottleResult<Self> {
        let client = RedisClient::open(url)?;
        Ok(Self::new(client, timeout))
    }

    async fn connection(&self) -> ThrottleResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .bounded(self.redis.get_multiplexed_async_connection())
            .await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// 给单个 Redis 调用加超时
    async fn bounded<T, F>(&self, fut: F) -> ThrottleResult<T>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ThrottleError::StoreUnavailable(format!(
                "redis call timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// 执行命令；连接层错误时丢弃缓存的连接
    async fn run<T, F, Fut>(&self, op: F) -> ThrottleResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let conn = self.connection().await?;
        let result = tokio::time::timeout(self.timeout, op(conn)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    tracing::warn!("Redis connection lost, will reconnect: {}", e);
                    *self.connection.lock().await = None;
                }
                Err(e.into())
            }
            Err(_) => {
                *self.connection.lock().await = None;
                Err(ThrottleError::StoreUnavailable(format!(
                    "redis call timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

impl DurableStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<Option<String>>> {
        Box::pin(self.run(move |mut conn| async move { conn.get(key).await }))
    }

    fn set_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(self.run(move |mut conn| async move {
            conn.set_ex(key, value, ttl_secs(ttl)).await
        }))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(self.run(move |mut conn| async move { conn.del(key).await }))
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, ThrottleResult<i64>> {
        Box::pin(self.run(move |mut conn| async move {
            // 同一事务内先以 NX 建键并带上过期时间，INCR 不会清除已有的过期时间
            let ttl_ms = ttl.as_millis().max(1) as u64;
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(key)
                .arg(0)
                .arg("PX")
                .arg(ttl_ms)
                .arg("NX")
                .ignore()
                .incr(key, 1)
                .query_async(&mut conn)
                .await?;
            Ok(count)
        }))
    }

    fn flush<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ThrottleResult<u64>> {
        Box::pin(self.run(move |mut conn| async move {
            let pattern = format!("{}*", prefix);
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(200)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    let n: u64 = conn.del(&keys).await?;
                    removed += n;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(removed)
        }))
    }

    fn log_append<'a>(
        &'a self,
        key: &'a str,
        score: i64,
        entry: String,
    ) -> BoxFuture<'a, ThrottleResult<()>> {
        Box::pin(self.run(move |mut conn| async move {
            let _: i64 = conn.zadd(key, entry, score).await?;
            Ok(())
        }))
    }

    fn log_trim<'a>(&'a self, key: &'a str, min_score: i64) -> BoxFuture<'a, ThrottleResult<u64>> {
        Box::pin(self.run(move |mut conn| async move {
            conn.zrembyscore(key, "-inf", format!("({}", min_score)).await
        }))
    }

    fn log_range<'a>(
        &'a self,
        key: &'a str,
        min_score: i64,
        max_score: i64,
    ) -> BoxFuture<'a, ThrottleResult<Vec<String>>> {
        Box::pin(self.run(move |mut conn| async move {
            conn.zrangebyscore(key, min_score, max_score).await
        }))
    }
}
