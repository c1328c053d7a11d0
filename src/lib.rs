use std::sync::Arc;

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod store;
pub mod utils;

use cache::CacheManager;
use config::Config;
use limiter::RateLimiter;
use metrics::MetricsCollector;

pub use error::{ThrottleError, ThrottleResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub cache: Arc<CacheManager>,
    pub metrics: MetricsCollector,
    pub limiter: Arc<RateLimiter>,
    /// 是否配置了 Redis
    pub durable_store: bool,
}
