use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use throttle_cache::{
    AppState,
    cache::CacheManager,
    clock::{Clock, SystemClock},
    config::{Config, Environment},
    metrics::MetricsCollector,
    middleware::ThrottleMiddleware,
    router::create_router,
    store::{DurableStore, MemoryStore, RedisStore},
};
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置，非法配置直接退出
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!("Running with environment {:?}", config.environment);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    // 设置持久存储：配置了 Redis 则使用 Redis，否则使用进程内存储
    let (store, durable_store): (Arc<dyn DurableStore>, bool) = match &config.redis_url {
        Some(url) => {
            let redis = RedisStore::open(url, config.store_timeout())
                .expect("Failed to create Redis client");
            tracing::info!("Using Redis durable store");
            (Arc::new(redis), true)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process store");
            (Arc::new(MemoryStore::new(clock.clone())), false)
        }
    };

    // 指标、缓存、限流
    let metrics = MetricsCollector::new(Some(store.clone()), clock.clone());
    let cache = CacheManager::new(
        durable_store.then(|| store.clone()),
        clock.clone(),
        config.cache.clone(),
    )
    .expect("Invalid cache configuration")
    .with_metrics(metrics.clone());

    let throttle = ThrottleMiddleware::new(store.clone(), clock.clone())
        .with_metrics(metrics.clone())
        .throttle(config.rate_limit.clone())
        .expect("Invalid rate limit configuration");
    let throttle = Arc::new(throttle);

    // 仅在生产环境周期性上报指标
    let reporter = (config.environment == Environment::Production)
        .then(|| metrics.spawn_reporter(config.metrics_report_interval()));

    let state = AppState {
        config: config.clone(),
        cache: Arc::new(cache),
        metrics,
        limiter: throttle.limiter().clone(),
        durable_store,
    };

    let router = create_router(state, throttle);

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");

    if let Some(reporter) = reporter {
        reporter.shutdown().await;
    }
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
