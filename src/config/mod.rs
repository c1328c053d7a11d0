use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ThrottleError, ThrottleResult};

/// 限流配置
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RateLimitConfig {
    /// 计数窗口长度（毫秒）
    pub window_ms: u64,
    /// 窗口内允许的最大尝试次数
    pub max_attempts: u32,
    /// 超限后的封禁时长（毫秒）
    pub block_duration_ms: u64,
    /// 存储不可用时是否放行
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 900_000,
            max_attempts: 5,
            block_duration_ms: 3_600_000,
            fail_open: true,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> ThrottleResult<()> {
        if self.window_ms == 0 {
            return Err(ThrottleError::Configuration(
                "window_ms must be greater than 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ThrottleError::Configuration(
                "max_attempts must be greater than 0".into(),
            ));
        }
        if self.block_duration_ms == 0 {
            return Err(ThrottleError::Configuration(
                "block_duration_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// 进程内回退层的容量上限，`None` 表示不限制
    pub local_capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            local_capacity: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> ThrottleResult<()> {
        if self.default_ttl_secs == 0 {
            return Err(ThrottleError::Configuration(
                "default_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.local_capacity == Some(0) {
            return Err(ThrottleError::Configuration(
                "local_capacity must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// 运行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" | "test" => Ok(Environment::Development),
            other => Err(ThrottleError::Configuration(format!(
                "unknown APP_ENV: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub redis_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub environment: Environment,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub store_timeout_ms: u64,
    pub metrics_report_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            server_host: "::".to_string(),
            server_port: 3000,
            api_base_uri: "/api".to_string(),
            environment: Environment::Development,
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            store_timeout_ms: 500,
            metrics_report_interval_secs: 300,
        }
    }
}

impl Config {
    /// 从环境变量（及 `.env` 文件）加载配置
    pub fn from_env() -> ThrottleResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 从任意键值来源加载，未设置的项使用默认值
    pub fn from_lookup<F>(lookup: F) -> ThrottleResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let config = Config {
            redis_url: lookup("REDIS_URL").filter(|s| !s.trim().is_empty()),
            server_host: lookup("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
            api_base_uri: lookup("API_BASE_URI").unwrap_or(defaults.api_base_uri),
            environment: parse_or(&lookup, "APP_ENV", defaults.environment)?,
            rate_limit: RateLimitConfig {
                window_ms: parse_or(&lookup, "RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window_ms)?,
                max_attempts: parse_or(
                    &lookup,
                    "RATE_LIMIT_MAX_ATTEMPTS",
                    defaults.rate_limit.max_attempts,
                )?,
                block_duration_ms: parse_or(
                    &lookup,
                    "RATE_LIMIT_BLOCK_DURATION_MS",
                    defaults.rate_limit.block_duration_ms,
                )?,
                fail_open: parse_or(&lookup, "RATE_LIMIT_FAIL_OPEN", defaults.rate_limit.fail_open)?,
            },
            cache: CacheConfig {
                default_ttl_secs: parse_or(
                    &lookup,
                    "CACHE_DEFAULT_TTL_SECS",
                    defaults.cache.default_ttl_secs,
                )?,
                local_capacity: match lookup("CACHE_LOCAL_CAPACITY") {
                    Some(raw) => Some(parse_value("CACHE_LOCAL_CAPACITY", &raw)?),
                    None => None,
                },
            },
            store_timeout_ms: parse_or(&lookup, "STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            metrics_report_interval_secs: parse_or(
                &lookup,
                "METRICS_REPORT_INTERVAL_SECS",
                defaults.metrics_report_interval_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ThrottleResult<()> {
        self.rate_limit.validate()?;
        self.cache.validate()?;
        if self.store_timeout_ms == 0 {
            return Err(ThrottleError::Configuration(
                "STORE_TIMEOUT_MS must be greater than 0".into(),
            ));
        }
        if self.metrics_report_interval_secs == 0 {
            return Err(ThrottleError::Configuration(
                "METRICS_REPORT_INTERVAL_SECS must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_report_interval_secs)
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> ThrottleResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ThrottleError::Configuration(format!("{} has invalid value {:?}", name, raw)))
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> ThrottleResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}
