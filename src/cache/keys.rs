/// 缓存键模块
/// 限流、缓存、指标共用一个存储，统一在这里生成键，避免手工拼接造成冲突

/// 限流条目键前缀
pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// 缓存条目在持久层的键前缀
pub const CACHE_PREFIX: &str = "cache:";

/// 指标报告日志
pub const METRICS_LOG_KEY: &str = "metrics:cache";

/// 生成业务缓存键，例如 `generate_key("jobs", &["42"])` 得到 `jobs:42`
pub fn generate_key<S: AsRef<str>>(prefix: &str, parts: &[S]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.push_str(part.as_ref());
    }
    key
}

/// 限流条目在存储中的键
pub fn rate_limit_key(identifier: &str) -> String {
    format!("{}{}", RATE_LIMIT_PREFIX, identifier)
}

/// 缓存条目在持久层的键
pub fn durable_cache_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

/// 缓存键所属的指标命名空间（第一个冒号之前的部分）
pub fn namespace_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_is_colon_joined() {
        assert_eq!(generate_key("jobs", &["42"]), "jobs:42");
        assert_eq!(generate_key("profile", &["u1", "settings"]), "profile:u1:settings");
        assert_eq!(generate_key::<&str>("stats", &[]), "stats");
        assert_eq!(
            generate_key("jobs", &[String::from("7")]),
            generate_key("jobs", &["7"])
        );
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        assert_ne!(rate_limit_key("jobs:42"), durable_cache_key("jobs:42"));
        assert_eq!(durable_cache_key("jobs:42"), "cache:jobs:42");
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("jobs:42"), "jobs");
        assert_eq!(namespace_of("plain"), "plain");
    }
}
