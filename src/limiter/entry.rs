use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;

/// 单个调用方的限流状态，以扁平 JSON 文档存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub attempts: u32,
    pub window_start: i64, // Unix 毫秒
    pub last_attempt: i64, // Unix 毫秒
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,
}

impl RateLimitEntry {
    /// 第一次尝试，开启新窗口
    pub fn first_attempt(now: i64) -> Self {
        Self {
            attempts: 1,
            window_start: now,
            last_attempt: now,
            blocked_until: None,
        }
    }

    /// 封禁仍在生效
    pub fn is_blocked(&self, now: i64) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    pub fn window_expired(&self, now: i64, config: &RateLimitConfig) -> bool {
        now - self.window_start >= config.window_ms as i64
    }

    /// 窗口和封禁都已结束，条目等同于不存在
    pub fn is_stale(&self, now: i64, config: &RateLimitConfig) -> bool {
        if self.is_blocked(now) {
            return false;
        }
        self.blocked_until.is_some() || self.window_expired(now, config)
    }

    pub fn window_end(&self, config: &RateLimitConfig) -> i64 {
        self.window_start + config.window_ms as i64
    }

    /// 条目可以被存储丢弃的时间点
    pub fn expires_at(&self, config: &RateLimitConfig) -> i64 {
        let window_end = self.window_end(config);
        self.blocked_until
            .map_or(window_end, |until| until.max(window_end))
    }
}

/// 一次限流判定的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub attempts_remaining: u32,
    /// 当前窗口结束时间（Unix 毫秒）
    pub reset_time: Option<i64>,
    /// 封禁结束时间（Unix 毫秒）
    pub blocked_until: Option<i64>,
    /// 存储不可用，结果来自降级策略
    pub degraded: bool,
}

impl RateLimitDecision {
    pub(crate) fn fresh(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            attempts_remaining: limit,
            reset_time: None,
            blocked_until: None,
            degraded: false,
        }
    }

    pub(crate) fn blocked(limit: u32, until: i64) -> Self {
        Self {
            allowed: false,
            limit,
            attempts_remaining: 0,
            reset_time: Some(until),
            blocked_until: Some(until),
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_layout() {
        let entry = RateLimitEntry {
            attempts: 3,
            window_start: 1_000,
            last_attempt: 2_000,
            blocked_until: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"attempts": 3, "windowStart": 1000, "lastAttempt": 2000})
        );

        let blocked: RateLimitEntry = serde_json::from_str(
            r#"{"attempts":5,"windowStart":0,"lastAttempt":10,"blockedUntil":99}"#,
        )
        .unwrap();
        assert_eq!(blocked.blocked_until, Some(99));
    }

    #[test]
    fn test_block_ends_exactly_at_blocked_until() {
        let config = RateLimitConfig::default();
        let entry = RateLimitEntry {
            attempts: 5,
            window_start: 0,
            last_attempt: 0,
            blocked_until: Some(5_000),
        };
        assert!(entry.is_blocked(4_999));
        assert!(!entry.is_stale(4_999, &config));
        assert!(!entry.is_blocked(5_000));
        assert!(entry.is_stale(5_000, &config));
    }

    #[test]
    fn test_expires_at_covers_window_and_block() {
        let config = RateLimitConfig::default();
        let mut entry = RateLimitEntry::first_attempt(0);
        assert_eq!(entry.expires_at(&config), 900_000);
        entry.blocked_until = Some(3_600_000);
        assert_eq!(entry.expires_at(&config), 3_600_000);
    }
}
