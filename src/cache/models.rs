/// 进程内回退层中的缓存条目
///
/// 值以 JSON 字符串保存，与持久层的格式一致，读取时再按调用方的类型反序列化。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: String,
    pub expires_at: i64, // Unix 毫秒
}

impl CacheEntry {
    pub fn new(value: String, expires_at: i64) -> Self {
        Self { value, expires_at }
    }

    /// `now < expires_at` 时可见
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}
