// 缓存模块
// 两级缓存（持久层 + 进程内回退层）以及统一的键生成

pub mod keys;
pub mod manager;
pub mod models;

// 重新导出常用类型和函数，方便其他模块使用
pub use keys::generate_key;
pub use manager::CacheManager;
pub use models::CacheEntry;
