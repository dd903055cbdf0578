//! 缓存层实现
//!
//! - `fingerprint`: 数据集结构指纹
//! - `query_cache`: 自然语言查询结果缓存（内存 + 磁盘，TTL + 容量淘汰）

pub mod fingerprint;
pub mod query_cache;

pub use fingerprint::{schema_fingerprint, FINGERPRINT_LEN};
pub use query_cache::{cache_key, CacheEntry, CacheStats, QueryCache};
