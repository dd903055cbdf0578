//! 数据层
//!
//! 自然语言查询子系统的安全与性能核心。
//!
//! # 模块组织
//!
//! - `error`: 统一错误类型定义
//! - `sql`: SQL 白名单校验（只读、单语句、授权表与列）
//! - `cache`: 数据集结构指纹 + 查询结果缓存（内存 + 磁盘，TTL）
//! - `executor`: 嵌入式只读查询执行器（内存 SQLite）
//!
//! # 使用示例
//!
//! ```ignore
//! use crate::data::{QueryExecutor, SqlValidator};
//!
//! let validator = SqlValidator::new(["campaigns"], dataset.columns());
//! let result = validator.validate_query(sql);
//! if result.is_valid {
//!     let outcome = executor.execute(sql);
//! }
//! ```

pub mod cache;
pub mod error;
pub mod executor;
pub mod sql;

pub use cache::{schema_fingerprint, CacheEntry, CacheStats, QueryCache};
pub use error::{DataError, Result};
pub use executor::{ExecutionOutcome, QueryExecutor, QueryResult};
pub use sql::{strip_code_fences, SqlValidator, ValidationError, ValidationResult};
