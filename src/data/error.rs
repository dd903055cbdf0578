//! 统一错误类型定义
//!
//! 使用 `thiserror` 定义数据层的基础设施错误（I/O、序列化、数据库、数据集格式）。
//! SQL 校验失败与执行失败不在此列：它们被转换为结构化结果返回给调用方。

use std::path::PathBuf;
use thiserror::Error;

/// 数据层的统一错误类型
#[derive(Error, Debug)]
pub enum DataError {
    /// 文件 I/O 错误
    #[error("文件 I/O 错误: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON 序列化/反序列化错误
    #[error("JSON 序列化错误: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 数据集格式无效
    #[error("数据集无效: {0}")]
    InvalidDataset(String),

    /// 缓存条目校验失败
    #[error("缓存校验失败: {0}")]
    CacheValidation(String),

    /// 并发错误（锁中毒等）
    #[error("并发错误: {0}")]
    Concurrency(String),
}

/// 便于与现有代码集成的类型别名
pub type Result<T> = std::result::Result<T, DataError>;

/// 便捷的 I/O 错误构造器
impl DataError {
    /// 从 `std::io::Error` 和路径创建 I/O 错误
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
