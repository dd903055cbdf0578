// lib.rs - 活动数据自然语言查询：SQL 校验、结果缓存与只读执行

pub mod core;
pub mod data;
pub mod models;
pub mod services;

pub use models::*;

pub use data::{
    schema_fingerprint, CacheStats, DataError, ExecutionOutcome, QueryCache, QueryExecutor,
    QueryResult, SqlValidator, ValidationError, ValidationResult,
};
pub use services::{GenerationRequest, NlQueryEngine, QueryAnswer, SqlGenerator};

pub use core::{init_logger, update_log_level};
