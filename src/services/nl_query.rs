//! 自然语言查询流水线
//!
//! 把「问题 → SQL → 校验 → 执行 → 缓存」串起来：
//!
//! 1. 以 (问题, 数据集指纹) 查询缓存，命中直接返回
//! 2. 最多 `max_attempts` 次：生成 SQL → 去除代码块标记 → 白名单校验 → 执行
//!    - 校验或执行失败时，把失败的 SQL 和错误信息交给下一次生成
//!    - 生成器本身出错时立即结束
//! 3. 成功结果以记录形式写入缓存
//!
//! SQL 生成由调用方通过 `SqlGenerator` 提供（通常是一次 LLM 调用）。

use crate::data::cache::{CacheStats, QueryCache};
use crate::data::executor::{QueryExecutor, QueryResult};
use crate::data::sql::{strip_code_fences, SqlValidator};
use crate::data::Result;
use crate::models::config::EngineConfig;
use crate::models::dataset::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次 SQL 生成请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub question: String,
    pub table_name: String,
    pub columns: Vec<String>,
    /// 上一次生成的 SQL（首次为 None）
    pub previous_sql: Option<String>,
    /// 上一次 SQL 的校验或执行错误
    pub previous_error: Option<String>,
    /// 当前尝试序号（从 1 开始）
    pub attempt: u32,
}

/// SQL 生成器
pub trait SqlGenerator {
    fn generate_sql(&self, request: &GenerationRequest) -> anyhow::Result<String>;
}

impl<F> SqlGenerator for F
where
    F: Fn(&GenerationRequest) -> anyhow::Result<String>,
{
    fn generate_sql(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        self(request)
    }
}

/// 问答结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub success: bool,
    pub question: String,
    pub sql: Option<String>,
    pub columns: Vec<String>,
    pub records: Vec<Value>,
    pub row_count: usize,
    pub error: Option<String>,
    pub from_cache: bool,
    pub attempts: u32,
}

impl QueryAnswer {
    fn failed(question: &str, sql: Option<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            question: question.to_string(),
            sql,
            columns: Vec::new(),
            records: Vec::new(),
            row_count: 0,
            error: Some(error.into()),
            from_cache: false,
            attempts,
        }
    }

    fn from_cached(question: &str, cached: CachedAnswer) -> Self {
        Self {
            success: true,
            question: question.to_string(),
            sql: cached.sql,
            row_count: cached.records.len(),
            columns: cached.columns,
            records: cached.records,
            error: None,
            from_cache: true,
            attempts: 0,
        }
    }
}

/// 缓存中保存的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedAnswer {
    sql: Option<String>,
    columns: Vec<String>,
    records: Vec<Value>,
}

impl CachedAnswer {
    fn new(sql: &str, result: &QueryResult) -> Self {
        Self {
            sql: Some(sql.to_string()),
            columns: result.columns.clone(),
            records: result.to_records(),
        }
    }

    /// 兼容只包含记录数组的缓存内容（列名取自首条记录）
    fn from_payload(payload: Value) -> Option<Self> {
        match payload {
            Value::Array(records) => {
                let columns = records
                    .first()
                    .and_then(Value::as_object)
                    .map(|record| record.keys().cloned().collect())
                    .unwrap_or_default();
                Some(Self {
                    sql: None,
                    columns,
                    records,
                })
            }
            other => serde_json::from_value(other).ok(),
        }
    }
}

/// 自然语言查询引擎
pub struct NlQueryEngine<G: SqlGenerator> {
    generator: G,
    executor: QueryExecutor,
    cache: QueryCache,
    validator: Option<SqlValidator>,
    fingerprint: Option<String>,
    max_attempts: u32,
    strict_columns: bool,
}

impl<G: SqlGenerator> NlQueryEngine<G> {
    /// 创建引擎（打开缓存目录与内存数据库）
    pub fn new(config: &EngineConfig, generator: G) -> Result<Self> {
        let executor = QueryExecutor::new(config.table_name.clone())?;
        let cache = QueryCache::open(
            config.cache.dir.clone(),
            config.cache.ttl(),
            config.cache.max_entries,
        )?;

        Ok(Self {
            generator,
            executor,
            cache,
            validator: None,
            fingerprint: None,
            max_attempts: config.max_attempts.max(1),
            strict_columns: config.validator.strict_columns,
        })
    }

    /// 加载数据集，重建校验白名单并更新指纹
    pub fn load_dataset(&mut self, dataset: &Dataset) -> Result<()> {
        self.executor.load_dataset(dataset)?;
        self.validator = Some(
            SqlValidator::new([self.executor.table_name()], dataset.columns())
                .with_strict_columns(self.strict_columns),
        );
        self.fingerprint = Some(dataset.fingerprint());

        tracing::info!(
            fingerprint = ?self.fingerprint,
            columns = dataset.columns().len(),
            "查询引擎数据集已更新"
        );
        Ok(())
    }

    /// 回答一个自然语言问题
    pub fn ask(&self, question: &str) -> QueryAnswer {
        if question.trim().is_empty() {
            return QueryAnswer::failed(question, None, "问题不能为空", 0);
        }
        let (Some(validator), Some(fingerprint)) = (&self.validator, &self.fingerprint) else {
            return QueryAnswer::failed(question, None, "尚未加载数据集", 0);
        };

        if let Some(cached) = self.cache.get(question, fingerprint).and_then(CachedAnswer::from_payload)
        {
            tracing::debug!(question = %question, "问题命中缓存");
            return QueryAnswer::from_cached(question, cached);
        }

        let mut previous_sql: Option<String> = None;
        let mut previous_error: Option<String> = None;
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            let request = GenerationRequest {
                question: question.to_string(),
                table_name: self.executor.table_name().to_string(),
                columns: self.executor.columns().to_vec(),
                previous_sql: previous_sql.clone(),
                previous_error: previous_error.clone(),
                attempt: attempts,
            };

            let raw = match self.generator.generate_sql(&request) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::error!(attempt = attempts, error = %e, "SQL 生成失败");
                    previous_error = Some(format!("SQL 生成失败: {e}"));
                    break;
                }
            };

            let sql = strip_code_fences(&raw);
            let validation = validator.validate_query(&sql);
            if !validation.is_valid {
                previous_error = validation.error;
                previous_sql = Some(sql);
                continue;
            }

            let outcome = self.executor.execute(&sql);
            match outcome.result {
                Some(result) if outcome.success => {
                    return self.finish(question, fingerprint, sql, result, attempts);
                }
                _ => {
                    tracing::warn!(attempt = attempts, error = ?outcome.error, "SQL 执行失败，准备重试");
                    previous_error = outcome.error;
                    previous_sql = Some(sql);
                }
            }
        }

        let error = previous_error.unwrap_or_else(|| "未能生成有效的 SQL".to_string());
        QueryAnswer::failed(question, previous_sql, error, attempts)
    }

    fn finish(
        &self,
        question: &str,
        fingerprint: &str,
        sql: String,
        result: QueryResult,
        attempts: u32,
    ) -> QueryAnswer {
        let cached = CachedAnswer::new(&sql, &result);
        match serde_json::to_value(&cached) {
            Ok(payload) => {
                if let Err(e) = self.cache.set(question, fingerprint, payload) {
                    tracing::warn!(error = %e, "写入查询缓存失败");
                }
            }
            Err(e) => tracing::warn!(error = %e, "序列化查询结果失败"),
        }

        QueryAnswer {
            success: true,
            question: question.to_string(),
            sql: Some(sql),
            row_count: cached.records.len(),
            columns: cached.columns,
            records: cached.records,
            error: None,
            from_cache: false,
            attempts,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    /// 当前数据集的结构指纹（未加载时为 None）
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn validator(&self) -> Option<&SqlValidator> {
        self.validator.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    const GOOD_SQL: &str =
        "SELECT Campaign_Name, SUM(Spend) AS total FROM campaigns GROUP BY Campaign_Name ORDER BY Campaign_Name";

    fn test_config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.cache.dir = dir.path().join("query_cache");
        config
    }

    fn campaigns() -> Dataset {
        Dataset::new(
            vec![
                "Campaign_Name".to_string(),
                "Platform".to_string(),
                "Spend".to_string(),
            ],
            vec![
                vec![json!("Spring"), json!("Google"), json!(100)],
                vec![json!("Spring"), json!("Meta"), json!(50)],
                vec![json!("Fall"), json!("Google"), json!(25)],
            ],
        )
        .unwrap()
    }

    /// 按顺序返回预设 SQL，并记录收到的请求
    fn scripted<'a>(
        responses: &'a [&'a str],
        log: &'a RefCell<Vec<GenerationRequest>>,
    ) -> impl Fn(&GenerationRequest) -> anyhow::Result<String> + 'a {
        move |request: &GenerationRequest| {
            log.borrow_mut().push(request.clone());
            let index = (request.attempt as usize - 1).min(responses.len() - 1);
            Ok(responses[index].to_string())
        }
    }

    #[test]
    fn test_answer_then_cache_hit() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&[GOOD_SQL], &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let first = engine.ask("各活动总花费？");
        assert!(first.success, "{:?}", first.error);
        assert!(!first.from_cache);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.columns, vec!["Campaign_Name", "total"]);
        assert_eq!(first.row_count, 2);
        assert_eq!(first.records[1], json!({"Campaign_Name": "Spring", "total": 150}));

        let second = engine.ask("  各活动总花费？ ");
        assert!(second.success);
        assert!(second.from_cache);
        assert_eq!(second.columns, first.columns);
        assert_eq!(second.records, first.records);
        assert_eq!(second.sql.as_deref(), Some(GOOD_SQL));

        assert_eq!(log.borrow().len(), 1);
        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_validation_error_fed_back() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let responses = ["SELECT * FROM users", GOOD_SQL];
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&responses, &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let answer = engine.ask("总花费");
        assert!(answer.success);
        assert_eq!(answer.attempts, 2);

        let requests = log.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].previous_error, None);
        assert_eq!(requests[0].table_name, "campaigns");
        assert_eq!(requests[1].previous_sql.as_deref(), Some("SELECT * FROM users"));
        assert!(requests[1].previous_error.as_ref().unwrap().contains("users"));
    }

    #[test]
    fn test_execution_error_fed_back() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let responses = ["SELECT Spend FROM campaigns GROUP BY", GOOD_SQL];
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&responses, &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let answer = engine.ask("总花费");
        assert!(answer.success, "{:?}", answer.error);
        assert_eq!(answer.attempts, 2);
        assert!(log.borrow()[1].previous_error.is_some());
    }

    #[test]
    fn test_attempts_exhausted() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let mut engine =
            NlQueryEngine::new(&test_config(&dir), scripted(&["DROP TABLE campaigns"], &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let answer = engine.ask("删掉所有数据");
        assert!(!answer.success);
        assert_eq!(answer.attempts, 3);
        assert_eq!(answer.sql.as_deref(), Some("DROP TABLE campaigns"));
        assert!(answer.error.unwrap().contains("DROP"));
        assert!(engine.cache.is_empty());
    }

    #[test]
    fn test_generator_error_stops() {
        let dir = TempDir::new().unwrap();
        let calls = RefCell::new(0);
        let generator = |_: &GenerationRequest| -> anyhow::Result<String> {
            *calls.borrow_mut() += 1;
            anyhow::bail!("模型服务不可用")
        };
        let mut engine = NlQueryEngine::new(&test_config(&dir), generator).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let answer = engine.ask("总花费");
        assert!(!answer.success);
        assert_eq!(answer.attempts, 1);
        assert!(answer.error.unwrap().contains("模型服务不可用"));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_code_fences_stripped() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let fenced = format!("```sql\n{GOOD_SQL}\n```");
        let responses = [fenced.as_str()];
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&responses, &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        let answer = engine.ask("总花费");
        assert!(answer.success, "{:?}", answer.error);
        assert_eq!(answer.sql.as_deref(), Some(GOOD_SQL));
    }

    #[test]
    fn test_requires_dataset_and_question() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&[GOOD_SQL], &log)).unwrap();

        let answer = engine.ask("总花费");
        assert!(!answer.success);
        assert_eq!(answer.error.as_deref(), Some("尚未加载数据集"));
        assert!(engine.fingerprint().is_none());

        engine.load_dataset(&campaigns()).unwrap();
        let answer = engine.ask("   ");
        assert!(!answer.success);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_schema_change_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let responses = ["SELECT COUNT(*) AS n FROM campaigns"];
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&responses, &log)).unwrap();

        engine.load_dataset(&campaigns()).unwrap();
        let before = engine.fingerprint().map(str::to_string);
        assert!(engine.ask("多少行").success);

        let extended = Dataset::new(
            vec!["Campaign_Name".to_string(), "Clicks".to_string()],
            vec![vec![json!("Spring"), json!(3)]],
        )
        .unwrap();
        engine.load_dataset(&extended).unwrap();
        assert_ne!(engine.fingerprint().map(str::to_string), before);

        let answer = engine.ask("多少行");
        assert!(!answer.from_cache);
        assert_eq!(answer.records, vec![json!({"n": 1})]);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_clear_cache() {
        let dir = TempDir::new().unwrap();
        let log = RefCell::new(Vec::new());
        let mut engine = NlQueryEngine::new(&test_config(&dir), scripted(&[GOOD_SQL], &log)).unwrap();
        engine.load_dataset(&campaigns()).unwrap();

        engine.ask("总花费");
        engine.clear_cache().unwrap();
        assert_eq!(engine.cache_stats().cache_size, 0);

        let answer = engine.ask("总花费");
        assert!(!answer.from_cache);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_cached_payload_records_only() {
        let cached =
            CachedAnswer::from_payload(json!([{"Platform": "Google", "total": 1}])).unwrap();
        assert_eq!(cached.sql, None);
        assert_eq!(cached.columns, vec!["Platform", "total"]);
        assert_eq!(cached.records.len(), 1);

        assert!(CachedAnswer::from_payload(json!("not an answer")).is_none());
    }
}
