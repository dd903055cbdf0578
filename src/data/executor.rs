//! 嵌入式查询执行器
//!
//! 使用内存 SQLite（rusqlite, bundled）作为分析引擎：
//! - 将 `Dataset` 注册为单张表（按值推断列类型）
//! - 加载完成后切换为 `PRAGMA query_only = ON`，连接层面拒绝写操作
//! - 执行已通过校验的 SQL，错误转换为结构化结果，从不向上抛出
//!
//! # 使用示例
//!
//! ```ignore
//! use crate::data::executor::QueryExecutor;
//!
//! let mut executor = QueryExecutor::new("campaigns")?;
//! executor.load_dataset(&dataset)?;
//!
//! let outcome = executor.execute("SELECT Platform, SUM(Spend) FROM campaigns GROUP BY Platform");
//! if outcome.success {
//!     println!("{:?}", outcome.result.unwrap().to_records());
//! }
//! ```

use crate::data::{DataError, Result};
use crate::models::dataset::Dataset;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;

/// 查询结果（表格形式）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// 转换为记录列表（缓存与展示使用的形式）
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record: Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(record)
            })
            .collect()
    }
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<QueryResult>,
}

impl ExecutionOutcome {
    pub fn ok(result: QueryResult) -> Self {
        Self {
            success: true,
            error: None,
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            result: None,
        }
    }
}

/// 列类型（SQLite 类型亲和性）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnAffinity {
    Integer,
    Real,
    Text,
}

impl ColumnAffinity {
    fn as_sql(&self) -> &'static str {
        match self {
            ColumnAffinity::Integer => "INTEGER",
            ColumnAffinity::Real => "REAL",
            ColumnAffinity::Text => "TEXT",
        }
    }

    /// 按列中非 null 值推断：全为整数 => INTEGER，全为数字 => REAL，否则 TEXT
    fn infer<'a>(values: impl Iterator<Item = &'a Value>) -> Self {
        let mut affinity: Option<ColumnAffinity> = None;
        for value in values {
            let current = match value {
                Value::Null => continue,
                Value::Bool(_) => ColumnAffinity::Integer,
                Value::Number(n) if n.is_i64() => ColumnAffinity::Integer,
                Value::Number(_) => ColumnAffinity::Real,
                _ => return ColumnAffinity::Text,
            };
            affinity = Some(match (affinity, current) {
                (Some(ColumnAffinity::Real), _) | (_, ColumnAffinity::Real) => ColumnAffinity::Real,
                _ => ColumnAffinity::Integer,
            });
        }
        affinity.unwrap_or(ColumnAffinity::Text)
    }
}

/// 在一个事务内重建表并写入全部行
fn replace_table(conn: &mut Connection, table_name: &str, dataset: &Dataset) -> Result<()> {
    let table = quote_ident(table_name);
    let column_defs = dataset
        .columns()
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let affinity = ColumnAffinity::infer(dataset.rows().iter().map(|row| &row[index]));
            format!("{} {}", quote_ident(name), affinity.as_sql())
        })
        .collect::<Vec<_>>()
        .join(", ");

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_defs});"
    ))?;
    {
        let placeholders = vec!["?"; dataset.columns().len()].join(", ");
        let mut stmt = tx.prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))?;
        for row in dataset.rows() {
            stmt.execute(params_from_iter(row.iter().map(json_to_sql)))?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// 查询执行器
pub struct QueryExecutor {
    conn: Mutex<Connection>,
    table_name: String,
    columns: Vec<String>,
    row_count: usize,
}

impl QueryExecutor {
    /// 创建执行器（内存数据库，尚未加载数据）
    pub fn new(table_name: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DataError::Database)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table_name: table_name.into(),
            columns: Vec::new(),
            row_count: 0,
        })
    }

    /// 加载数据集（替换已有数据）
    pub fn load_dataset(&mut self, dataset: &Dataset) -> Result<()> {
        if dataset.columns().is_empty() {
            return Err(DataError::InvalidDataset("数据集没有任何列".to_string()));
        }

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Concurrency(e.to_string()))?;

        conn.execute_batch("PRAGMA query_only = OFF")?;
        let loaded = replace_table(&mut conn, &self.table_name, dataset);
        // 加载失败时事务已回滚，旧表保持不变；两种情况都必须恢复只读
        let restored = conn.execute_batch("PRAGMA query_only = ON");
        drop(conn);

        if let Err(e) = loaded {
            tracing::warn!(table = %self.table_name, error = %e, "数据集加载失败，保留原有数据");
            return Err(e);
        }
        restored?;

        self.columns = dataset.columns().to_vec();
        self.row_count = dataset.row_count();

        tracing::info!(
            table = %self.table_name,
            columns = self.columns.len(),
            rows = self.row_count,
            "数据集已注册到查询引擎"
        );
        Ok(())
    }

    /// 执行 SQL 查询
    ///
    /// 任何错误（语法、未知列、只读拒绝等）都转换为 `success = false` 的结果。
    pub fn execute(&self, sql: &str) -> ExecutionOutcome {
        match self.run_query(sql) {
            Ok(result) => {
                tracing::debug!(rows = result.row_count(), "查询执行成功");
                ExecutionOutcome::ok(result)
            }
            Err(e) => {
                let message = match e {
                    DataError::Database(inner) => inner.to_string(),
                    other => other.to_string(),
                };
                tracing::warn!(error = %message, "查询执行失败");
                ExecutionOutcome::failed(message)
            }
        }
    }

    fn run_query(&self, sql: &str) -> Result<QueryResult> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Concurrency(e.to_string()))?;

        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = columns.len();

        let rows = stmt
            .query_map([], |row| row_to_values(row, column_count))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(QueryResult { columns, rows })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// 已加载数据集的列名（未加载时为空）
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

fn row_to_values(row: &Row, column_count: usize) -> rusqlite::Result<Vec<Value>> {
    (0..column_count).map(|i| value_as_json(row, i)).collect()
}

/// 从 Row 中获取 JSON 值
fn value_as_json(row: &Row, idx: usize) -> rusqlite::Result<Value> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Number(i.into())),
        ValueRef::Real(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        ValueRef::Text(s) => Ok(Value::String(String::from_utf8_lossy(s).into_owned())),
        ValueRef::Blob(b) => Ok(Value::String(format!("<blob {} bytes>", b.len()))),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
