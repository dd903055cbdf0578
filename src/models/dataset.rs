//! 表格数据集
//!
//! 广告投放数据在内存中的表示：列名 + 行值。
//! 通常从 JSON 记录数组加载，再交给 `QueryExecutor` 注册为单张表。

use crate::data::cache::schema_fingerprint;
use crate::data::{DataError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// 表格数据集
///
/// 反序列化同样经过 `Dataset::new` 的校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataset")]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct RawDataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TryFrom<RawDataset> for Dataset {
    type Error = DataError;

    fn try_from(raw: RawDataset) -> Result<Self> {
        Dataset::new(raw.columns, raw.rows)
    }
}

impl Dataset {
    /// 创建数据集
    ///
    /// 列名不能为空或重复（大小写不敏感），每行宽度必须与列数一致。
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if column.trim().is_empty() {
                return Err(DataError::InvalidDataset("列名不能为空".to_string()));
            }
            if !seen.insert(column.to_lowercase()) {
                return Err(DataError::InvalidDataset(format!("列名重复: {column}")));
            }
        }

        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(DataError::InvalidDataset(format!(
                "第 {} 行有 {} 个值，应为 {} 个",
                index + 1,
                row.len(),
                columns.len()
            )));
        }

        Ok(Self { columns, rows })
    }

    /// 从记录列表创建数据集
    ///
    /// 列顺序按首次出现的顺序；记录中缺失的字段填充为 null。
    pub fn from_records(records: &[Map<String, Value>]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self::new(columns, rows)
    }

    /// 从 JSON 文件加载（内容为记录数组）
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| DataError::io(path, e))?;
        let value: Value = serde_json::from_slice(&content)?;

        let Value::Array(items) = value else {
            return Err(DataError::InvalidDataset(
                "数据文件必须是 JSON 记录数组".to_string(),
            ));
        };

        let records = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(map) => Ok(map),
                _ => Err(DataError::InvalidDataset(format!(
                    "第 {} 条记录不是 JSON 对象",
                    index + 1
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let dataset = Self::from_records(&records)?;
        tracing::debug!(
            path = %path.display(),
            columns = dataset.columns.len(),
            rows = dataset.rows.len(),
            "数据集已加载"
        );
        Ok(dataset)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 数据集结构指纹（只与列名集合有关）
    pub fn fingerprint(&self) -> String {
        schema_fingerprint(&self.columns)
    }
}
