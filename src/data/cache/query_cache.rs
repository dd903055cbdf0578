//! 自然语言查询结果缓存
//!
//! 以「问题 + 数据集结构指纹」为键缓存查询结果，避免对同一数据集重复调用 SQL 生成流程。
//! 提供：
//! - 内存 + 磁盘两级存储（磁盘命中会提升到内存）
//! - TTL 过期（读取时惰性删除，不做后台清扫）
//! - 超出容量时按时间戳淘汰最旧的 10%
//! - 命中率统计
//!
//! 磁盘格式：每个键一个 `{cache_dir}/{sha256_hex}.json`，
//! 内容为 `{"timestamp": ISO-8601, "question": "...", "data": ...}`。
//! 写入采用同目录临时文件 + rename，磁盘变更持有 `fs2` 排他文件锁。
//!
//! # 使用示例
//!
//! ```ignore
//! use std::time::Duration;
//! use crate::data::cache::QueryCache;
//!
//! let cache = QueryCache::open("/tmp/query_cache", Duration::from_secs(3600), 1000)?;
//! cache.set("总花费是多少？", "0123456789abcdef", serde_json::json!([{"total": 42}]))?;
//! assert!(cache.get("总花费是多少？", "0123456789abcdef").is_some());
//! ```

use crate::data::{DataError, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const LOCK_FILE_NAME: &str = ".lock";

/// 缓存条目
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub question: String,
    pub schema_hash: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// 磁盘上的缓存文件
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    timestamp: String,
    question: String,
    data: Value,
}

/// 缓存统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    /// 命中率百分比（保留两位小数）
    pub hit_rate_pct: f64,
    pub cache_size: usize,
    pub max_entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// 查询结果缓存
#[derive(Debug)]
pub struct QueryCache {
    cache_dir: PathBuf,
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl QueryCache {
    /// 打开（必要时创建）缓存目录
    ///
    /// # 参数
    ///
    /// - `cache_dir`: 磁盘缓存目录
    /// - `ttl`: 缓存项的生存时间
    /// - `max_entries`: 内存中最多保留的条目数
    pub fn open(cache_dir: impl Into<PathBuf>, ttl: Duration, max_entries: usize) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| DataError::io(cache_dir.clone(), e))?;

        tracing::debug!(
            cache_dir = %cache_dir.display(),
            ttl_secs = ttl.as_secs(),
            max_entries,
            "查询缓存已打开"
        );

        Ok(Self {
            cache_dir,
            ttl,
            max_entries,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// 获取缓存结果
    ///
    /// 先查内存，再查磁盘；过期条目从两级存储中删除并计为未命中。
    /// 损坏的缓存文件会被删除并视为未命中。
    pub fn get(&self, question: &str, schema_hash: &str) -> Option<Value> {
        let key = cache_key(question, schema_hash);
        let mut state = self.state.lock().ok()?;
        let now = Utc::now();

        let memory_fresh = state
            .entries
            .get(&key)
            .map(|entry| self.is_fresh(entry.timestamp, now));

        match memory_fresh {
            Some(true) => {
                state.hits += 1;
                tracing::debug!(key = %key, "查询缓存命中（内存）");
                return state.entries.get(&key).map(|entry| entry.payload.clone());
            }
            Some(false) => {
                state.entries.remove(&key);
                self.remove_file(&key);
                state.misses += 1;
                tracing::debug!(key = %key, "查询缓存已过期");
                return None;
            }
            None => {}
        }

        let Some((timestamp, file)) = self.read_file(&key) else {
            state.misses += 1;
            return None;
        };

        if !self.is_fresh(timestamp, now) {
            self.remove_file(&key);
            state.misses += 1;
            tracing::debug!(key = %key, "磁盘缓存已过期");
            return None;
        }

        state.hits += 1;
        tracing::debug!(key = %key, "查询缓存命中（磁盘），提升到内存");
        let payload = file.data.clone();
        state.entries.insert(
            key,
            CacheEntry {
                question: file.question,
                schema_hash: schema_hash.to_string(),
                timestamp,
                payload: file.data,
            },
        );
        self.evict_if_needed(&mut state);

        Some(payload)
    }

    /// 写入缓存结果
    ///
    /// 表格类结果需先转换为行记录列表再写入。
    pub fn set(&self, question: &str, schema_hash: &str, data: Value) -> Result<()> {
        let key = cache_key(question, schema_hash);
        let timestamp = Utc::now();

        let mut state = self
            .state
            .lock()
            .map_err(|e| DataError::Concurrency(e.to_string()))?;
        let _lock = self.lock_dir()?;

        let file = CacheFile {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            question: question.to_string(),
            data: data.clone(),
        };
        let written = self.write_file(&key, &file);

        state.entries.insert(
            key.clone(),
            CacheEntry {
                question: question.to_string(),
                schema_hash: schema_hash.to_string(),
                timestamp,
                payload: data,
            },
        );
        self.evict_if_needed(&mut state);

        tracing::debug!(key = %key, size = state.entries.len(), "查询结果已缓存");
        written
    }

    /// 清空内存与磁盘缓存，并重置命中统计
    pub fn clear(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| DataError::Concurrency(e.to_string()))?;
        let _lock = self.lock_dir()?;

        state.entries.clear();
        state.hits = 0;
        state.misses = 0;

        let dir = fs::read_dir(&self.cache_dir).map_err(|e| DataError::io(&self.cache_dir, e))?;
        let mut removed = 0usize;
        for entry in dir.flatten() {
            let path = entry.path();
            let is_cache_file = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "json" || ext == "tmp");
            if is_cache_file {
                fs::remove_file(&path).map_err(|e| DataError::io(&path, e))?;
                removed += 1;
            }
        }

        tracing::info!(removed, "查询缓存已清空");
        Ok(())
    }

    /// 获取命中统计
    pub fn get_stats(&self) -> CacheStats {
        let (hits, misses, cache_size) = self
            .state
            .lock()
            .map(|s| (s.hits, s.misses, s.entries.len()))
            .unwrap_or((0, 0, 0));
        let total_requests = hits + misses;
        let hit_rate_pct = if total_requests > 0 {
            (hits as f64 / total_requests as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate_pct,
            cache_size,
            max_entries: self.max_entries,
        }
    }

    /// 当前内存中的条目数
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// 指定问题在磁盘上的缓存文件路径
    pub fn entry_path(&self, question: &str, schema_hash: &str) -> PathBuf {
        self.file_path(&cache_key(question, schema_hash))
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    fn is_fresh(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(timestamp);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age < ttl,
            // TTL 超出 chrono 可表示范围，视为永不过期
            Err(_) => true,
        }
    }

    /// 超出容量时按时间戳升序淘汰最旧的 10%（至少 1 条），两级存储同时删除
    fn evict_if_needed(&self, state: &mut CacheState) {
        if state.entries.len() <= self.max_entries {
            return;
        }

        let batch = (self.max_entries / 10).max(1);
        let mut by_age: Vec<(DateTime<Utc>, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.timestamp, key.clone()))
            .collect();
        by_age.sort();

        let mut oldest = by_age.into_iter();
        let mut evicted = 0usize;
        while state.entries.len() > self.max_entries {
            let before = evicted;
            for (_, key) in oldest.by_ref().take(batch) {
                state.entries.remove(&key);
                self.remove_file(&key);
                evicted += 1;
            }
            if evicted == before {
                break;
            }
        }

        tracing::info!(
            evicted,
            remaining = state.entries.len(),
            max_entries = self.max_entries,
            "查询缓存超出容量，已淘汰最旧条目"
        );
    }

    /// 获取缓存目录的排他文件锁（随返回的 File drop 释放）
    fn lock_dir(&self) -> Result<File> {
        let lock_path = self.cache_dir.join(LOCK_FILE_NAME);
        let lock_file = File::create(&lock_path).map_err(|e| DataError::io(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| DataError::io(&lock_path, e))?;
        Ok(lock_file)
    }

    /// 原子写入：同目录临时文件 + rename
    fn write_file(&self, key: &str, file: &CacheFile) -> Result<()> {
        let path = self.file_path(key);
        let tmp_path = self
            .cache_dir
            .join(format!(".{}.{}.tmp", key, std::process::id()));

        let content = serde_json::to_vec(file)?;
        fs::write(&tmp_path, content).map_err(|e| DataError::io(&tmp_path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(DataError::io(&path, e));
        }
        Ok(())
    }

    /// 读取缓存文件；不存在、不可读或损坏时返回 None（损坏文件会被删除）
    fn read_file(&self, key: &str) -> Option<(DateTime<Utc>, CacheFile)> {
        let path = self.file_path(key);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "读取缓存文件失败");
                return None;
            }
        };

        match decode_entry(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "缓存文件已损坏，删除");
                self.remove_file(key);
                None
            }
        }
    }

    fn remove_file(&self, key: &str) {
        let path = self.file_path(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "删除缓存文件失败");
            }
        }
    }
}

/// 解析缓存文件内容并校验时间戳
fn decode_entry(content: &[u8]) -> Result<(DateTime<Utc>, CacheFile)> {
    let file: CacheFile = serde_json::from_slice(content)?;
    let ts = parse_timestamp(&file.timestamp).ok_or_else(|| {
        DataError::CacheValidation(format!("时间戳格式无效: {}", file.timestamp))
    })?;
    Ok((ts, file))
}

/// 缓存键：`sha256(lowercase(trim(question)) + ":" + schema_hash)`
pub fn cache_key(question: &str, schema_hash: &str) -> String {
    let normalized = question.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b":");
    hasher.update(schema_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 解析 ISO-8601 时间戳；不带时区的时间按 UTC 处理
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
