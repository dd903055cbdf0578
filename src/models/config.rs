//! 引擎配置
//!
//! 从 TOML 文件加载，缺省字段使用默认值，随后应用环境变量覆盖：
//! - `CAMPAIGN_INSIGHTS_CACHE_DIR`
//! - `CAMPAIGN_INSIGHTS_CACHE_TTL`（秒）
//! - `CAMPAIGN_INSIGHTS_MAX_ENTRIES`

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CACHE_DIR: &str = "CAMPAIGN_INSIGHTS_CACHE_DIR";
pub const ENV_CACHE_TTL: &str = "CAMPAIGN_INSIGHTS_CACHE_TTL";
pub const ENV_MAX_ENTRIES: &str = "CAMPAIGN_INSIGHTS_MAX_ENTRIES";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// 日志配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// 日志目录（文件输出时使用，缺省为 `~/.campaign-insights/logs`）
    pub file_path: Option<String>,
}

/// 查询缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: 3600,
            max_entries: 1000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".campaign-insights")
        .join("query_cache")
}

/// SQL 校验配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    /// 引用未知列时是否判定为无效
    pub strict_columns: bool,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            strict_columns: true,
        }
    }
}

/// 查询引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 数据集在引擎中的表名（也是唯一允许查询的表）
    pub table_name: String,
    /// 每个问题最多尝试生成 SQL 的次数
    pub max_attempts: u32,
    pub cache: CacheSettings,
    pub validator: ValidatorSettings,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_name: "campaigns".to_string(),
            max_attempts: 3,
            cache: CacheSettings::default(),
            validator: ValidatorSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 从 TOML 文件加载配置，并应用环境变量覆盖
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// 指定路径时加载该文件，否则使用默认配置（均应用环境变量覆盖）
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// 应用环境变量覆盖；无法解析的值会被忽略并记录警告
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            if !dir.trim().is_empty() {
                self.cache.dir = PathBuf::from(dir);
            }
        }
        if let Some(ttl) = parse_env::<u64>(ENV_CACHE_TTL) {
            self.cache.ttl_secs = ttl;
        }
        if let Some(max_entries) = parse_env::<usize>(ENV_MAX_ENTRIES) {
            self.cache.max_entries = max_entries;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, value = %raw, "环境变量格式无效，已忽略");
            None
        }
    }
}
