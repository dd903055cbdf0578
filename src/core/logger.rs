use crate::models::config::{LogConfig, LogFormat, LogLevel, LogOutput};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::{non_blocking, non_blocking::NonBlocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::{Layered, SubscriberExt},
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀（按天滚动：campaign-insights.YYYY-MM-DD）
const LOG_FILE_PREFIX: &str = "campaign-insights";

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static>;

/// 全局日志级别 reload handle
static LOG_LEVEL_HANDLE: OnceLock<Handle<EnvFilter, Registry>> = OnceLock::new();

/// 初始化日志系统
///
/// - 日志级别（trace/debug/info/warn/error），可通过 `RUST_LOG` 覆盖
/// - 输出格式（纯文本/JSON）
/// - 输出目标（控制台/文件/both），文件按天滚动
///
/// 只有日志级别支持通过 `update_log_level` 热更新，其余配置需重启生效。
///
/// # 示例
/// ```ignore
/// use campaign_insights::core::init_logger;
/// use campaign_insights::models::config::LogConfig;
///
/// init_logger(&LogConfig::default())?;
/// ```
pub fn init_logger(config: &LogConfig) -> anyhow::Result<()> {
    let (filter_layer, reload_handle) = reload::Layer::new(create_env_filter(&config.level));

    if LOG_LEVEL_HANDLE.set(reload_handle).is_err() {
        anyhow::bail!("日志系统已初始化，不能重复初始化");
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.output != LogOutput::File {
        layers.push(build_layer(config.format, std::io::stderr, true));
    }
    if config.output != LogOutput::Console {
        let writer = file_writer(config.file_path.as_deref())?;
        layers.push(build_layer(config.format, writer, false));
    }

    Registry::default()
        .with(filter_layer)
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("安装全局日志订阅器失败: {}", e))?;

    tracing::info!(
        level = config.level.as_str(),
        format = ?config.format,
        output = ?config.output,
        file_path = ?config.file_path,
        "日志系统初始化完成"
    );

    Ok(())
}

/// 默认过滤规则：应用代码使用指定级别，rusqlite 只输出 WARN 以上
pub fn default_filter_directive(level: &LogLevel) -> String {
    format!("campaign_insights={},rusqlite=warn", level.as_str())
}

fn create_env_filter(level: &LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_directive(level)))
}

fn build_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(cfg!(debug_assertions))
        .with_thread_ids(false);

    match format {
        LogFormat::Text => layer
            .with_span_events(if cfg!(debug_assertions) {
                FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            })
            .boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// 创建按天滚动的非阻塞文件写入器
fn file_writer(file_path: Option<&str>) -> anyhow::Result<NonBlocking> {
    let log_dir = get_log_dir(file_path)?;
    let appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = non_blocking(appender);

    // guard 必须存活到进程结束，否则缓冲的日志会丢失
    Box::leak(Box::new(guard));

    Ok(writer)
}

/// 获取日志目录（默认 `~/.campaign-insights/logs`）
fn get_log_dir(file_path: Option<&str>) -> anyhow::Result<PathBuf> {
    let dir = match file_path {
        Some(path) => PathBuf::from(path),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("无法获取用户主目录"))?
            .join(".campaign-insights")
            .join("logs"),
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 动态更新日志级别（热重载）
pub fn update_log_level(new_level: LogLevel) -> anyhow::Result<()> {
    let handle = LOG_LEVEL_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("日志系统未初始化"))?;

    handle
        .reload(create_env_filter(&new_level))
        .map_err(|e| anyhow::anyhow!("重载日志级别失败: {}", e))?;

    tracing::info!(new_level = new_level.as_str(), "日志级别已动态更新");
    Ok(())
}
