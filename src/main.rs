// campaign-insights: 对 JSON 数据集执行一条经过白名单校验的只读 SQL
//
// 用法: campaign-insights <dataset.json> <sql>
// 配置文件路径通过 CAMPAIGN_INSIGHTS_CONFIG 指定（可选）

use anyhow::Context;
use campaign_insights::data::{strip_code_fences, QueryExecutor, SqlValidator};
use campaign_insights::models::{Dataset, EngineConfig};
use campaign_insights::init_logger;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const CONFIG_ENV: &str = "CAMPAIGN_INSIGHTS_CONFIG";

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("错误: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> anyhow::Result<bool> {
    let args: Vec<String> = env::args().skip(1).collect();
    let [dataset_path, sql] = args.as_slice() else {
        anyhow::bail!("用法: campaign-insights <dataset.json> <sql>");
    };

    let config_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = EngineConfig::load_or_default(config_path.as_deref())?;
    init_logger(&config.log)?;

    let dataset = Dataset::from_json_file(Path::new(dataset_path))
        .with_context(|| format!("加载数据集失败: {dataset_path}"))?;
    let mut executor = QueryExecutor::new(config.table_name.as_str())?;
    executor.load_dataset(&dataset)?;

    let validator = SqlValidator::new([config.table_name.as_str()], dataset.columns())
        .with_strict_columns(config.validator.strict_columns);

    let sql = strip_code_fences(sql);
    let validation = validator.validate_query(&sql);

    let (success, output) = if validation.is_valid {
        let outcome = executor.execute(&sql);
        let result = outcome.result.unwrap_or_default();
        let records = result.to_records();
        (
            outcome.success,
            json!({
                "success": outcome.success,
                "stage": "execution",
                "error": outcome.error,
                "sql": sql,
                "fingerprint": dataset.fingerprint(),
                "row_count": result.row_count(),
                "columns": result.columns,
                "records": records,
            }),
        )
    } else {
        (
            false,
            json!({
                "success": false,
                "stage": "validation",
                "error": validation.error,
                "sql": sql,
                "fingerprint": dataset.fingerprint(),
            }),
        )
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(success)
}
