//! 生成 SQL 的安全校验
//!
//! 只放行单条、只读、且仅引用白名单表和列的 `SELECT` / `WITH` 查询。
//! 任何一步失败即短路返回具体原因；调用方必须拒绝执行，不做任何改写或清洗。
//!
//! # 使用示例
//!
//! ```ignore
//! use crate::data::sql::SqlValidator;
//!
//! let validator = SqlValidator::new(["campaigns"], ["Campaign_Name", "Spend"]);
//! let result = validator.validate_query("SELECT * FROM users");
//! assert!(!result.is_valid);
//! ```

use super::extract::{extract_cte_names, extract_tables, main_statement_is_select, select_lists};
use super::lexer::Token;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// 按整词（大小写不敏感）禁止的关键字
const BANNED_WORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE", "EXEC", "EXECUTE",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
];

/// 按子串禁止的注释标记
const BANNED_MARKERS: &[&str] = &["--", "/*", "*/"];

static BANNED_WORD_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    BANNED_WORDS
        .iter()
        .map(|word| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", word)).unwrap();
            (*word, re)
        })
        .collect()
});

/// `REPLACE INTO` 写入语句；同名字符串函数 `REPLACE(x, y, z)` 不受影响
static REPLACE_INTO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bREPLACE\s+INTO\b").unwrap());

/// 扩展存储过程前缀（`xp_cmdshell`、`sp_executesql` 等）
static PROCEDURE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:xp|sp)_\w*").unwrap());

/// 列表达式中允许出现、但不是列名的单词
const EXPRESSION_KEYWORDS: &[&str] = &[
    // 子句与运算
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "IS", "IN", "AS", "DISTINCT", "ALL",
    "CASE", "WHEN", "THEN", "ELSE", "END", "BETWEEN", "LIKE", "ILIKE", "GLOB", "ESCAPE",
    "COLLATE", "TRUE", "FALSE", "EXISTS", "ANY", "SOME", "ON", "JOIN", "BY", "GROUP", "ORDER",
    "HAVING", "LIMIT", "OFFSET", "ASC", "DESC", "NULLS", "FIRST", "LAST", "UNION", "EXCEPT",
    "INTERSECT", "INTERVAL", "FILTER", "WITHIN",
    // 窗口函数
    "OVER", "PARTITION", "ROWS", "RANGE", "GROUPS", "UNBOUNDED", "PRECEDING", "FOLLOWING",
    "CURRENT", "ROW",
    // 类型名（CAST(x AS REAL)）
    "INTEGER", "INT", "BIGINT", "SMALLINT", "REAL", "FLOAT", "DOUBLE", "PRECISION", "NUMERIC",
    "DECIMAL", "TEXT", "VARCHAR", "CHAR", "STRING", "BOOLEAN", "BOOL", "DATE", "TIME",
    "TIMESTAMP", "BLOB",
    // 日期部分（EXTRACT(YEAR FROM d)）
    "YEAR", "MONTH", "DAY", "HOUR", "MINUTE", "SECOND", "WEEK", "QUARTER", "DOW", "DOY",
    "EPOCH", "BOTH", "LEADING", "TRAILING", "FOR",
    // 无括号的内置值
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP",
];

fn is_expression_keyword(word: &str) -> bool {
    EXPRESSION_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(word))
}

/// 校验失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("查询语句为空")]
    Empty,

    #[error("查询包含危险关键字: {0}")]
    DangerousKeyword(String),

    #[error("只允许以 SELECT 或 WITH 开头的只读查询")]
    NotReadOnly,

    #[error("不允许多条语句（分号只能出现在末尾）")]
    MultipleStatements,

    #[error("未授权的表: {0}")]
    UnauthorizedTable(String),

    #[error("未知的列: {0}")]
    UnknownColumn(String),
}

/// 校验结果（不持久化，每次查询计算）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

impl From<Result<(), ValidationError>> for ValidationResult {
    fn from(result: Result<(), ValidationError>) -> Self {
        match result {
            Ok(()) => Self::valid(),
            Err(e) => Self::invalid(e.to_string()),
        }
    }
}

/// SQL 白名单校验器
///
/// 表名、列名比较均不区分大小写。`allowed_columns` 为空时不做列校验。
#[derive(Debug, Clone)]
pub struct SqlValidator {
    allowed_tables: HashSet<String>,
    allowed_columns: HashSet<String>,
    /// 未知列是否直接拒绝（false 时仅记录警告）
    strict_columns: bool,
}

impl SqlValidator {
    /// 创建校验器
    ///
    /// # 参数
    ///
    /// - `allowed_tables`: 允许访问的表名
    /// - `allowed_columns`: 允许引用的列名
    pub fn new<T, C>(allowed_tables: T, allowed_columns: C) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        Self {
            allowed_tables: lowercase_set(allowed_tables),
            allowed_columns: lowercase_set(allowed_columns),
            strict_columns: true,
        }
    }

    /// 设置列校验模式
    pub fn with_strict_columns(mut self, strict: bool) -> Self {
        self.strict_columns = strict;
        self
    }

    pub fn strict_columns(&self) -> bool {
        self.strict_columns
    }

    /// 校验查询，返回结构化结果
    pub fn validate_query(&self, sql: &str) -> ValidationResult {
        let result = self.validate(sql);
        if let Err(e) = &result {
            tracing::warn!(error = %e, sql = %sql, "SQL 校验未通过");
        }
        result.into()
    }

    /// 校验查询，失败时返回具体原因
    pub fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }

        check_banned_keywords(trimmed)?;

        let upper = trimmed.to_uppercase();
        if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
            return Err(ValidationError::NotReadOnly);
        }
        // WITH 之后的主语句同样必须是 SELECT
        if !main_statement_is_select(trimmed) {
            return Err(ValidationError::NotReadOnly);
        }

        // 分号只允许作为最后一个字符
        if let Some(pos) = trimmed.find(';') {
            if pos != trimmed.len() - 1 {
                return Err(ValidationError::MultipleStatements);
            }
        }

        let cte_names = lowercase_set(extract_cte_names(trimmed));
        for table in extract_tables(trimmed) {
            let key = table.to_lowercase();
            if !self.allowed_tables.contains(&key) && !cte_names.contains(&key) {
                return Err(ValidationError::UnauthorizedTable(table));
            }
        }

        self.check_columns(trimmed)
    }

    /// 检查所有 SELECT 列表中引用的标识符
    ///
    /// 列别名只对其他 SELECT 列表可见（外层查询引用子查询或 CTE 的输出列），
    /// 列表项自身的别名与同一列表中的别名都不算已知列，表别名也不算。
    fn check_columns(&self, sql: &str) -> Result<(), ValidationError> {
        if self.allowed_columns.is_empty() {
            return Ok(());
        }

        let lists = select_lists(sql);
        let declared: Vec<HashSet<String>> = lists
            .iter()
            .map(|items| lowercase_set(items.iter().filter_map(|item| split_item_alias(item).1)))
            .collect();

        for (index, items) in lists.iter().enumerate() {
            let visible: HashSet<String> = declared
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .flat_map(|(_, aliases)| aliases.iter().cloned())
                .collect();

            for item in items {
                let (expr, _) = split_item_alias(item);
                for name in self.unknown_identifiers(expr, &visible) {
                    if self.strict_columns {
                        return Err(ValidationError::UnknownColumn(name));
                    }
                    tracing::warn!(column = %name, "SELECT 列表包含未识别的列，按宽松模式放行");
                }
            }
        }

        Ok(())
    }

    /// 找出表达式中不在白名单内的标识符
    fn unknown_identifiers(&self, expr: &[Token], aliases: &HashSet<String>) -> Vec<String> {
        let mut unknown = Vec::new();

        for (i, token) in expr.iter().enumerate() {
            let Some(name) = token.ident() else {
                continue;
            };

            if matches!(token, Token::Word(w) if is_expression_keyword(w)) {
                continue;
            }

            match expr.get(i + 1) {
                // 函数名
                Some(Token::LeftParen) => continue,
                // 表限定符：c.Spend / c.*
                Some(Token::Dot) => continue,
                _ => {}
            }

            let key = name.to_lowercase();
            if !self.allowed_columns.contains(&key) && !aliases.contains(&key) {
                unknown.push(name.to_string());
            }
        }

        unknown
    }
}

fn lowercase_set<I>(items: I) -> HashSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().to_lowercase())
        .collect()
}

fn check_banned_keywords(sql: &str) -> Result<(), ValidationError> {
    for (word, re) in BANNED_WORD_PATTERNS.iter() {
        if re.is_match(sql) {
            return Err(ValidationError::DangerousKeyword(word.to_string()));
        }
    }

    for marker in BANNED_MARKERS {
        if sql.contains(marker) {
            return Err(ValidationError::DangerousKeyword(marker.to_string()));
        }
    }

    if REPLACE_INTO.is_match(sql) {
        return Err(ValidationError::DangerousKeyword("REPLACE".to_string()));
    }

    if let Some(m) = PROCEDURE_PREFIX.find(sql) {
        return Err(ValidationError::DangerousKeyword(m.as_str().to_string()));
    }

    Ok(())
}

/// 拆分列表项末尾的列别名，返回 (表达式, 别名)
///
/// 支持 `expr AS alias` 与无 `AS` 的隐式别名。
fn split_item_alias(item: &[Token]) -> (&[Token], Option<&str>) {
    if let [expr @ .., as_kw, alias] = item {
        if !expr.is_empty() && as_kw.is_keyword("AS") {
            if let Some(name) = alias.ident() {
                return (expr, Some(name));
            }
        }
    }

    let expr = strip_implicit_alias(item);
    if expr.len() < item.len() {
        (expr, item.last().and_then(Token::ident))
    } else {
        (item, None)
    }
}

/// 去掉无 `AS` 的隐式别名：`SUM(Spend) total`、`Campaign_Name name`
fn strip_implicit_alias(item: &[Token]) -> &[Token] {
    if item.len() < 2 {
        return item;
    }

    let last = &item[item.len() - 1];
    let prev = &item[item.len() - 2];

    let last_is_alias = match last {
        Token::Word(w) => !is_expression_keyword(w),
        Token::Quoted(_) => true,
        _ => false,
    };
    let prev_ends_expr = match prev {
        Token::RightParen | Token::Quoted(_) | Token::Str(_) | Token::Number(_) => true,
        Token::Word(w) => !is_expression_keyword(w) || w.eq_ignore_ascii_case("END"),
        _ => false,
    };

    if last_is_alias && prev_ends_expr {
        &item[..item.len() - 1]
    } else {
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign_validator() -> SqlValidator {
        SqlValidator::new(
            ["campaigns"],
            [
                "Campaign_Name",
                "Platform",
                "Spend",
                "Clicks",
                "Impressions",
                "Conversions",
                "Date",
            ],
        )
    }

    fn assert_invalid(validator: &SqlValidator, sql: &str) -> String {
        let result = validator.validate_query(sql);
        assert!(!result.is_valid, "应拒绝: {}", sql);
        result.error.expect("拒绝时必须带原因")
    }

    #[test]
    fn test_valid_aggregate_scenario() {
        let validator = SqlValidator::new(["campaigns"], Vec::<String>::new());
        let result = validator.validate_query(
            "SELECT Campaign_Name, SUM(Spend) FROM campaigns GROUP BY Campaign_Name",
        );
        assert_eq!(result, ValidationResult::valid());

        let result = campaign_validator().validate_query(
            "SELECT Campaign_Name, SUM(Spend) FROM campaigns GROUP BY Campaign_Name",
        );
        assert!(result.is_valid);
    }

    #[test]
    fn test_stacked_drop_rejected() {
        let validator = SqlValidator::new(["campaigns"], Vec::<String>::new());
        let error = assert_invalid(&validator, "SELECT * FROM campaigns; DROP TABLE campaigns;");
        assert!(error.contains("危险关键字") || error.contains("多条语句"));
        assert!(error.contains("DROP"));
    }

    #[test]
    fn test_unauthorized_table_named() {
        let validator = SqlValidator::new(["campaigns"], Vec::<String>::new());
        let error = assert_invalid(&validator, "SELECT * FROM users");
        assert!(error.contains("users"));
        assert_eq!(
            validator.validate("SELECT * FROM users"),
            Err(ValidationError::UnauthorizedTable("users".to_string()))
        );
    }

    #[test]
    fn test_banned_keywords_whole_word_case_insensitive() {
        let validator = campaign_validator();
        for sql in [
            "SELECT * FROM campaigns WHERE 1 = 1 OR drop",
            "select * from campaigns where Delete = 1",
            "SELECT TRUNCATE FROM campaigns",
            "SELECT * FROM campaigns WHERE x = 'alter'",
            "WITH x AS (SELECT 1) INSERT INTO campaigns SELECT * FROM x",
            "SELECT exec FROM campaigns",
            "SELECT * FROM campaigns WHERE Execute = 1",
            "SELECT Grant FROM campaigns",
            "SELECT revoke FROM campaigns",
            "SELECT Update FROM campaigns",
            "SELECT Create FROM campaigns",
        ] {
            let error = assert_invalid(&validator, sql);
            assert!(error.contains("危险关键字"), "{} -> {}", sql, error);
        }
    }

    #[test]
    fn test_banned_keyword_substring_allowed() {
        let validator = SqlValidator::new(["campaigns"], ["Updated_At", "Created_By", "Dropoff"]);
        let result =
            validator.validate_query("SELECT Updated_At, Created_By, Dropoff FROM campaigns");
        assert!(result.is_valid, "{:?}", result.error);
    }

    #[test]
    fn test_comment_markers_rejected() {
        let validator = campaign_validator();
        assert_invalid(&validator, "SELECT * FROM campaigns -- trailing");
        assert_invalid(&validator, "SELECT /* hidden */ * FROM campaigns");
    }

    #[test]
    fn test_procedure_prefixes_rejected() {
        let validator = campaign_validator();
        let error = assert_invalid(&validator, "SELECT xp_cmdshell('dir') FROM campaigns");
        assert!(error.contains("xp_cmdshell"));
        assert_invalid(&validator, "SELECT SP_EXECUTESQL FROM campaigns");
    }

    #[test]
    fn test_must_start_with_select_or_with() {
        let validator = campaign_validator();
        for sql in ["EXPLAIN SELECT * FROM campaigns", "VALUES (1)", "SHOW TABLES"] {
            assert_eq!(validator.validate(sql), Err(ValidationError::NotReadOnly));
        }
        assert!(validator
            .validate_query("   select Spend from campaigns  ")
            .is_valid);
        assert!(validator
            .validate_query("WITH t AS (SELECT Spend FROM campaigns) SELECT * FROM t")
            .is_valid);
    }

    #[test]
    fn test_semicolon_only_at_end() {
        let validator = campaign_validator();
        assert!(validator
            .validate_query("SELECT Spend FROM campaigns;")
            .is_valid);
        assert!(validator
            .validate_query("SELECT Spend FROM campaigns;  \n")
            .is_valid);
        assert_eq!(
            validator.validate("SELECT Spend FROM campaigns; SELECT 1"),
            Err(ValidationError::MultipleStatements)
        );
        assert_eq!(
            validator.validate("SELECT Spend FROM campaigns;;"),
            Err(ValidationError::MultipleStatements)
        );
    }

    #[test]
    fn test_empty_query() {
        let validator = campaign_validator();
        assert_eq!(validator.validate("   "), Err(ValidationError::Empty));
    }

    #[test]
    fn test_table_names_case_insensitive() {
        let validator = campaign_validator();
        assert!(validator
            .validate_query("SELECT Spend FROM CAMPAIGNS")
            .is_valid);
        assert!(validator
            .validate_query("SELECT c.Spend FROM main.campaigns c")
            .is_valid);
    }

    #[test]
    fn test_hidden_second_table_rejected() {
        let validator = campaign_validator();
        assert_eq!(
            validator.validate("SELECT * FROM (SELECT Spend FROM campaigns) s, users"),
            Err(ValidationError::UnauthorizedTable("users".to_string()))
        );
        assert_eq!(
            validator.validate("SELECT * FROM campaigns JOIN sqlite_master ON 1 = 1"),
            Err(ValidationError::UnauthorizedTable("sqlite_master".to_string()))
        );
    }

    #[test]
    fn test_cte_names_allowed() {
        let validator = campaign_validator();
        let sql = "WITH totals AS (SELECT Platform, SUM(Spend) AS total FROM campaigns GROUP BY Platform) \
                   SELECT Platform, total FROM totals ORDER BY total DESC";
        assert!(validator.validate_query(sql).is_valid);
    }

    #[test]
    fn test_unknown_column_rejected_in_strict_mode() {
        let validator = campaign_validator();
        assert_eq!(
            validator.validate("SELECT password FROM campaigns"),
            Err(ValidationError::UnknownColumn("password".to_string()))
        );
        assert_eq!(
            validator.validate("SELECT SUM(secret) FROM campaigns"),
            Err(ValidationError::UnknownColumn("secret".to_string()))
        );
    }

    #[test]
    fn test_unknown_column_warns_in_lenient_mode() {
        let validator = campaign_validator().with_strict_columns(false);
        assert!(!validator.strict_columns());
        assert!(validator
            .validate_query("SELECT password FROM campaigns")
            .is_valid);
    }

    #[test]
    fn test_computed_expressions_allowed() {
        let validator = campaign_validator();
        for sql in [
            "SELECT *, Spend / NULLIF(Clicks, 0) AS cpc FROM campaigns",
            "SELECT DISTINCT Platform FROM campaigns",
            "SELECT COUNT(*) FROM campaigns",
            "SELECT c.* FROM campaigns c",
            "SELECT ROUND(SUM(Clicks) * 100.0 / SUM(Impressions), 2) ctr FROM campaigns",
            "SELECT CASE WHEN Spend > 100 THEN 'high' ELSE 'low' END bucket FROM campaigns",
            "SELECT CAST(Clicks AS REAL) / Impressions FROM campaigns",
            "SELECT Platform, RANK() OVER (PARTITION BY Platform ORDER BY Spend DESC) FROM campaigns",
            "SELECT strftime('%Y-%m', Date) AS month, SUM(Conversions) FROM campaigns GROUP BY month",
            "SELECT \"Spend\" FROM campaigns",
            "SELECT Campaign_Name name FROM campaigns",
            "SELECT Platform FROM campaigns WHERE Spend > (SELECT AVG(Spend) FROM campaigns)",
        ] {
            let result = validator.validate_query(sql);
            assert!(result.is_valid, "{} -> {:?}", sql, result.error);
        }
    }

    #[test]
    fn test_replace_into_rejected() {
        let validator = campaign_validator();
        assert_eq!(
            validator.validate("WITH x AS (SELECT 1) REPLACE INTO campaigns SELECT * FROM x"),
            Err(ValidationError::DangerousKeyword("REPLACE".to_string()))
        );
        assert_eq!(
            validator.validate("replace  into campaigns VALUES (1)"),
            Err(ValidationError::DangerousKeyword("REPLACE".to_string()))
        );
        // 字符串函数 REPLACE 仍可使用
        assert!(validator
            .validate_query("SELECT REPLACE(Campaign_Name, '_', ' ') AS name FROM campaigns")
            .is_valid);
    }

    #[test]
    fn test_with_main_statement_must_be_select() {
        let validator = campaign_validator();
        for sql in [
            "WITH x AS (SELECT Spend FROM campaigns) VALUES (1)",
            "WITH x SELECT Spend FROM campaigns",
            "WITH x AS SELECT Spend FROM campaigns",
        ] {
            assert_eq!(validator.validate(sql), Err(ValidationError::NotReadOnly), "{}", sql);
        }
    }

    #[test]
    fn test_own_alias_does_not_whitelist_column() {
        let validator = campaign_validator();
        for sql in [
            "SELECT secret AS secret FROM campaigns",
            "SELECT secret secret FROM campaigns",
            "SELECT secret FROM campaigns AS secret",
            "SELECT secret FROM campaigns secret",
            "SELECT Spend AS secret, secret FROM campaigns",
            "SELECT secret AS x, x AS secret FROM campaigns",
        ] {
            assert_eq!(
                validator.validate(sql),
                Err(ValidationError::UnknownColumn("secret".to_string())),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_table_and_cte_names_are_not_columns() {
        let validator = campaign_validator();
        assert_eq!(
            validator.validate("SELECT campaigns FROM campaigns"),
            Err(ValidationError::UnknownColumn("campaigns".to_string()))
        );
        assert_eq!(
            validator.validate("WITH t AS (SELECT Spend FROM campaigns) SELECT t FROM t"),
            Err(ValidationError::UnknownColumn("t".to_string()))
        );
    }

    #[test]
    fn test_subquery_alias_visible_to_outer_select() {
        let validator = campaign_validator();
        let sql = "SELECT Platform, total / 2 AS half \
                   FROM (SELECT Platform, SUM(Spend) AS total FROM campaigns GROUP BY Platform)";
        assert!(validator.validate_query(sql).is_valid);
    }

    #[test]
    fn test_validation_result_from() {
        let ok: ValidationResult = Ok(()).into();
        assert!(ok.is_valid);
        assert!(ok.error.is_none());

        let err: ValidationResult = Err(ValidationError::NotReadOnly).into();
        assert!(!err.is_valid);
        assert_eq!(
            err.error.as_deref(),
            Some("只允许以 SELECT 或 WITH 开头的只读查询")
        );
    }
}
