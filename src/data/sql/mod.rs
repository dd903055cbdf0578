//! SQL 校验层
//!
//! - `lexer`: 宽松的词法切分
//! - `extract`: 表名 / CTE / 别名 / SELECT 列表提取
//! - `validator`: 白名单校验器

pub mod extract;
pub mod lexer;
pub mod validator;

pub use extract::{extract_cte_names, extract_tables, main_statement_is_select, select_lists};
pub use validator::{SqlValidator, ValidationError, ValidationResult};

/// 去掉模型输出中包裹 SQL 的 Markdown 代码块
///
/// ````ignore
/// assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
/// ````
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    // 去掉首行（```sql）和末尾的 ```
    let body = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed.trim_start_matches('`'),
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sql_fence() {
        assert_eq!(
            strip_code_fences("```sql\nSELECT Spend FROM campaigns\n```"),
            "SELECT Spend FROM campaigns"
        );
    }

    #[test]
    fn test_strip_plain_fence_multiline() {
        let text = "```\nSELECT a,\n  b\nFROM t;\n```\n";
        assert_eq!(strip_code_fences(text), "SELECT a,\n  b\nFROM t;");
    }

    #[test]
    fn test_no_fence() {
        assert_eq!(strip_code_fences("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn test_single_line_fence() {
        assert_eq!(strip_code_fences("```SELECT 1```"), "SELECT 1");
    }
}
