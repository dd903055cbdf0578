//! 从 SQL 语句中提取表名、CTE 名称、别名和 SELECT 列表
//!
//! 基于 [`tokenize`](super::lexer::tokenize) 的词法单元按括号深度遍历，
//! 不是完整的 SQL 解析器。上游 SQL 由受约束的提示词生成，这种程度的提取对白名单校验足够；
//! 直接面向不可信原始 SQL 时应换成基于 AST 的解析。

use super::lexer::{tokenize, Token};

/// `FROM` 在这些函数的括号内不表示表引用，如 `EXTRACT(YEAR FROM date)`
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &[
    "EXTRACT",
    "TRIM",
    "SUBSTRING",
    "SUBSTR",
    "POSITION",
    "OVERLAY",
];

/// 结束 FROM 子句中表引用列表的关键字
const CLAUSE_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "JOIN", "INNER",
    "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "ON", "USING", "UNION", "EXCEPT",
    "INTERSECT", "WINDOW", "QUALIFY", "FETCH",
];

/// 结束 SELECT 列表的关键字（与 SELECT 处于同一括号深度时）
const SELECT_TERMINATORS: &[&str] = &[
    "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION", "EXCEPT",
    "INTERSECT", "WINDOW", "QUALIFY", "FETCH",
];

fn is_any_keyword(token: &Token, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| token.is_keyword(kw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FromState {
    Idle,
    ExpectRef,
    AfterRef,
}

/// 每个括号层级的遍历状态
struct Frame {
    from_state: FromState,
    /// 是否处于 `EXTRACT(...)` 这类函数参数内
    from_is_argument: bool,
}

impl Frame {
    fn new(from_is_argument: bool) -> Self {
        Self {
            from_state: FromState::Idle,
            from_is_argument,
        }
    }
}

/// 从 SQL 语句中提取 `FROM` / `JOIN` 引用的表名
///
/// 支持逗号分隔的多表（`FROM a, b`）、子查询（`FROM (SELECT ...) s, b`）和模式前缀
/// （`main.campaigns` 取 `campaigns`）。按出现顺序去重，保留原始大小写。
/// 表值函数（`FROM read_csv('x')`）按表名处理。
///
/// # 示例
///
/// ```ignore
/// let tables = extract_tables("SELECT * FROM campaigns c JOIN budgets b ON c.id = b.id");
/// assert_eq!(tables, vec!["campaigns", "budgets"]);
/// ```
pub fn extract_tables(sql: &str) -> Vec<String> {
    let tokens = tokenize(sql);
    let mut tables: Vec<String> = Vec::new();
    let mut frames = vec![Frame::new(false)];
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];

        match token {
            Token::LeftParen => {
                let is_argument = i > 0 && is_any_keyword(&tokens[i - 1], FROM_ARGUMENT_FUNCTIONS);
                if let Some(frame) = frames.last_mut() {
                    if frame.from_state == FromState::ExpectRef {
                        // 子查询作为表引用，后面可能跟别名或逗号
                        frame.from_state = FromState::AfterRef;
                    }
                }
                frames.push(Frame::new(is_argument));
                i += 1;
                continue;
            }
            Token::RightParen => {
                if frames.len() > 1 {
                    frames.pop();
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let Some(frame) = frames.last_mut() else {
            break;
        };

        match frame.from_state {
            FromState::ExpectRef => {
                if token.is_keyword("LATERAL") || token.is_keyword("ONLY") {
                    i += 1;
                    continue;
                }
                if let Some(name) = token.ident() {
                    // 限定名取最后一段：main.campaigns -> campaigns
                    let mut last = name;
                    while i + 2 < tokens.len() && tokens[i + 1] == Token::Dot {
                        match tokens[i + 2].ident() {
                            Some(part) => {
                                last = part;
                                i += 2;
                            }
                            None => break,
                        }
                    }
                    if !tables.iter().any(|t| t == last) {
                        tables.push(last.to_string());
                    }
                    frame.from_state = FromState::AfterRef;
                    i += 1;
                    continue;
                }
                frame.from_state = FromState::Idle;
            }
            FromState::AfterRef => {
                if *token == Token::Comma {
                    frame.from_state = FromState::ExpectRef;
                    i += 1;
                    continue;
                }
                if is_any_keyword(token, CLAUSE_KEYWORDS) || *token == Token::Semicolon {
                    frame.from_state = FromState::Idle;
                }
                // 其余为别名或 AS，保持 AfterRef
            }
            FromState::Idle => {}
        }

        if (token.is_keyword("FROM") || token.is_keyword("JOIN")) && !frame.from_is_argument {
            frame.from_state = FromState::ExpectRef;
        }

        i += 1;
    }

    tables
}

/// 提取语句自身声明的 CTE 名称（`WITH name AS (...)`）
pub fn extract_cte_names(sql: &str) -> Vec<String> {
    parse_cte_list(&tokenize(sql)).0
}

/// 主语句（CTE 列表之后）是否为 SELECT
///
/// `WITH` 后无法完整解析的 CTE 列表视为非 SELECT。主语句外层的括号会被跳过。
pub fn main_statement_is_select(sql: &str) -> bool {
    let tokens = tokenize(sql);
    let (_, mut i) = parse_cte_list(&tokens);
    while tokens.get(i) == Some(&Token::LeftParen) {
        i += 1;
    }
    tokens.get(i).is_some_and(|t| t.is_keyword("SELECT"))
}

/// 解析 `WITH [RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] (...) [, ...]`
///
/// 返回完整解析出的 CTE 名称，以及主语句开始的位置。
fn parse_cte_list(tokens: &[Token]) -> (Vec<String>, usize) {
    let mut names = Vec::new();

    if !tokens.first().is_some_and(|t| t.is_keyword("WITH")) {
        return (names, 0);
    }

    let mut i = 1;
    if tokens.get(i).is_some_and(|t| t.is_keyword("RECURSIVE")) {
        i += 1;
    }

    loop {
        let Some(name) = tokens.get(i).and_then(Token::ident) else {
            break;
        };
        let mut j = i + 1;

        // 可选的列名列表：name (a, b) AS (...)
        if tokens.get(j) == Some(&Token::LeftParen) {
            j = skip_parens(tokens, j);
        }

        if !tokens.get(j).is_some_and(|t| t.is_keyword("AS")) {
            break;
        }
        j += 1;

        while tokens
            .get(j)
            .is_some_and(|t| t.is_keyword("NOT") || t.is_keyword("MATERIALIZED"))
        {
            j += 1;
        }

        if tokens.get(j) != Some(&Token::LeftParen) {
            break;
        }
        names.push(name.to_string());
        i = skip_parens(tokens, j);

        if tokens.get(i) == Some(&Token::Comma) {
            i += 1;
        } else {
            break;
        }
    }

    (names, i)
}

/// 提取语句中所有 SELECT 列表（含子查询与 CTE），按 `SELECT` 出现顺序排列
///
/// 每个列表项为一组词法单元，按同层逗号切分，`DISTINCT` / `ALL` 前缀保留在第一项中。
pub fn select_lists(sql: &str) -> Vec<Vec<Vec<Token>>> {
    let tokens = tokenize(sql);
    let depths = paren_depths(&tokens);
    let mut lists = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if !token.is_keyword("SELECT") {
            continue;
        }
        let depth = depths[i];
        let mut items = Vec::new();
        let mut current: Vec<Token> = Vec::new();

        for (j, inner) in tokens.iter().enumerate().skip(i + 1) {
            let at_level = depths[j] == depth;
            let ends_list = at_level
                && (is_any_keyword(inner, SELECT_TERMINATORS)
                    || *inner == Token::RightParen
                    || *inner == Token::Semicolon);
            if ends_list {
                break;
            }
            if at_level && *inner == Token::Comma {
                items.push(std::mem::take(&mut current));
                continue;
            }
            current.push(inner.clone());
        }

        if !current.is_empty() {
            items.push(current);
        }
        lists.push(items);
    }

    lists
}

/// 每个词法单元之前未闭合的括号数（右括号记为其内部层级）
fn paren_depths(tokens: &[Token]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|token| match token {
            Token::LeftParen => {
                let current = depth;
                depth += 1;
                current
            }
            Token::RightParen => {
                let current = depth;
                depth = depth.saturating_sub(1);
                current
            }
            _ => depth,
        })
        .collect()
}

/// 跳过从 `start`（左括号）开始的平衡括号，返回右括号之后的位置
fn skip_parens(tokens: &[Token], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < tokens.len() {
        match tokens[i] {
            Token::LeftParen => depth += 1,
            Token::RightParen => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    i
}
