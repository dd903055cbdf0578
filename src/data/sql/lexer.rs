//! 宽松的 SQL 词法分析
//!
//! 只服务于白名单校验：把语句切成标识符、字面量和标点，不做语法检查，也从不失败。
//! 未闭合的字符串/引号标识符会一直读到语句末尾。

/// SQL 词法单元
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// 未加引号的标识符或关键字
    Word(String),
    /// 加引号的标识符（`"x"`、`` `x` ``、`[x]`）
    Quoted(String),
    /// 单引号字符串字面量
    Str(String),
    /// 数字字面量
    Number(String),
    LeftParen,
    RightParen,
    Comma,
    Dot,
    Semicolon,
    Star,
    /// 其余运算符（`=`、`<>`、`||` 等）
    Op(String),
}

impl Token {
    /// 是否为指定关键字（大小写不敏感，仅匹配未加引号的单词）
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    /// 标识符文本（加引号或未加引号）
    pub fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

const OPERATOR_CHARS: &str = "<>=!|+-/%&^~:";

/// 将 SQL 语句切分为词法单元
pub fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];

        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        match ch {
            '\'' => {
                let (text, next) = read_string(&chars, pos + 1);
                tokens.push(Token::Str(text));
                pos = next;
            }
            '"' | '`' => {
                let (text, next) = read_until(&chars, pos + 1, ch);
                tokens.push(Token::Quoted(text));
                pos = next;
            }
            '[' => {
                let (text, next) = read_until(&chars, pos + 1, ']');
                tokens.push(Token::Quoted(text));
                pos = next;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '.' if !chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                while pos < chars.len() {
                    let c = chars[pos];
                    let exponent_sign =
                        (c == '+' || c == '-') && matches!(chars[pos - 1], 'e' | 'E');
                    if c.is_ascii_alphanumeric() || c == '.' || exponent_sign {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(chars[start..pos].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$')
                {
                    pos += 1;
                }
                tokens.push(Token::Word(chars[start..pos].iter().collect()));
            }
            c if OPERATOR_CHARS.contains(c) => {
                let start = pos;
                while pos < chars.len() && OPERATOR_CHARS.contains(chars[pos]) {
                    pos += 1;
                }
                tokens.push(Token::Op(chars[start..pos].iter().collect()));
            }
            other => {
                tokens.push(Token::Op(other.to_string()));
                pos += 1;
            }
        }
    }

    tokens
}

/// 读取单引号字符串（`''` 为转义的单引号），返回内容和结束位置
fn read_string(chars: &[char], mut pos: usize) -> (String, usize) {
    let mut text = String::new();
    while pos < chars.len() {
        if chars[pos] == '\'' {
            if chars.get(pos + 1) == Some(&'\'') {
                text.push('\'');
                pos += 2;
                continue;
            }
            return (text, pos + 1);
        }
        text.push(chars[pos]);
        pos += 1;
    }
    (text, pos)
}

fn read_until(chars: &[char], mut pos: usize, close: char) -> (String, usize) {
    let start = pos;
    while pos < chars.len() && chars[pos] != close {
        pos += 1;
    }
    let text = chars[start..pos].iter().collect();
    (text, (pos + 1).min(chars.len()))
}
