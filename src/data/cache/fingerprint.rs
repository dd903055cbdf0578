//! 数据集结构指纹
//!
//! 对列名集合计算短哈希，作为查询缓存键的一部分：列集合变化后，旧缓存键自然不再命中，
//! 无需显式清理（旧条目随 TTL 过期或被淘汰）。

use sha2::{Digest, Sha256};

/// 指纹长度（十六进制字符数）
pub const FINGERPRINT_LEN: usize = 16;

/// 计算列名集合的结构指纹
///
/// 取 `sha256(json(sorted(columns)))` 的前 16 个十六进制字符。JSON 数组元素以 `", "` 分隔，
/// 非 ASCII 字符转义为 `\uXXXX`（与既有缓存目录中的键保持一致）。
/// 列顺序无关；增删或重命名任一列都会得到不同指纹。
///
/// # 示例
///
/// ```ignore
/// let a = schema_fingerprint(&["Spend", "Clicks"]);
/// let b = schema_fingerprint(&["Clicks", "Spend"]);
/// assert_eq!(a, b);
/// ```
pub fn schema_fingerprint<S: AsRef<str>>(columns: &[S]) -> String {
    let mut sorted: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    sorted.sort_unstable();

    let items: Vec<String> = sorted
        .iter()
        .map(|c| ascii_json_string(c))
        .collect();
    let encoded = format!("[{}]", items.join(", "));

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// JSON 字符串编码，非 ASCII 字符（及 DEL）按 UTF-16 转义为小写 `\uXXXX`
fn ascii_json_string(value: &str) -> String {
    let encoded = serde_json::Value::from(value).to_string();
    let mut out = String::with_capacity(encoded.len());
    for ch in encoded.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{:04x}", unit));
        }
    }
    out
}
