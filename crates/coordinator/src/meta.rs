//! Title and suggested-question extraction from the meta turn.
//!
//! Models rarely follow the requested format exactly, so the two values are
//! parsed independently and either may be missing.

use regex::Regex;
use std::sync::LazyLock;

pub const MAX_ACTIONS: usize = 3;
const MAX_TITLE_CHARS: usize = 80;

static TITLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)perceptaTitle\W{0,3}\s*[:=]\s*"([^"\n]+)""#).unwrap());
static TITLE_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)perceptaTitle\W{0,3}\s*[:=]\s*([^\n]+)$").unwrap());
static TITLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\W{0,3}title\W{0,3}\s*:\s*([^\n]+)$").unwrap());

static ACTIONS_TAGGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)perceptaActions\W{0,3}\s*[:=]\s*(\[.*?\])").unwrap());
static QUOTED_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[\s*"(?:[^"\\]|\\.)*"(?:\s*,\s*"(?:[^"\\]|\\.)*")*\s*,?\s*\]"#).unwrap()
});
static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap());

/// The conversation title, if the output carries one
pub fn parse_title(output: &str) -> Option<String> {
    let raw = TITLE_QUOTED
        .captures(output)
        .or_else(|| TITLE_BARE.captures(output))
        .or_else(|| TITLE_LINE.captures(output))?
        .get(1)?
        .as_str();

    let title = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
        .trim();
    if title.is_empty() {
        return None;
    }
    Some(title.chars().take(MAX_TITLE_CHARS).collect())
}

/// Up to three suggested questions from a bracketed list of quoted strings
pub fn parse_actions(output: &str) -> Vec<String> {
    let list = ACTIONS_TAGGED
        .captures(output)
        .and_then(|c| c.get(1))
        .or_else(|| QUOTED_LIST.find(output));
    let Some(list) = list else {
        return Vec::new();
    };

    QUOTED
        .captures_iter(list.as_str())
        .filter_map(|c| c.get(0))
        .map(|m| unescape(m.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_ACTIONS)
        .collect()
}

/// JSON string literal to text, falling back to the raw contents
fn unescape(literal: &str) -> String {
    serde_json::from_str::<String>(literal)
        .unwrap_or_else(|_| literal.trim_matches('"').to_string())
}
