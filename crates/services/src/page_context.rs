//! Page Context Packing
//!
//! Turns the signals extracted from a page into one text blob that fits a
//! fixed byte budget. The blob travels in the same prompt as a screenshot,
//! and providers reject oversized multimodal prompts outright, so the budget
//! is a hard ceiling rather than a target.
//!
//! Priority, highest first:
//! - title and URL
//! - article body (articles only). If it has to be cut, nothing else follows.
//! - snippet
//! - meta tags, headings, links, item by item until the budget runs out

use regex::Regex;
use shared::page::PageSignals;
use std::sync::LazyLock;

/// 10 KiB
pub const DEFAULT_CONTEXT_BUDGET: usize = 10 * 1024;

const ELLIPSIS: &str = "…";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn normalize(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Byte-bounded output buffer
struct ContextWriter {
    buf: String,
    budget: usize,
}

impl ContextWriter {
    fn new(budget: usize) -> Self {
        Self {
            buf: String::new(),
            budget,
        }
    }

    fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.buf.len())
    }

    fn try_push(&mut self, text: &str) -> bool {
        if text.len() <= self.remaining() {
            self.buf.push_str(text);
            true
        } else {
            false
        }
    }

    /// Push `prefix + text + suffix`, cutting `text` if needed.
    ///
    /// Returns `true` only if `text` went in whole.
    fn push_truncated(&mut self, prefix: &str, text: &str, suffix: &str) -> bool {
        let whole = prefix.len() + text.len() + suffix.len();
        if whole <= self.remaining() {
            self.buf.push_str(prefix);
            self.buf.push_str(text);
            self.buf.push_str(suffix);
            return true;
        }

        let overhead = prefix.len() + ELLIPSIS.len() + suffix.len();
        let Some(room) = self.remaining().checked_sub(overhead) else {
            return false;
        };
        let cut = cut_at_boundary(text, room);
        if cut.is_empty() {
            return false;
        }
        self.buf.push_str(prefix);
        self.buf.push_str(cut);
        self.buf.push_str(ELLIPSIS);
        self.buf.push_str(suffix);
        false
    }

    /// Push a titled list, stopping at the first item that does not fit.
    /// The title is written only together with the first item.
    ///
    /// Returns `true` if every item went in.
    fn push_section<I>(&mut self, title: &str, items: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let header = format!("\n{}:\n", title);
        let mut wrote_header = false;
        for item in items {
            let line = format!("- {}\n", item);
            if !wrote_header {
                if header.len() + line.len() > self.remaining() {
                    return false;
                }
                self.buf.push_str(&header);
                wrote_header = true;
            }
            if !self.try_push(&line) {
                return false;
            }
        }
        true
    }

    fn finish(self) -> String {
        self.buf
    }
}

/// Longest prefix of `text` of at most `max_bytes` bytes, ending on a char
/// boundary and, where that keeps most of the text, on a word boundary.
fn cut_at_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let cut = &text[..end];
    match cut.rfind(char::is_whitespace) {
        Some(space) if space >= end / 2 => cut[..space].trim_end(),
        _ => cut,
    }
}

/// Pack page signals into at most `budget` bytes of prompt text.
///
/// Once anything has to be cut, every lower-priority section is dropped.
pub fn chunk_context(signals: &PageSignals, budget: usize) -> String {
    let mut out = ContextWriter::new(budget);

    let title = normalize(&signals.title);
    if !title.is_empty() && !out.push_truncated("Title: ", &title, "\n") {
        return out.finish();
    }
    let url = signals.url.trim();
    if !url.is_empty() && !out.try_push(&format!("URL: {}\n", url)) {
        return out.finish();
    }

    if signals.is_article {
        let article = signals
            .article_content
            .as_deref()
            .map(normalize)
            .unwrap_or_default();
        if !article.is_empty() && !out.push_truncated("\nArticle:\n", &article, "\n") {
            return out.finish();
        }
    }

    let snippet = normalize(&signals.snippet);
    if !snippet.is_empty() && !out.push_truncated("\nSummary:\n", &snippet, "\n") {
        return out.finish();
    }

    let meta = signals
        .meta
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.name.trim(), normalize(&m.content)));
    if !out.push_section("Meta", meta) {
        return out.finish();
    }

    let headings = signals
        .headings
        .iter()
        .map(|h| normalize(h))
        .filter(|h| !h.is_empty());
    if !out.push_section("Headings", headings) {
        return out.finish();
    }

    let links = signals.links.iter().filter(|l| !l.href.is_empty()).map(|l| {
        let text = normalize(&l.text);
        if text.is_empty() {
            l.href.clone()
        } else {
            format!("{} ({})", text, l.href)
        }
    });
    out.push_section("Links", links);

    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::page::{MetaTag, PageLink};

    fn rich_page(is_article: bool, article_len: usize) -> PageSignals {
        PageSignals {
            title: "Tide pools of the Pacific".into(),
            meta: (0..50)
                .map(|i| MetaTag {
                    name: format!("meta{}", i),
                    content: "a fairly long meta description value ".repeat(4),
                })
                .collect(),
            headings: (0..80).map(|i| format!("Heading number {}", i)).collect(),
            links: (0..120)
                .map(|i| PageLink {
                    text: format!("Link {}", i),
                    href: format!("https://example.com/page/{}", i),
                })
                .collect(),
            snippet: "Anemones, sea stars and crabs.".into(),
            article_content: Some("word ".repeat(article_len / 5)),
            is_article,
            url: "https://example.com/tide-pools".into(),
        }
    }

    #[test]
    fn test_output_never_exceeds_budget() {
        for budget in [0, 7, 64, 500, 2048, DEFAULT_CONTEXT_BUDGET] {
            for page in [rich_page(false, 0), rich_page(true, 200), rich_page(true, 50_000)] {
                let out = chunk_context(&page, budget);
                assert!(out.len() <= budget, "budget {} got {}", budget, out.len());
            }
        }
    }

    #[test]
    fn test_oversized_article_is_truncated_and_drops_other_sections() {
        let page = rich_page(true, 50_000);
        let out = chunk_context(&page, DEFAULT_CONTEXT_BUDGET);

        assert!(out.starts_with("Title: Tide pools of the Pacific\nURL: "));
        assert!(out.contains("\nArticle:\n"));
        assert!(out.trim_end().ends_with(ELLIPSIS));
        assert!(!out.contains("Meta:"));
        assert!(!out.contains("Headings:"));
        assert!(!out.contains("Links:"));
        assert!(!out.contains("Summary:"));
    }

    #[test]
    fn test_short_article_leaves_room_for_lower_priority_sections() {
        let out = chunk_context(&rich_page(true, 200), DEFAULT_CONTEXT_BUDGET);
        assert!(out.contains("\nArticle:\n"));
        assert!(out.contains("\nSummary:\n"));
        assert!(out.contains("\nMeta:\n- meta0: "));
        assert!(out.len() <= DEFAULT_CONTEXT_BUDGET);
    }

    #[test]
    fn test_non_article_ignores_article_content() {
        let out = chunk_context(&rich_page(false, 5_000), DEFAULT_CONTEXT_BUDGET);
        assert!(!out.contains("Article:"));
        assert!(out.contains("Headings:"));
    }

    #[test]
    fn test_sections_fill_in_priority_order() {
        // Meta overflows, so nothing after it makes it in even if a
        // heading would still fit.
        let out = chunk_context(&rich_page(false, 0), 2048);
        assert!(out.contains("Meta:"));
        assert!(!out.contains("Headings:"));
        assert!(!out.contains("Links:"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let page = PageSignals {
            title: "Café".into(),
            article_content: Some("é".repeat(4_000)),
            is_article: true,
            ..PageSignals::default()
        };
        let out = chunk_context(&page, 1_001);
        assert!(out.len() <= 1_001);
        assert!(out.contains("Article:"));
        assert!(out.trim_end().ends_with(ELLIPSIS));
    }

    #[test]
    fn test_empty_page_yields_empty_context() {
        assert_eq!(chunk_context(&PageSignals::default(), DEFAULT_CONTEXT_BUDGET), "");
    }

    #[test]
    fn test_cut_prefers_word_boundary() {
        assert_eq!(cut_at_boundary("hello wonderful world", 18), "hello wonderful");
        assert_eq!(cut_at_boundary("hello wonderful world", 12), "hello wonder");
        assert_eq!(cut_at_boundary("short", 12), "short");
    }
}
