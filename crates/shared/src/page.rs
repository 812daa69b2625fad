//! Page signals supplied by the content-side extractor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTag {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    pub text: String,
    pub href: String,
}

/// Everything the extractor could pull from the current page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSignals {
    pub title: String,
    pub meta: Vec<MetaTag>,
    pub headings: Vec<String>,
    pub links: Vec<PageLink>,
    pub snippet: String,
    pub article_content: Option<String>,
    pub is_article: bool,
    pub url: String,
}
