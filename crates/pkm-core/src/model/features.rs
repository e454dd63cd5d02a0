//! Content feature extraction
//!
//! Cheap lexical features of a raw HTML page, recorded alongside each
//! episodic memory and exposed to procedural rules via the `content.*`
//! context fields. No DOM parsing: a stable grouping signal is enough here
//! and the LLM sees the real content anyway.

use serde::{Deserialize, Serialize};

/// How much of the page body is sampled into `content_sample`.
const CONTENT_SAMPLE_CHARS: usize = 500;

/// Lexical features of one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ContentFeatures {
    /// Page title from `<title>` or the first `<h1>`.
    pub title: String,
    /// First few hundred characters of visible text.
    pub content_sample: String,
    pub word_count: usize,
    pub has_code_blocks: bool,
    /// Ratio of anchor tags to words; high values indicate link farms and
    /// aggregator frontpages.
    pub link_density: f64,
    pub meta_description: String,
}

impl ContentFeatures {
    /// Extract features from raw HTML.
    pub fn extract(html: &str) -> Self {
        let title = extract_tag_text(html, "title")
            .or_else(|| extract_tag_text(html, "h1"))
            .unwrap_or_default();

        let meta_description = extract_meta_description(html).unwrap_or_default();

        let text = strip_tags(html);
        let word_count = text.split_whitespace().count();

        let content_sample: String = text.chars().take(CONTENT_SAMPLE_CHARS).collect();

        let lower = html.to_lowercase();
        let has_code_blocks = lower.contains("<pre") || lower.contains("<code");

        let link_count = lower.matches("<a ").count() + lower.matches("<a>").count();
        let link_density = if word_count > 0 {
            link_count as f64 / word_count as f64
        } else {
            0.0
        };

        Self {
            title,
            content_sample,
            word_count,
            has_code_blocks,
            link_density,
            meta_description,
        }
    }
}

/// Inner text of the first `<tag>...</tag>` pair, whitespace-collapsed.
///
/// Byte indices are computed on an ASCII-lowercased copy, which keeps them
/// valid for the original string.
fn extract_tag_text(html: &str, tag: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let start = lower.find(&open)?;
    let content_start = start + lower[start..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find(&close)?;

    let text = strip_tags(&html[content_start..content_end]);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn extract_meta_description(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find("<meta") {
        let tag_start = search_from + rel;
        let tag_end = tag_start + lower[tag_start..].find('>')?;
        let tag = &html[tag_start..=tag_end];
        search_from = tag_end + 1;

        if tag.to_lowercase().contains("name=\"description\"")
            || tag.to_lowercase().contains("name='description'")
        {
            return extract_attr(tag, "content");
        }
    }
    None
}

fn extract_attr(tag: &str, attr: &str) -> Option<String> {
    let lower = tag.to_lowercase();
    let needle = format!("{}=", attr);
    let idx = lower.find(&needle)?;
    let rest = &tag[idx + needle.len()..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

/// Remove tags, scripts and styles; collapse whitespace.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let lower = html.to_ascii_lowercase();
    let mut skip_until: Option<usize> = None;
    let mut in_tag = false;

    for (i, c) in html.char_indices() {
        if let Some(end) = skip_until {
            if i < end {
                continue;
            }
            skip_until = None;
            in_tag = false;
        }
        if c == '<' {
            // Skip script/style bodies entirely
            for (open, close) in [("<script", "</script>"), ("<style", "</style>")] {
                if lower[i..].starts_with(open) {
                    if let Some(rel) = lower[i..].find(close) {
                        skip_until = Some(i + rel + close.len());
                    } else {
                        skip_until = Some(html.len());
                    }
                }
            }
            in_tag = true;
            continue;
        }
        if c == '>' {
            if in_tag {
                in_tag = false;
                out.push(' ');
            }
            continue;
        }
        if !in_tag {
            out.push(c);
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
