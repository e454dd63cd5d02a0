//! Markdown index
//!
//! Human-readable serialisation of navigation trees, kept inside a host
//! markdown document under an `## Webpages` heading. Each tree is one
//! top-level bullet; re-serialising the same tree replaces its entry in
//! place (head-match rule: url AND load time), while a new tree appends.
//! The file is written atomically (write temp, rename) and is owned by the
//! single queue consumer.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::model::TreeIntentions;
use crate::storage::{Result as StorageResult, StorageError};
use crate::tree::{NavigationTree, TreeNode};

const SECTION_HEADING: &str = "## Webpages";

/// Timestamp format used in entry head lines.
const HEAD_TS_FORMAT: &str = "%Y-%m-%d %H:%M";

// ============================================================================
// MARKDOWN INDEX
// ============================================================================

pub struct MarkdownIndex {
    path: PathBuf,
}

impl MarkdownIndex {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a tree's entry, then save atomically.
    pub fn upsert_tree(
        &self,
        tree: &NavigationTree,
        intentions: Option<&TreeIntentions>,
    ) -> StorageResult<()> {
        let entry = render_tree(tree, intentions);
        let head_url = tree.head_url().to_string();
        let head_ts = tree.head_loaded_at().format(HEAD_TS_FORMAT).to_string();

        let document = self.load_or_init()?;
        let updated = upsert_entry(&document, &entry, &head_url, &head_ts);
        self.save_atomic(&updated)?;
        debug!(path = %self.path.display(), head_url, "Markdown index updated");
        Ok(())
    }

    fn load_or_init(&self) -> StorageResult<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok("# Knowledge Base\n".to_string())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write-temp-rename so readers never observe a partial file.
    fn save_atomic(&self, content: &str) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("index.md");
        let tmp = self.path.with_file_name(format!(".{}.tmp", file_name));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// RENDERING
// ============================================================================

/// Serialise a tree as a markdown bullet block.
///
/// Intentions come from the tree-level reconciliation when present, else
/// from the node's own analysis.
pub fn render_tree(tree: &NavigationTree, intentions: Option<&TreeIntentions>) -> String {
    let mut out = String::new();
    render_node(&tree.head, intentions, 0, &mut out);
    out
}

fn render_node(
    node: &TreeNode,
    intentions: Option<&TreeIntentions>,
    depth: usize,
    out: &mut String,
) {
    let indent = "  ".repeat(depth);
    let title = node
        .analysis
        .as_ref()
        .map(|a| a.title.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or(node.visit.url.as_str());

    out.push_str(&format!(
        "{}- [{}]({}) [{}]\n",
        indent,
        title,
        node.visit.url,
        node.visit.page_loaded_at.format(HEAD_TS_FORMAT)
    ));

    let detail_indent = "  ".repeat(depth + 1);
    if let Some(analysis) = &node.analysis {
        if !analysis.summary.is_empty() {
            out.push_str(&format!("{}- Summary: {}\n", detail_indent, analysis.summary));
        }
    }
    if let Some(referrer) = node.visit.referrer.as_deref() {
        if !referrer.is_empty() && referrer != "about:blank" {
            out.push_str(&format!("{}- Referrer: {}\n", detail_indent, referrer));
        }
    }
    let node_intentions: Option<Vec<String>> = intentions
        .and_then(|ti| ti.by_visit.get(&node.order_index).cloned())
        .or_else(|| node.analysis.as_ref().map(|a| a.intentions.clone()))
        .filter(|list| !list.is_empty());
    if let Some(list) = node_intentions {
        out.push_str(&format!(
            "{}- Intentions: {}\n",
            detail_indent,
            list.join("; ")
        ));
    }

    for child in &node.children {
        render_node(child, intentions, depth + 1, out);
    }
}

// ============================================================================
// DOCUMENT SURGERY
// ============================================================================

/// Parse `- [title](url) [ts]` into (url, ts).
fn parse_entry_head(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_end();
    if !trimmed.starts_with("- [") {
        return None;
    }
    let url_start = trimmed.find("](")? + 2;
    let url_end = url_start + trimmed[url_start..].find(')')?;
    let url = trimmed[url_start..url_end].to_string();

    let rest = &trimmed[url_end..];
    let ts_start = rest.find('[')? + 1;
    let ts_end = ts_start + rest[ts_start..].find(']')?;
    let ts = rest[ts_start..ts_end].to_string();
    Some((url, ts))
}

/// Replace the matching entry inside the `## Webpages` section, or append
/// the new entry; the section is created when missing. Exactly one blank
/// line separates the heading and the first bullet, and a trailing blank
/// line follows the last one.
fn upsert_entry(document: &str, entry: &str, head_url: &str, head_ts: &str) -> String {
    let lines: Vec<&str> = document.lines().collect();

    // Locate the section bounds
    let section_start = lines.iter().position(|l| l.trim_end() == SECTION_HEADING);
    let (before, section_lines, after) = match section_start {
        Some(start) => {
            let body_start = start + 1;
            let body_end = lines[body_start..]
                .iter()
                .position(|l| l.starts_with("## "))
                .map(|rel| body_start + rel)
                .unwrap_or(lines.len());
            (
                &lines[..body_start],
                &lines[body_start..body_end],
                &lines[body_end..],
            )
        }
        None => (&lines[..], &[] as &[&str], &[] as &[&str]),
    };

    // Split the section body into entries (blocks starting with a top-level
    // bullet).
    let mut entries: Vec<Vec<&str>> = Vec::new();
    for line in section_lines {
        if line.starts_with("- [") {
            entries.push(vec![line]);
        } else if let Some(current) = entries.last_mut() {
            if !line.trim().is_empty() {
                current.push(line);
            }
        }
    }

    let new_entry_lines: Vec<&str> = entry.lines().collect();
    let mut replaced = false;
    for existing in entries.iter_mut() {
        if let Some((url, ts)) = parse_entry_head(existing[0]) {
            if url == head_url && ts == head_ts {
                *existing = new_entry_lines.clone();
                replaced = true;
                break;
            }
        }
    }
    if !replaced {
        entries.push(new_entry_lines);
    }

    // Reassemble
    let mut out = String::new();
    if section_start.is_some() {
        for line in before {
            out.push_str(line);
            out.push('\n');
        }
    } else {
        for line in before {
            out.push_str(line);
            out.push('\n');
        }
        if !document.is_empty() && !document.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(SECTION_HEADING);
        out.push('\n');
    }

    out.push('\n');
    for entry_lines in &entries {
        for line in entry_lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');

    for line in after {
        out.push_str(line);
        out.push('\n');
    }

    out
}

// ============================================================================
// TESTS
// ============================================================================
