//! Visit - one observed page load
//!
//! A visit is identified deterministically by its URL and load time, so the
//! same browser submission always lands on the same row. Everything else in
//! the pipeline (analyses, vector entries, markdown bullets) is keyed by that
//! id, which is what makes re-runs idempotent.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

// ============================================================================
// VISIT ID
// ============================================================================

/// Deterministic visit identifier.
///
/// Lowercase hex MD5 of `"{url}:{page_loaded_at}"`, where `page_loaded_at`
/// is the timestamp string exactly as the browser submitted it. Submitting
/// the same page load twice yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitId(String);

impl VisitId {
    /// Derive the id from the url and the submitted load-time string.
    pub fn derive(url: &str, page_loaded_at: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        hasher.update(b":");
        hasher.update(page_loaded_at.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        VisitId(hex)
    }

    /// Wrap an id that already exists in the store.
    pub fn from_existing(id: impl Into<String>) -> Self {
        VisitId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VisitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// VISIT
// ============================================================================

/// One observed page load.
///
/// Created on intake, mutated only to repair the referrer (orphan
/// reparenting) and to attach the tree id during reconciliation. Never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    /// Deterministic id, see [`VisitId::derive`].
    pub id: String,
    /// Page URL as observed by the browser.
    pub url: String,
    /// When the page finished loading.
    pub page_loaded_at: DateTime<Utc>,
    /// Resolved referrer URL, if any.
    pub referrer: Option<String>,
    /// Load time of the referrer page, if known.
    pub referrer_timestamp: Option<DateTime<Utc>>,
    /// Browser tab that opened this page. Transient: used for referrer
    /// resolution only, never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<i64>,
    /// Decompressed page HTML.
    pub raw_content: String,
    /// Navigation tree this visit belongs to, assigned during reconciliation.
    pub tree_id: Option<String>,
}

impl Visit {
    /// Build a visit from intake fields, deriving the id from the raw
    /// load-time string.
    pub fn new(
        url: impl Into<String>,
        page_loaded_at_raw: &str,
        page_loaded_at: DateTime<Utc>,
        raw_content: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let id = VisitId::derive(&url, page_loaded_at_raw);
        Self {
            id: id.as_str().to_string(),
            url,
            page_loaded_at,
            referrer: None,
            referrer_timestamp: None,
            opener_tab_id: None,
            raw_content: raw_content.into(),
            tree_id: None,
        }
    }

    /// Registrable domain of the visit URL (host without a leading `www.`).
    pub fn domain(&self) -> String {
        domain_of(&self.url)
    }

    /// True when the visit has no usable referrer.
    pub fn is_root(&self) -> bool {
        match &self.referrer {
            None => true,
            Some(r) => r.is_empty() || r == "about:blank",
        }
    }
}

/// Extract the host portion of a URL, stripping any `www.` prefix.
///
/// Kept deliberately simple: the classifier and the tree heuristic only need
/// a stable grouping key, not full public-suffix handling.
pub fn domain_of(url: &str) -> String {
    let after_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let host = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let host = host.split('@').next_back().unwrap_or(host);
    // Strip a numeric port; a bare colon (about:blank) is not one
    let host = match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    };
    host.strip_prefix("www.").unwrap_or(host).to_lowercase()
}

// ============================================================================
// PAGE ANALYSIS
// ============================================================================

/// LLM-produced metadata for a visit. Written once, keyed by visit id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAnalysis {
    pub visit_id: String,
    pub title: String,
    /// Short summary, at most ~50 words.
    pub summary: String,
    /// Per-page intentions inferred from the content.
    #[serde(default)]
    pub intentions: Vec<String>,
    pub analysed_at: DateTime<Utc>,
}

// ============================================================================
// TREE INTENTIONS
// ============================================================================

/// Collective intents for a tree, keyed by the visit's index in load-time
/// order. Rewritten whenever the tree changes; may supersede the per-page
/// intentions computed when a visit was analysed alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeIntentions {
    pub tree_id: String,
    /// visit index (load-time order) -> intention list
    pub by_visit: std::collections::BTreeMap<usize, Vec<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// TESTS
// ============================================================================
