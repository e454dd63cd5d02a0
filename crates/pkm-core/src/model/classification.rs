//! Classification verdicts
//!
//! The base [`Classification`] is the LLM's structured output, validated at
//! the boundary. The [`EnhancedClassification`] layers the episodic boost and
//! procedural rule actions on top and carries the final accept/reject
//! decision through the workflow.

use serde::{Deserialize, Serialize};

// ============================================================================
// PAGE TYPE
// ============================================================================

/// Coarse page category assigned by the classifier.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    /// Documentation, articles, reference material - worth keeping.
    Knowledge,
    /// Web applications (mail, dashboards, editors).
    InteractiveApp,
    /// Link aggregators and feeds (news frontpages, forums).
    Aggregator,
    /// Entertainment and social browsing.
    Leisure,
    /// Navigation hops (search result pages, redirects).
    Navigation,
    /// Anything that fits none of the above.
    #[default]
    Other,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Knowledge => "knowledge",
            PageType::InteractiveApp => "interactive_app",
            PageType::Aggregator => "aggregator",
            PageType::Leisure => "leisure",
            PageType::Navigation => "navigation",
            PageType::Other => "other",
        }
    }

    /// Parse from a stored string, defaulting to `Other` for unknown values.
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "knowledge" => PageType::Knowledge,
            "interactive_app" => PageType::InteractiveApp,
            "aggregator" => PageType::Aggregator,
            "leisure" => PageType::Leisure,
            "navigation" => PageType::Navigation,
            _ => PageType::Other,
        }
    }
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// BASE CLASSIFICATION
// ============================================================================

/// The LLM's verdict for one visit, as returned through the structured-JSON
/// gate. `confidence` is clamped to [0, 1] on construction paths that adjust
/// it; the raw model output is trusted to be in range by schema validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Classification {
    pub page_type: PageType,
    pub confidence: f64,
    /// Model's one-line justification (~10 words).
    pub reasoning: String,
    pub should_process: bool,
}

// ============================================================================
// ENHANCED CLASSIFICATION
// ============================================================================

/// Final per-visit verdict after episodic and procedural enhancement.
///
/// Built inside a single workflow invocation, recorded as an episode, then
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EnhancedClassification {
    pub base: Classification,
    /// Adjustment contributed by episodic memory, already clamped so that
    /// `base.confidence + episodic_confidence_boost` stays in [0, 1].
    pub episodic_confidence_boost: f64,
    /// Confidence after the episodic boost and any priority boosts.
    pub adjusted_confidence: f64,
    /// Names of the procedural rules that matched, in evaluation order.
    pub applied_rules: Vec<String>,
    /// Tags contributed by `tag` actions.
    pub tags: Vec<String>,
    pub final_decision: bool,
    pub decision_reason: String,
}
