//! Classifier / Enhanced Filter
//!
//! The decision pipeline for one visit: LLM base classification, episodic
//! confidence boost, procedural rule actions, then one final verdict with a
//! fixed precedence (explicit reject, explicit accept, memory override,
//! default threshold path). Every verdict is recorded as an episode so the
//! system can learn from later corrections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::FilterConfig;
use crate::llm::{complete_json, prompts, LlmClient, LlmError, LLM_TIMEOUT_SECS};
use crate::memory::{Episode, EpisodicMemory, ProceduralMemory, RuleAction};
use crate::model::{Classification, ContentFeatures, EnhancedClassification, PageType, Visit};
use crate::storage::StorageError;

/// Confidence added per matched `priority_boost` action.
const PRIORITY_BOOST: f64 = 0.1;

/// Content window for the transient-failure retry.
const RETRY_CONTENT_CHARS: usize = 1000;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Filter error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The base classification could not be obtained or validated
    #[error("Classifier error: {0}")]
    Classifier(#[from] LlmError),
    /// Memory lookups failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// METRICS
// ============================================================================

/// Decision counters, constructed once at startup and threaded through the
/// workflow as an explicit dependency.
#[derive(Debug, Default)]
pub struct FilterMetrics {
    processed: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    rejected_by_rule: AtomicU64,
    accepted_by_rule: AtomicU64,
    overridden_by_memory: AtomicU64,
}

/// Point-in-time view of [`FilterMetrics`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMetricsSnapshot {
    pub processed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rejected_by_rule: u64,
    pub accepted_by_rule: u64,
    pub overridden_by_memory: u64,
}

impl FilterMetrics {
    pub fn snapshot(&self) -> FilterMetricsSnapshot {
        FilterMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rejected_by_rule: self.rejected_by_rule.load(Ordering::Relaxed),
            accepted_by_rule: self.accepted_by_rule.load(Ordering::Relaxed),
            overridden_by_memory: self.overridden_by_memory.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// ENHANCED FILTER
// ============================================================================

/// How the final decision was reached. Internal to the precedence logic.
enum DecisionPath {
    RuleReject(String),
    RuleAccept(String),
    MemoryOverride(bool, String),
    Default(bool, String),
}

pub struct EnhancedFilter {
    llm: Arc<dyn LlmClient>,
    episodic: Arc<EpisodicMemory>,
    procedural: Arc<ProceduralMemory>,
    config: FilterConfig,
    model: String,
    metrics: FilterMetrics,
}

impl EnhancedFilter {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        episodic: Arc<EpisodicMemory>,
        procedural: Arc<ProceduralMemory>,
        config: FilterConfig,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            episodic,
            procedural,
            config,
            model: model.into(),
            metrics: FilterMetrics::default(),
        }
    }

    pub fn metrics(&self) -> FilterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Classify one visit and decide whether it should be processed.
    ///
    /// The returned classification carries the full audit trail: boost,
    /// matched rules, tags, and the decision reason. The episode is
    /// recorded before returning.
    pub async fn classify(
        &self,
        visit: &Visit,
    ) -> Result<EnhancedClassification, FilterError> {
        let features = ContentFeatures::extract(&visit.raw_content);

        if !self.config.enabled {
            return Ok(EnhancedClassification {
                base: Classification {
                    page_type: PageType::Other,
                    confidence: 1.0,
                    reasoning: "filtering disabled".to_string(),
                    should_process: true,
                },
                episodic_confidence_boost: 0.0,
                adjusted_confidence: 1.0,
                applied_rules: Vec::new(),
                tags: Vec::new(),
                final_decision: true,
                decision_reason: "filtering disabled".to_string(),
            });
        }

        // 1. Base classification through the structured-JSON gate.
        let mut base = self.classify_base(visit).await?;
        base.confidence = base.confidence.clamp(0.0, 1.0);

        // 2. Episodic boost and possible override.
        let signal = self
            .episodic
            .evaluate(&visit.url, &features.content_sample)
            .await?;
        let mut adjusted = (base.confidence + signal.confidence_boost).clamp(0.0, 1.0);

        // 3. Procedural actions.
        let ctx = rule_context(visit, &base, &features);
        let matches = self.procedural.evaluate(&ctx, &visit.url)?;

        let applied_rules: Vec<String> = matches.iter().map(|m| m.rule_name.clone()).collect();
        let mut tags = Vec::new();
        for m in &matches {
            match &m.action {
                RuleAction::Tag(tag) => tags.push(tag.clone()),
                RuleAction::PriorityBoost => {
                    adjusted = (adjusted + PRIORITY_BOOST).clamp(0.0, 1.0);
                }
                _ => {}
            }
        }

        // 4. Decision, in precedence order.
        let path = self.decide(&base, adjusted, &signal.decision_override, &signal.reason, &matches);
        let (final_decision, decision_reason) = match &path {
            DecisionPath::RuleReject(name) => {
                self.metrics.rejected_by_rule.fetch_add(1, Ordering::Relaxed);
                (false, format!("rejected by rule '{}'", name))
            }
            DecisionPath::RuleAccept(name) => {
                self.metrics.accepted_by_rule.fetch_add(1, Ordering::Relaxed);
                (true, format!("accepted by rule '{}'", name))
            }
            DecisionPath::MemoryOverride(decision, reason) => {
                self.metrics
                    .overridden_by_memory
                    .fetch_add(1, Ordering::Relaxed);
                (*decision, format!("episodic override: {}", reason))
            }
            DecisionPath::Default(decision, reason) => (*decision, reason.clone()),
        };

        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        if final_decision {
            self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        }

        if self.config.log_decisions {
            info!(
                url = %visit.url,
                page_type = base.page_type.as_str(),
                confidence = base.confidence,
                adjusted_confidence = adjusted,
                boost = signal.confidence_boost,
                decision = final_decision,
                reason = %decision_reason,
                "Filter decision"
            );
        }

        // 5. Record the episode. The reasoning stored is the decision
        // reason, so rule rejections stay traceable; a later user
        // correction attaches alongside it.
        let episode = Episode::new(
            visit.url.clone(),
            base.page_type,
            base.confidence,
            final_decision,
            decision_reason.clone(),
            features,
        );
        if let Err(e) = self.episodic.store_episode(&episode).await {
            warn!(visit_id = %visit.id, error = %e, "Failed to record episode");
        }

        Ok(EnhancedClassification {
            base,
            episodic_confidence_boost: signal.confidence_boost,
            adjusted_confidence: adjusted,
            applied_rules,
            tags,
            final_decision,
            decision_reason,
        })
    }

    fn decide(
        &self,
        base: &Classification,
        adjusted: f64,
        memory_override: &Option<bool>,
        memory_reason: &Option<String>,
        matches: &[crate::memory::RuleMatch],
    ) -> DecisionPath {
        for m in matches {
            match m.action {
                RuleAction::Reject => return DecisionPath::RuleReject(m.rule_name.clone()),
                RuleAction::Accept => return DecisionPath::RuleAccept(m.rule_name.clone()),
                _ => {}
            }
        }

        if let Some(decision) = memory_override {
            let reason = memory_reason
                .clone()
                .unwrap_or_else(|| "past corrections".to_string());
            return DecisionPath::MemoryOverride(*decision, reason);
        }

        if !self.config.allows_type(base.page_type) {
            return DecisionPath::Default(
                false,
                format!("page type '{}' is not collected", base.page_type),
            );
        }
        if adjusted < self.config.min_confidence {
            return DecisionPath::Default(
                false,
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    adjusted, self.config.min_confidence
                ),
            );
        }
        if !base.should_process {
            return DecisionPath::Default(false, "model advised against processing".to_string());
        }
        DecisionPath::Default(
            true,
            format!(
                "{} with confidence {:.2}",
                base.page_type, adjusted
            ),
        )
    }

    async fn classify_base(&self, visit: &Visit) -> Result<Classification, LlmError> {
        let prompt = prompts::classification_prompt(&visit.url, &visit.raw_content);
        match self.complete_with_deadline(&prompt).await {
            Ok(classification) => Ok(classification),
            Err(e) if e.is_transient() => {
                warn!(
                    visit_url = %visit.url,
                    error = %e,
                    "Transient classifier failure; retrying with smaller window"
                );
                let prompt = prompts::classification_prompt_windowed(
                    &visit.url,
                    &visit.raw_content,
                    RETRY_CONTENT_CHARS,
                );
                self.complete_with_deadline(&prompt).await
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_with_deadline(&self, prompt: &str) -> Result<Classification, LlmError> {
        tokio::time::timeout(
            Duration::from_secs(LLM_TIMEOUT_SECS),
            complete_json::<Classification>(
                self.llm.as_ref(),
                prompt,
                prompts::CLASSIFY_SYSTEM_PROMPT,
                &self.model,
            ),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
    }
}

/// The context procedural rules evaluate against.
fn rule_context(
    visit: &Visit,
    base: &Classification,
    features: &ContentFeatures,
) -> serde_json::Value {
    serde_json::json!({
        "url": visit.url,
        "domain": visit.domain(),
        "title": features.title,
        "page_type": base.page_type.as_str(),
        "confidence": base.confidence,
        "content": {
            "sample": features.content_sample,
            "word_count": features.word_count,
            "has_code_blocks": features.has_code_blocks,
            "link_density": features.link_density,
        },
        "metadata": {
            "description": features.meta_description,
        },
    })
}

// ============================================================================
// TESTS
// ============================================================================
