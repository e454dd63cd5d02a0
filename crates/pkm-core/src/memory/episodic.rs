//! Episodic Memory
//!
//! Records every classification decision and any later user corrections, and
//! feeds that history back into future decisions. Two retrieval paths:
//! vector similarity over stored episode embeddings, with a same-domain
//! lookup as the fallback when no embedding is available.
//!
//! A correction never overwrites the original decision; the two live side by
//! side so false-positive/false-negative statistics stay honest.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::LlmClient;
use crate::model::{domain_of, ContentFeatures, PageType};
use crate::storage::{
    join_sections, EpisodeStatistics, Namespace, Result as StorageResult, Storage, VectorStore,
};

/// How many similar episodes inform the boost.
const SIMILAR_LIMIT: usize = 10;

/// Weight of the accept/reject balance in the boost formula.
const BOOST_WEIGHT: f64 = 0.2;

/// Bound on domain history fetches.
const DOMAIN_LIMIT: usize = 50;

/// Similar corrections needed to override the base decision.
const CORRECTION_OVERRIDE_MIN: usize = 2;

/// Domain corrections needed before the domain-level override can fire.
const DOMAIN_OVERRIDE_MIN: usize = 3;

/// Required imbalance (one direction vs the other) for the domain override.
const DOMAIN_OVERRIDE_RATIO: f64 = 2.0;

/// Boost magnitude applied by the domain override.
const DOMAIN_OVERRIDE_MAGNITUDE: f64 = 0.2;

// ============================================================================
// EPISODE MODEL
// ============================================================================

/// A user's after-the-fact correction of a classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCorrection {
    pub corrected_decision: bool,
    pub corrected_type: Option<PageType>,
    pub explanation: String,
    pub corrected_at: DateTime<Utc>,
}

/// One historical classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub domain: String,
    pub page_type: PageType,
    pub confidence: f64,
    pub original_decision: bool,
    pub reasoning: String,
    /// Stored alongside the original, never replacing it.
    pub correction: Option<UserCorrection>,
    pub features: ContentFeatures,
    pub has_embedding: bool,
}

impl Episode {
    pub fn new(
        url: impl Into<String>,
        page_type: PageType,
        confidence: f64,
        original_decision: bool,
        reasoning: impl Into<String>,
        features: ContentFeatures,
    ) -> Self {
        let url = url.into();
        let domain = domain_of(&url);
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            url,
            domain,
            page_type,
            confidence,
            original_decision,
            reasoning: reasoning.into(),
            correction: None,
            features,
            has_embedding: false,
        }
    }

    /// The decision as the user would have it: corrected when a correction
    /// exists, original otherwise.
    pub fn effective_decision(&self) -> bool {
        self.correction
            .as_ref()
            .map(|c| c.corrected_decision)
            .unwrap_or(self.original_decision)
    }
}

/// What episodic memory contributes to one classification.
#[derive(Debug, Clone, Default)]
pub struct EpisodicSignal {
    /// Added to the base confidence (the caller clamps the sum to [0, 1]).
    pub confidence_boost: f64,
    /// When set, the final decision is forced to this value.
    pub decision_override: Option<bool>,
    /// Human-readable cause, present whenever an override fires.
    pub reason: Option<String>,
}

// ============================================================================
// EPISODIC MEMORY
// ============================================================================

/// Episode store plus the boost/override computation.
pub struct EpisodicMemory {
    storage: Arc<Storage>,
    vectors: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    /// Query embeddings are cached so repeated lookups for the same page do
    /// not re-embed.
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EpisodicMemory {
    pub fn new(storage: Arc<Storage>, vectors: Arc<VectorStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            storage,
            vectors,
            llm,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
        }
    }

    /// Persist an episode and, best effort, its embedding. Embedding
    /// failures are logged and leave the episode retrievable by domain.
    pub async fn store_episode(&self, episode: &Episode) -> StorageResult<String> {
        self.storage.insert_episode(episode)?;

        let text = embedding_text(&episode.url, &episode.features.content_sample);
        match self.llm.embed_query(&text).await {
            Ok(vector) => {
                self.vectors.upsert(
                    Namespace::EpisodicMemory,
                    &episode.id,
                    Some(&vector),
                    &text,
                    &serde_json::json!({
                        "url": episode.url,
                        "domain": episode.domain,
                        "pageType": episode.page_type.as_str(),
                        "decision": episode.original_decision,
                    }),
                )?;
                self.storage.mark_episode_embedded(&episode.id)?;
            }
            Err(e) => {
                warn!(episode_id = %episode.id, error = %e, "Failed to embed episode");
            }
        }
        Ok(episode.id.clone())
    }

    /// Attach a user correction to an existing episode.
    pub fn add_user_correction(
        &self,
        episode_id: &str,
        correction: UserCorrection,
    ) -> StorageResult<()> {
        self.storage.apply_user_correction(episode_id, &correction)
    }

    /// Episodes most similar to a page, by embedding. Falls back to
    /// same-domain history when the query cannot be embedded.
    pub async fn find_similar(
        &self,
        url: &str,
        content_sample: &str,
        limit: usize,
    ) -> StorageResult<Vec<Episode>> {
        let text = embedding_text(url, content_sample);

        let query = {
            let cached = {
                let mut cache = self
                    .query_cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                cache.get(&text).cloned()
            };
            match cached {
                Some(vector) => Some(vector),
                None => match self.llm.embed_query(&text).await {
                    Ok(vector) => {
                        let mut cache = self
                            .query_cache
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        cache.put(text.clone(), vector.clone());
                        Some(vector)
                    }
                    Err(e) => {
                        debug!(error = %e, "Query embedding unavailable; using domain fallback");
                        None
                    }
                },
            }
        };

        match query {
            Some(vector) => {
                let hits = self.vectors.search(Namespace::EpisodicMemory, &vector, limit)?;
                let ids: Vec<String> = hits.into_iter().map(|h| h.key).collect();
                self.storage.episodes_by_ids(&ids)
            }
            None => self.storage.episodes_by_domain(&domain_of(url), limit),
        }
    }

    /// Recency-ordered episodes for a domain, bounded.
    pub fn get_by_domain(&self, domain: &str) -> StorageResult<Vec<Episode>> {
        self.storage.episodes_by_domain(domain, DOMAIN_LIMIT)
    }

    /// Past decisions similar to a page that landed on the given side.
    pub async fn get_similar_decisions(
        &self,
        url: &str,
        content_sample: &str,
        accepted: bool,
    ) -> StorageResult<Vec<Episode>> {
        let similar = self.find_similar(url, content_sample, SIMILAR_LIMIT).await?;
        Ok(similar
            .into_iter()
            .filter(|e| e.effective_decision() == accepted)
            .collect())
    }

    /// Compute what history says about this page.
    ///
    /// Boost: with `a` similar accepts and `r` similar rejects,
    /// `((a - r) / (a + r)) * 0.2`, zero without history. Overrides:
    /// at least two similar corrections agreeing on a direction force it;
    /// a 3+ correction domain pattern with a better than 2:1 imbalance
    /// forces its direction with a ±0.2 boost.
    pub async fn evaluate(&self, url: &str, content_sample: &str) -> StorageResult<EpisodicSignal> {
        let similar = self.find_similar(url, content_sample, SIMILAR_LIMIT).await?;

        let accepted = similar.iter().filter(|e| e.effective_decision()).count();
        let rejected = similar.len() - accepted;
        let total = accepted + rejected;
        let mut boost = if total > 0 {
            ((accepted as f64 - rejected as f64) / total as f64) * BOOST_WEIGHT
        } else {
            0.0
        };

        // Agreeing corrections among the similar episodes
        let correction_directions: Vec<bool> = similar
            .iter()
            .filter_map(|e| e.correction.as_ref())
            .map(|c| c.corrected_decision)
            .collect();
        let to_accept = correction_directions.iter().filter(|d| **d).count();
        let to_reject = correction_directions.len() - to_accept;

        let mut decision_override = None;
        let mut reason = None;
        if to_reject >= CORRECTION_OVERRIDE_MIN && to_reject > to_accept {
            decision_override = Some(false);
            reason = Some(format!(
                "{} similar pages were corrected to rejected",
                to_reject
            ));
        } else if to_accept >= CORRECTION_OVERRIDE_MIN && to_accept > to_reject {
            decision_override = Some(true);
            reason = Some(format!(
                "{} similar pages were corrected to accepted",
                to_accept
            ));
        }

        // Domain-level pattern takes precedence and carries its own
        // magnitude.
        let domain = domain_of(url);
        let domain_corrections: Vec<bool> = self
            .get_by_domain(&domain)?
            .iter()
            .filter_map(|e| e.correction.as_ref())
            .map(|c| c.corrected_decision)
            .collect();

        if domain_corrections.len() >= DOMAIN_OVERRIDE_MIN {
            let domain_accept = domain_corrections.iter().filter(|d| **d).count() as f64;
            let domain_reject = domain_corrections.len() as f64 - domain_accept;

            if domain_reject > domain_accept * DOMAIN_OVERRIDE_RATIO {
                boost = -DOMAIN_OVERRIDE_MAGNITUDE;
                decision_override = Some(false);
                reason = Some(format!(
                    "domain pattern: {} corrections to rejected on {}",
                    domain_reject as usize, domain
                ));
            } else if domain_accept > domain_reject * DOMAIN_OVERRIDE_RATIO {
                boost = DOMAIN_OVERRIDE_MAGNITUDE;
                decision_override = Some(true);
                reason = Some(format!(
                    "domain pattern: {} corrections to accepted on {}",
                    domain_accept as usize, domain
                ));
            }
        }

        Ok(EpisodicSignal {
            confidence_boost: boost,
            decision_override,
            reason,
        })
    }

    pub fn statistics(&self) -> StorageResult<EpisodeStatistics> {
        self.storage.episode_statistics()
    }
}

/// The text an episode is embedded under: url and content sample joined with
/// the store's section delimiter.
fn embedding_text(url: &str, content_sample: &str) -> String {
    join_sections(&[url, content_sample])
}

// ============================================================================
// TESTS
// ============================================================================
