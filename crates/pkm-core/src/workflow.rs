//! Reconciliation Workflow
//!
//! The per-visit pipeline driven by the queue consumer: filter gate, content
//! extraction, page analysis, persistence, tree reconciliation, markdown
//! index. Each step fails fast and leaves previously persisted state
//! untouched; because every write is keyed by visit id (or governed by the
//! markdown head-match rule), a rerun rolls the visit forward instead of
//! duplicating it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::filter::{EnhancedFilter, FilterError};
use crate::llm::{complete_json, prompts, LlmClient, LlmError, LLM_TIMEOUT_SECS};
use crate::model::{PageAnalysis, TreeIntentions, Visit};
use crate::storage::{Namespace, Storage, StorageError, VectorStore};
use crate::tree::{build_tree, MarkdownIndex, NavigationTree};

/// Cap on the HTML handed to content extraction.
const EXTRACT_MAX_CHARS: usize = 50_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Workflow error, always carrying the failing step's name for the log.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Step 'filter' failed: {0}")]
    Filter(#[from] FilterError),
    #[error("Step '{step}' failed: {source}")]
    Llm {
        step: &'static str,
        #[source]
        source: LlmError,
    },
    #[error("Step '{step}' failed: {source}")]
    Store {
        step: &'static str,
        #[source]
        source: StorageError,
    },
}

/// What the workflow did with a visit.
#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    /// Filtered out; the raw visit row stays, nothing else was written.
    Rejected { reason: String },
    /// Fully analysed and reconciled into a tree.
    Analysed { tree_id: String },
}

/// The seam between the queue consumer and the workflow. The queue only
/// needs "process one visit"; tests substitute a recording stub here.
#[async_trait::async_trait]
pub trait VisitProcessor: Send + Sync {
    async fn process(&self, visit: Visit) -> Result<WorkflowOutcome, WorkflowError>;
}

// ============================================================================
// LLM RESPONSE SHAPES
// ============================================================================

/// Structured output of the page-analysis call.
#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    title: String,
    summary: String,
    #[serde(default)]
    intentions: Vec<String>,
}

// ============================================================================
// WORKFLOW
// ============================================================================

pub struct ReconciliationWorkflow {
    llm: Arc<dyn LlmClient>,
    filter: Arc<EnhancedFilter>,
    storage: Arc<Storage>,
    vectors: Arc<VectorStore>,
    markdown: MarkdownIndex,
    model: String,
}

impl ReconciliationWorkflow {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        filter: Arc<EnhancedFilter>,
        storage: Arc<Storage>,
        vectors: Arc<VectorStore>,
        markdown: MarkdownIndex,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            filter,
            storage,
            vectors,
            markdown,
            model: model.into(),
        }
    }

    /// Run the full pipeline for one visit.
    async fn run(&self, visit: Visit) -> Result<WorkflowOutcome, WorkflowError> {
        let started = Instant::now();

        // The persisted row may have been repaired (orphan reparenting)
        // after this visit was enqueued; prefer the stored referrer.
        let visit = match self.storage.get_visit(&visit.id) {
            Ok(Some(mut stored)) => {
                stored.opener_tab_id = visit.opener_tab_id;
                stored
            }
            _ => visit,
        };

        // 1. Filter gate. A rejection records the episode and stops here.
        let classification = self.filter.classify(&visit).await?;
        if !classification.final_decision {
            return Ok(WorkflowOutcome::Rejected {
                reason: classification.decision_reason,
            });
        }

        // 2. Content extraction.
        let markdown_content = self.extract_content(&visit).await?;

        // 3. Page analysis.
        let analysis = self.analyse_page(&visit, &markdown_content).await?;

        // 4. Persist: relational first, then the vector store.
        self.storage
            .upsert_analysis(&analysis)
            .map_err(|source| WorkflowError::Store {
                step: "persist-analysis",
                source,
            })?;
        self.persist_content(&visit, &analysis, &markdown_content)
            .await?;

        // 5. Tree reconciliation.
        let (tree, intentions) = self.reconcile_tree(&visit).await?;

        // 6. Markdown index.
        self.markdown
            .upsert_tree(&tree, intentions.as_ref())
            .map_err(|source| WorkflowError::Store {
                step: "markdown-index",
                source,
            })?;

        info!(
            visit_id = %visit.id,
            url = %visit.url,
            tree_id = %tree.id,
            tree_size = tree.size,
            duration_ms = started.elapsed().as_millis() as u64,
            "Visit analysed and reconciled"
        );

        Ok(WorkflowOutcome::Analysed { tree_id: tree.id })
    }

    /// Ask the LLM for clean markdown, retrying once with a halved window on
    /// a transient failure.
    async fn extract_content(&self, visit: &Visit) -> Result<String, WorkflowError> {
        let window: String = visit.raw_content.chars().take(EXTRACT_MAX_CHARS).collect();

        let first = self
            .complete_text(&prompts::extraction_prompt(&window))
            .await;
        let markdown = match first {
            Ok(text) => text,
            Err(e) if e.is_transient() => {
                warn!(
                    visit_id = %visit.id,
                    error = %e,
                    "Transient extraction failure; retrying with smaller window"
                );
                let half: String = window.chars().take(window.chars().count() / 2).collect();
                self.complete_text(&prompts::extraction_prompt(&half))
                    .await
                    .map_err(|source| WorkflowError::Llm {
                        step: "extract-content",
                        source,
                    })?
            }
            Err(source) => {
                return Err(WorkflowError::Llm {
                    step: "extract-content",
                    source,
                })
            }
        };
        Ok(markdown)
    }

    async fn analyse_page(
        &self,
        visit: &Visit,
        markdown: &str,
    ) -> Result<PageAnalysis, WorkflowError> {
        let prompt = prompts::analysis_prompt(&visit.url, markdown);
        let response: AnalysisResponse = self
            .complete_structured(&prompt, prompts::ANALYSIS_SYSTEM_PROMPT)
            .await
            .map_err(|source| WorkflowError::Llm {
                step: "analyse-page",
                source,
            })?;

        Ok(PageAnalysis {
            visit_id: visit.id.clone(),
            title: response.title,
            summary: response.summary,
            intentions: response.intentions,
            analysed_at: Utc::now(),
        })
    }

    /// Store the cleaned markdown (the only copy of full content) in the
    /// vector store. Embedding is best effort; the content row is written
    /// either way.
    async fn persist_content(
        &self,
        visit: &Visit,
        analysis: &PageAnalysis,
        markdown: &str,
    ) -> Result<(), WorkflowError> {
        let vector = match self.llm.embed_query(markdown).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(visit_id = %visit.id, error = %e, "Content embedding failed; storing without vector");
                None
            }
        };
        self.vectors
            .upsert(
                Namespace::WebpageContent,
                &visit.id,
                vector.as_deref(),
                markdown,
                &serde_json::json!({
                    "url": visit.url,
                    "title": analysis.title,
                    "summary": analysis.summary,
                    "pageLoadedAt": visit.page_loaded_at.to_rfc3339(),
                }),
            )
            .map_err(|source| WorkflowError::Store {
                step: "persist-content",
                source,
            })
    }

    /// Attach the visit to its tree, recompute collective intentions when
    /// the tree has grown past one member, and rebuild the structure.
    async fn reconcile_tree(
        &self,
        visit: &Visit,
    ) -> Result<(NavigationTree, Option<TreeIntentions>), WorkflowError> {
        let store_err = |source| WorkflowError::Store {
            step: "reconcile-tree",
            source,
        };

        // A re-run keeps its membership; only new visits get placed.
        let existing = self.storage.tree_of_visit(&visit.id).map_err(store_err)?;
        let tree_id = match existing {
            Some(id) => id,
            None => match self.storage.find_tree_for_visit(visit).map_err(store_err)? {
                Some(id) => id,
                None => self.storage.create_tree().map_err(store_err)?,
            },
        };
        self.storage
            .add_tree_member(&tree_id, &visit.id)
            .map_err(store_err)?;

        let members = self
            .storage
            .tree_members_with_analyses(&tree_id)
            .map_err(store_err)?;

        let mut intentions: Option<TreeIntentions> = None;
        if members.len() > 1 {
            let sequence: Vec<(String, String, String)> = members
                .iter()
                .map(|(v, a)| {
                    (
                        v.url.clone(),
                        a.as_ref().map(|a| a.title.clone()).unwrap_or_default(),
                        a.as_ref().map(|a| a.summary.clone()).unwrap_or_default(),
                    )
                })
                .collect();

            match self.tree_intentions_call(&sequence).await {
                Ok(by_visit) => {
                    self.storage
                        .replace_tree_intentions(&tree_id, &by_visit)
                        .map_err(store_err)?;
                    intentions = Some(TreeIntentions {
                        tree_id: tree_id.clone(),
                        by_visit,
                        updated_at: Some(Utc::now()),
                    });
                }
                Err(e) => {
                    // Collective intentions are an enrichment; losing one
                    // round leaves the previous values standing.
                    warn!(tree_id = %tree_id, error = %e, "Tree intentions call failed; keeping previous values");
                    let stored = self
                        .storage
                        .get_tree_intentions(&tree_id)
                        .map_err(store_err)?;
                    if !stored.by_visit.is_empty() {
                        intentions = Some(stored);
                    }
                }
            }
        }

        let tree = build_tree(&tree_id, members).ok_or_else(|| WorkflowError::Store {
            step: "reconcile-tree",
            source: StorageError::NotFound(format!("tree {} has no members", tree_id)),
        })?;
        self.storage
            .set_tree_head(&tree_id, &tree.head.visit.id)
            .map_err(store_err)?;

        Ok((tree, intentions))
    }

    async fn tree_intentions_call(
        &self,
        sequence: &[(String, String, String)],
    ) -> Result<BTreeMap<usize, Vec<String>>, LlmError> {
        let prompt = prompts::tree_intentions_prompt(sequence);
        let raw: BTreeMap<String, Vec<String>> = self
            .complete_structured(&prompt, prompts::TREE_INTENTIONS_SYSTEM_PROMPT)
            .await?;

        let mut by_visit = BTreeMap::new();
        for (key, list) in raw {
            match key.parse::<usize>() {
                Ok(index) if index < sequence.len() => {
                    by_visit.insert(index, list);
                }
                _ => {
                    return Err(LlmError::Schema(format!(
                        "tree intentions key '{}' is not a valid page index",
                        key
                    )))
                }
            }
        }
        Ok(by_visit)
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, LlmError> {
        tokio::time::timeout(
            Duration::from_secs(LLM_TIMEOUT_SECS),
            self.llm
                .complete(prompt, prompts::EXTRACT_SYSTEM_PROMPT, &self.model),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
    }

    async fn complete_structured<T: serde::de::DeserializeOwned>(
        &self,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<T, LlmError> {
        tokio::time::timeout(
            Duration::from_secs(LLM_TIMEOUT_SECS),
            complete_json::<T>(self.llm.as_ref(), prompt, system_prompt, &self.model),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
    }
}

#[async_trait::async_trait]
impl VisitProcessor for ReconciliationWorkflow {
    async fn process(&self, visit: Visit) -> Result<WorkflowOutcome, WorkflowError> {
        self.run(visit).await
    }
}
