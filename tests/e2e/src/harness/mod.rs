//! Full-stack pipeline harness over temporary stores.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Mutex;

use pkm_core::{
    EnhancedFilter, EpisodicMemory, FilterConfig, LlmClient, MarkdownIndex, OrphanManager,
    ProceduralMemory, ReconciliationWorkflow, Storage, TabTracker, VectorStore, Visit,
    VisitProcessor, WorkflowError, WorkflowOutcome,
};

use crate::mocks::MockLlm;

/// Everything the pipeline needs, wired against a throwaway directory.
pub struct Pipeline {
    pub llm: Arc<MockLlm>,
    pub storage: Arc<Storage>,
    pub vectors: Arc<VectorStore>,
    pub episodic: Arc<EpisodicMemory>,
    pub procedural: Arc<ProceduralMemory>,
    pub filter: Arc<EnhancedFilter>,
    pub workflow: Arc<ReconciliationWorkflow>,
    pub tracker: Arc<Mutex<TabTracker>>,
    pub orphans: Arc<Mutex<OrphanManager>>,
    pub markdown_path: PathBuf,
    _dir: TempDir,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_filter_config(FilterConfig::default())
    }

    pub fn with_filter_config(filter_config: FilterConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(MockLlm::new());
        let llm_dyn: Arc<dyn LlmClient> = llm.clone();

        let storage =
            Arc::new(Storage::new(Some(dir.path().join("pkm.db"))).expect("relational store"));
        let vectors =
            Arc::new(VectorStore::new(Some(dir.path().join("vectors"))).expect("vector store"));
        let episodic = Arc::new(EpisodicMemory::new(
            storage.clone(),
            vectors.clone(),
            llm_dyn.clone(),
        ));
        let procedural =
            Arc::new(ProceduralMemory::new(storage.clone()).expect("procedural memory"));
        let filter = Arc::new(EnhancedFilter::new(
            llm_dyn.clone(),
            episodic.clone(),
            procedural.clone(),
            filter_config,
            "mock-model",
        ));

        let markdown_path = dir.path().join("knowledge.md");
        let workflow = Arc::new(ReconciliationWorkflow::new(
            llm_dyn,
            filter.clone(),
            storage.clone(),
            vectors.clone(),
            MarkdownIndex::new(markdown_path.clone()),
            "mock-model",
        ));

        Self {
            llm,
            storage,
            vectors,
            episodic,
            procedural,
            filter,
            workflow,
            tracker: Arc::new(Mutex::new(TabTracker::new())),
            orphans: Arc::new(Mutex::new(OrphanManager::new())),
            markdown_path,
            _dir: dir,
        }
    }

    /// Intake-then-analyse, the way the daemon drives it: persist the raw
    /// visit, then run the workflow.
    pub async fn submit(&self, visit: Visit) -> Result<WorkflowOutcome, WorkflowError> {
        self.storage.insert_visit(&visit).expect("insert visit");
        self.workflow.process(visit).await
    }

    pub fn markdown(&self) -> String {
        std::fs::read_to_string(&self.markdown_path).unwrap_or_default()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("test timestamp")
        .with_timezone(&Utc)
}

/// A visit as intake would construct it.
pub fn visit(url: &str, loaded_at: &str, html: &str) -> Visit {
    Visit::new(url, loaded_at, ts(loaded_at), html)
}

/// A visit with its referrer already resolved.
pub fn visit_with_referrer(
    url: &str,
    loaded_at: &str,
    html: &str,
    referrer: &str,
    referrer_at: &str,
) -> Visit {
    let mut v = visit(url, loaded_at, html);
    v.referrer = Some(referrer.to_string());
    v.referrer_timestamp = Some(ts(referrer_at));
    v
}
