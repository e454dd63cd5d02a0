//! # PKM Core
//!
//! Ingestion and organisation pipeline of the PKM assistant: a browser
//! companion observes page visits and forwards them here, where they are
//! classified, analysed, deduplicated and persistently indexed so semantic
//! queries can retrieve them later.
//!
//! The moving parts, in data-flow order:
//!
//! - **Tab History Tracker**: reconstructs the true referrer across
//!   asynchronous browser events (tab open, URL change, SPA navigation)
//! - **Orphan Manager**: holds visits whose opener tab has not been seen
//!   yet, with bounded retries and a 60 s TTL
//! - **Visit Queue**: single-consumer FIFO with batching; exactly one
//!   workflow execution per visit, in enqueue order
//! - **Classifier / Enhanced Filter**: LLM verdict combined with episodic
//!   memory (past decisions and user corrections) and procedural memory
//!   (user-defined rules)
//! - **Reconciliation Workflow**: filter, extract, analyse, persist, group
//!   into navigation trees, rewrite collective intentions
//! - **Stores**: relational SQLite store, vector store, and an append-only
//!   markdown index with idempotent head-match rewrites
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pkm_core::{Config, Storage, VectorStore};
//!
//! let config = Config::load(None)?;
//! let storage = Storage::new(None)?;
//! let vectors = VectorStore::new(None)?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod filter;
pub mod llm;
pub mod memory;
pub mod model;
pub mod orphan;
pub mod queue;
pub mod storage;
pub mod tracker;
pub mod tree;
pub mod workflow;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Configuration
pub use config::{
    Config, ConfigError, FilterConfig, IntakeConfig, LlmConfig, LlmProvider, PathsConfig,
    QueueConfig, HOME_DIR_NAME,
};

// Domain model
pub use model::{
    domain_of, Classification, ContentFeatures, EnhancedClassification, PageAnalysis, PageType,
    TreeIntentions, Visit, VisitId,
};

// Stores
pub use storage::{
    cosine_similarity, join_sections, EpisodeStatistics, Namespace, Storage, StorageError,
    StoreStats, VectorHit, VectorRecord, VectorStore, SECTION_DELIMITER,
};

// Tab tracking and orphan handling
pub use orphan::{Orphan, OrphanManager, OrphanStats, MAX_RETRIES, ORPHAN_TTL_SECS};
pub use tracker::{TabHistory, TabTracker};

// Queue
pub use queue::{QueueError, VisitQueue};

// Trees and the markdown index
pub use tree::{build_tree, render_tree, MarkdownIndex, NavigationTree, TreeNode};

// LLM capability
pub use llm::{
    client_from_config, complete_json, LlmClient, LlmError, OllamaClient, OpenAiCompatClient,
    LLM_TIMEOUT_SECS,
};

// Memory subsystems
pub use memory::{
    Comparator, Condition, Episode, EpisodicMemory, EpisodicSignal, ProceduralMemory,
    ProceduralRule, RuleAction, RuleError, RuleMatch, RuleType, UserCorrection,
};

// Filter and workflow
pub use filter::{EnhancedFilter, FilterError, FilterMetrics, FilterMetricsSnapshot};
pub use workflow::{ReconciliationWorkflow, VisitProcessor, WorkflowError, WorkflowOutcome};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
