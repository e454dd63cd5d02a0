//! SQLite Storage Implementation
//!
//! Relational store for visits, page analyses, navigation trees, procedural
//! rules and episodic memory. Embedding vectors live in the separate
//! [`crate::storage::VectorStore`]; this store only tracks whether a row has
//! one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::memory::{Episode, ProceduralRule, RuleAction, RuleType, UserCorrection};
use crate::model::{domain_of, ContentFeatures, PageAnalysis, PageType, TreeIntentions, Visit};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialisation error on a JSON column
    #[error("Serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// SUPPORT TYPES
// ============================================================================

/// Aggregate counts for the status surface and the CLI.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub visits: i64,
    pub analysed: i64,
    pub trees: i64,
    pub rules: i64,
    pub episodes: i64,
}

/// Episodic-memory statistics, spec'd counts over original vs corrected
/// decisions.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeStatistics {
    pub total: i64,
    pub corrections: i64,
    /// original = accept, corrected = reject
    pub false_positives: i64,
    /// original = reject, corrected = accept
    pub false_negatives: i64,
    pub corrections_by_type: BTreeMap<String, i64>,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Relational store with separate reader/writer connections.
///
/// All methods take `&self`, making Storage `Send + Sync` so the daemon can
/// share it as `Arc<Storage>` between the intake handlers, the queue
/// consumer and the CLI.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Storage {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Default database location under the platform data directory.
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "pkm-assistant", "pkm").ok_or_else(|| {
            StorageError::Init("Could not determine project directories".to_string())
        })?;
        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(data_dir, perms);
        }
        Ok(data_dir.join("pkm.db"))
    }

    /// Create new storage instance
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        let writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))
    }

    // ========================================================================
    // VISITS
    // ========================================================================

    /// Insert a visit row. Returns `true` when the row is new; a resubmission
    /// of the same (url, page_loaded_at) pair is ignored and returns `false`.
    pub fn insert_visit(&self, visit: &Visit) -> Result<bool> {
        let writer = self.writer()?;
        let inserted = writer.execute(
            "INSERT OR IGNORE INTO visits (
                id, url, page_loaded_at, referrer, referrer_timestamp,
                raw_content, tree_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                visit.id,
                visit.url,
                visit.page_loaded_at.to_rfc3339(),
                visit.referrer,
                visit.referrer_timestamp.map(|ts| ts.to_rfc3339()),
                visit.raw_content,
                visit.tree_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_visit(&self, id: &str) -> Result<Option<Visit>> {
        let reader = self.reader()?;
        let visit = reader
            .query_row(
                "SELECT id, url, page_loaded_at, referrer, referrer_timestamp,
                        raw_content, tree_id
                 FROM visits WHERE id = ?1",
                params![id],
                Self::row_to_visit,
            )
            .optional()?;
        Ok(visit)
    }

    /// Repair the referrer of an orphaned visit once its opener is known.
    pub fn update_visit_referrer(
        &self,
        id: &str,
        referrer: &str,
        referrer_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let writer = self.writer()?;
        let updated = writer.execute(
            "UPDATE visits SET referrer = ?1, referrer_timestamp = ?2 WHERE id = ?3",
            params![referrer, referrer_timestamp.map(|ts| ts.to_rfc3339()), id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("visit {}", id)));
        }
        Ok(())
    }

    /// The persisted visit a referrer URL resolves to: most recent load of
    /// that URL at or before the given bound. Ties on timestamp break by
    /// lexicographically larger id so the result is stable.
    pub fn find_visit_by_url_before(
        &self,
        url: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Visit>> {
        let reader = self.reader()?;
        let visit = reader
            .query_row(
                "SELECT id, url, page_loaded_at, referrer, referrer_timestamp,
                        raw_content, tree_id
                 FROM visits
                 WHERE url = ?1 AND page_loaded_at <= ?2
                 ORDER BY page_loaded_at DESC, id DESC
                 LIMIT 1",
                params![url, before.to_rfc3339()],
                Self::row_to_visit,
            )
            .optional()?;
        Ok(visit)
    }

    // ========================================================================
    // PAGE ANALYSES
    // ========================================================================

    /// Persist an analysis, keyed by visit id. Re-running the workflow for
    /// the same visit replaces the row with identical content, so this is
    /// idempotent.
    pub fn upsert_analysis(&self, analysis: &PageAnalysis) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO page_analyses (visit_id, title, summary, intentions, analysed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                analysis.visit_id,
                analysis.title,
                analysis.summary,
                serde_json::to_string(&analysis.intentions)?,
                analysis.analysed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis(&self, visit_id: &str) -> Result<Option<PageAnalysis>> {
        let reader = self.reader()?;
        let analysis = reader
            .query_row(
                "SELECT visit_id, title, summary, intentions, analysed_at
                 FROM page_analyses WHERE visit_id = ?1",
                params![visit_id],
                Self::row_to_analysis,
            )
            .optional()?;
        Ok(analysis)
    }

    // ========================================================================
    // TREES
    // ========================================================================

    pub fn create_tree(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO trees (id, head_visit_id, created_at, updated_at) VALUES (?1, NULL, ?2, ?2)",
            params![id, now],
        )?;
        Ok(id)
    }

    /// Attach a visit to a tree. A visit belongs to at most one tree, so a
    /// re-attach moves it.
    pub fn add_tree_member(&self, tree_id: &str, visit_id: &str) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO tree_members (visit_id, tree_id, added_at) VALUES (?1, ?2, ?3)",
            params![visit_id, tree_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE visits SET tree_id = ?1 WHERE id = ?2",
            params![tree_id, visit_id],
        )?;
        tx.execute(
            "UPDATE trees SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), tree_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn tree_of_visit(&self, visit_id: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let tree_id = reader
            .query_row(
                "SELECT tree_id FROM tree_members WHERE visit_id = ?1",
                params![visit_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tree_id)
    }

    /// Members of a tree in load-time order (ties by id).
    pub fn tree_members(&self, tree_id: &str) -> Result<Vec<Visit>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT v.id, v.url, v.page_loaded_at, v.referrer, v.referrer_timestamp,
                    v.raw_content, v.tree_id
             FROM visits v
             JOIN tree_members tm ON tm.visit_id = v.id
             WHERE tm.tree_id = ?1
             ORDER BY v.page_loaded_at ASC, v.id ASC",
        )?;
        let rows = stmt.query_map(params![tree_id], Self::row_to_visit)?;
        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    /// Members paired with their analyses, in load-time order.
    pub fn tree_members_with_analyses(
        &self,
        tree_id: &str,
    ) -> Result<Vec<(Visit, Option<PageAnalysis>)>> {
        let members = self.tree_members(tree_id)?;
        let mut out = Vec::with_capacity(members.len());
        for visit in members {
            let analysis = self.get_analysis(&visit.id)?;
            out.push((visit, analysis));
        }
        Ok(out)
    }

    pub fn set_tree_head(&self, tree_id: &str, visit_id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE trees SET head_visit_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![visit_id, Utc::now().to_rfc3339(), tree_id],
        )?;
        Ok(())
    }

    pub fn tree_head(&self, tree_id: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let head = reader
            .query_row(
                "SELECT head_visit_id FROM trees WHERE id = ?1",
                params![tree_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(head)
    }

    /// Replace a tree's collective intentions wholesale.
    pub fn replace_tree_intentions(
        &self,
        tree_id: &str,
        by_visit: &BTreeMap<usize, Vec<String>>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "DELETE FROM tree_intentions WHERE tree_id = ?1",
            params![tree_id],
        )?;
        for (index, intentions) in by_visit {
            tx.execute(
                "INSERT INTO tree_intentions (tree_id, visit_index, intentions, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    tree_id,
                    *index as i64,
                    serde_json::to_string(intentions)?,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_tree_intentions(&self, tree_id: &str) -> Result<TreeIntentions> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT visit_index, intentions, updated_at FROM tree_intentions
             WHERE tree_id = ?1 ORDER BY visit_index ASC",
        )?;
        let rows = stmt.query_map(params![tree_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut intentions = TreeIntentions {
            tree_id: tree_id.to_string(),
            ..Default::default()
        };
        for row in rows {
            let (index, json, updated_at) = row?;
            let list: Vec<String> = serde_json::from_str(&json)?;
            intentions.by_visit.insert(index as usize, list);
            intentions.updated_at = Some(parse_ts(&updated_at));
        }
        Ok(intentions)
    }

    /// Decide which tree a visit belongs to.
    ///
    /// 1. If the referrer resolves to a persisted visit, join that visit's
    ///    tree.
    /// 2. Otherwise, join the most recently loaded tree member on the same
    ///    domain within a 30 minute window (ties broken by smaller tree id).
    /// 3. Otherwise, no tree: the caller creates a fresh one.
    pub fn find_tree_for_visit(&self, visit: &Visit) -> Result<Option<String>> {
        if let Some(referrer) = visit.referrer.as_deref() {
            if !referrer.is_empty() && referrer != "about:blank" {
                let bound = visit.referrer_timestamp.unwrap_or(visit.page_loaded_at);
                if let Some(parent) = self.find_visit_by_url_before(referrer, bound)? {
                    if let Some(tree_id) = self.tree_of_visit(&parent.id)? {
                        return Ok(Some(tree_id));
                    }
                }
            }
        }

        // Domain + temporal proximity fallback
        let domain = visit.domain();
        let window_start = (visit.page_loaded_at - Duration::minutes(30)).to_rfc3339();
        let window_end = (visit.page_loaded_at + Duration::minutes(30)).to_rfc3339();

        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT v.url, v.page_loaded_at, tm.tree_id
             FROM visits v
             JOIN tree_members tm ON tm.visit_id = v.id
             WHERE v.page_loaded_at BETWEEN ?1 AND ?2 AND v.id != ?3
             ORDER BY v.page_loaded_at DESC, tm.tree_id ASC",
        )?;
        let rows = stmt.query_map(params![window_start, window_end, visit.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        for row in rows {
            let (url, _loaded_at, tree_id) = row?;
            if domain_of(&url) == domain {
                return Ok(Some(tree_id));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // PROCEDURAL RULES
    // ========================================================================

    pub fn insert_rule(&self, rule: &ProceduralRule) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO procedural_rules (
                id, name, rule_type, condition, action, priority, enabled,
                created_at, updated_at, usage_count, last_used
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.id,
                rule.name,
                rule.rule_type.as_str(),
                serde_json::to_string(&rule.condition)?,
                serde_json::to_string(&rule.action)?,
                rule.priority,
                rule.enabled as i64,
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
                rule.usage_count,
                rule.last_used.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Result<Option<ProceduralRule>> {
        let reader = self.reader()?;
        let rule = reader
            .query_row(
                "SELECT id, name, rule_type, condition, action, priority, enabled,
                        created_at, updated_at, usage_count, last_used
                 FROM procedural_rules WHERE id = ?1",
                params![id],
                Self::row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// All rules, priority descending then created_at ascending - the
    /// evaluation order of the procedural engine.
    pub fn list_rules(&self) -> Result<Vec<ProceduralRule>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, name, rule_type, condition, action, priority, enabled,
                    created_at, updated_at, usage_count, last_used
             FROM procedural_rules
             ORDER BY priority DESC, created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let writer = self.writer()?;
        let updated = writer.execute(
            "UPDATE procedural_rules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    /// Append an audit row and bump the rule's usage counters in one
    /// transaction.
    pub fn record_rule_execution(
        &self,
        rule_id: &str,
        url: &str,
        action_taken: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO rule_execution_history (rule_id, url, action_taken, executed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![rule_id, url, action_taken, now],
        )?;
        tx.execute(
            "UPDATE procedural_rules SET usage_count = usage_count + 1, last_used = ?1 WHERE id = ?2",
            params![now, rule_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn rule_execution_count(&self, rule_id: &str) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM rule_execution_history WHERE rule_id = ?1",
            params![rule_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // EPISODIC MEMORY
    // ========================================================================

    pub fn insert_episode(&self, episode: &Episode) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO episodic_memory (
                id, timestamp, url, domain, page_type, confidence,
                original_decision, reasoning,
                corrected_decision, corrected_type, correction_explanation, corrected_at,
                title, content_sample, word_count, has_code_blocks, link_density,
                meta_description, has_embedding
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                episode.id,
                episode.timestamp.to_rfc3339(),
                episode.url,
                episode.domain,
                episode.page_type.as_str(),
                episode.confidence,
                episode.original_decision as i64,
                episode.reasoning,
                episode.correction.as_ref().map(|c| c.corrected_decision as i64),
                episode
                    .correction
                    .as_ref()
                    .and_then(|c| c.corrected_type.map(|t| t.as_str().to_string())),
                episode.correction.as_ref().map(|c| c.explanation.clone()),
                episode
                    .correction
                    .as_ref()
                    .map(|c| c.corrected_at.to_rfc3339()),
                episode.features.title,
                episode.features.content_sample,
                episode.features.word_count as i64,
                episode.features.has_code_blocks as i64,
                episode.features.link_density,
                episode.features.meta_description,
                episode.has_embedding as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let reader = self.reader()?;
        let episode = reader
            .query_row(
                &format!("{} WHERE id = ?1", EPISODE_SELECT),
                params![id],
                Self::row_to_episode,
            )
            .optional()?;
        Ok(episode)
    }

    /// Attach a user correction. The original decision, confidence and
    /// reasoning columns are untouched; only the `corrected_*` siblings are
    /// written.
    pub fn apply_user_correction(&self, id: &str, correction: &UserCorrection) -> Result<()> {
        let writer = self.writer()?;
        let updated = writer.execute(
            "UPDATE episodic_memory SET
                corrected_decision = ?1,
                corrected_type = ?2,
                correction_explanation = ?3,
                corrected_at = ?4
             WHERE id = ?5",
            params![
                correction.corrected_decision as i64,
                correction.corrected_type.map(|t| t.as_str().to_string()),
                correction.explanation,
                correction.corrected_at.to_rfc3339(),
                id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("episode {}", id)));
        }
        Ok(())
    }

    /// Recent episodes for a domain, newest first, bounded.
    pub fn episodes_by_domain(&self, domain: &str, limit: usize) -> Result<Vec<Episode>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "{} WHERE domain = ?1 ORDER BY timestamp DESC LIMIT ?2",
            EPISODE_SELECT
        ))?;
        let rows = stmt.query_map(params![domain, limit as i64], Self::row_to_episode)?;
        let mut episodes = Vec::new();
        for row in rows {
            episodes.push(row?);
        }
        Ok(episodes)
    }

    pub fn episodes_by_ids(&self, ids: &[String]) -> Result<Vec<Episode>> {
        let mut episodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(episode) = self.get_episode(id)? {
                episodes.push(episode);
            }
        }
        Ok(episodes)
    }

    pub fn mark_episode_embedded(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE episodic_memory SET has_embedding = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn episode_statistics(&self) -> Result<EpisodeStatistics> {
        let reader = self.reader()?;

        let total: i64 =
            reader.query_row("SELECT COUNT(*) FROM episodic_memory", [], |row| row.get(0))?;
        let corrections: i64 = reader.query_row(
            "SELECT COUNT(*) FROM episodic_memory WHERE corrected_decision IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let false_positives: i64 = reader.query_row(
            "SELECT COUNT(*) FROM episodic_memory
             WHERE original_decision = 1 AND corrected_decision = 0",
            [],
            |row| row.get(0),
        )?;
        let false_negatives: i64 = reader.query_row(
            "SELECT COUNT(*) FROM episodic_memory
             WHERE original_decision = 0 AND corrected_decision = 1",
            [],
            |row| row.get(0),
        )?;

        let mut corrections_by_type = BTreeMap::new();
        let mut stmt = reader.prepare(
            "SELECT corrected_type, COUNT(*) FROM episodic_memory
             WHERE corrected_type IS NOT NULL GROUP BY corrected_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (page_type, count) = row?;
            corrections_by_type.insert(page_type, count);
        }

        Ok(EpisodeStatistics {
            total,
            corrections,
            false_positives,
            false_negatives,
            corrections_by_type,
        })
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let reader = self.reader()?;
        let visits: i64 = reader.query_row("SELECT COUNT(*) FROM visits", [], |row| row.get(0))?;
        let analysed: i64 =
            reader.query_row("SELECT COUNT(*) FROM page_analyses", [], |row| row.get(0))?;
        let trees: i64 = reader.query_row("SELECT COUNT(*) FROM trees", [], |row| row.get(0))?;
        let rules: i64 =
            reader.query_row("SELECT COUNT(*) FROM procedural_rules", [], |row| row.get(0))?;
        let episodes: i64 =
            reader.query_row("SELECT COUNT(*) FROM episodic_memory", [], |row| row.get(0))?;
        Ok(StoreStats {
            visits,
            analysed,
            trees,
            rules,
            episodes,
        })
    }

    // ========================================================================
    // ROW MAPPERS
    // ========================================================================

    fn row_to_visit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Visit> {
        Ok(Visit {
            id: row.get(0)?,
            url: row.get(1)?,
            page_loaded_at: parse_ts(&row.get::<_, String>(2)?),
            referrer: row.get(3)?,
            referrer_timestamp: row
                .get::<_, Option<String>>(4)?
                .map(|s| parse_ts(&s)),
            opener_tab_id: None,
            raw_content: row.get(5)?,
            tree_id: row.get(6)?,
        })
    }

    fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<PageAnalysis> {
        let intentions: String = row.get(3)?;
        Ok(PageAnalysis {
            visit_id: row.get(0)?,
            title: row.get(1)?,
            summary: row.get(2)?,
            intentions: serde_json::from_str(&intentions).unwrap_or_default(),
            analysed_at: parse_ts(&row.get::<_, String>(4)?),
        })
    }

    fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProceduralRule> {
        let condition: String = row.get(3)?;
        let action: String = row.get(4)?;
        Ok(ProceduralRule {
            id: row.get(0)?,
            name: row.get(1)?,
            rule_type: RuleType::parse_name(&row.get::<_, String>(2)?),
            condition: serde_json::from_str(&condition).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            action: serde_json::from_str::<RuleAction>(&action).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            priority: row.get(5)?,
            enabled: row.get::<_, i64>(6)? != 0,
            created_at: parse_ts(&row.get::<_, String>(7)?),
            updated_at: parse_ts(&row.get::<_, String>(8)?),
            usage_count: row.get(9)?,
            last_used: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
        let corrected_decision: Option<i64> = row.get(8)?;
        let correction = corrected_decision.map(|decision| UserCorrection {
            corrected_decision: decision != 0,
            corrected_type: row
                .get::<_, Option<String>>(9)
                .ok()
                .flatten()
                .map(|s| PageType::parse_name(&s)),
            explanation: row
                .get::<_, Option<String>>(10)
                .ok()
                .flatten()
                .unwrap_or_default(),
            corrected_at: row
                .get::<_, Option<String>>(11)
                .ok()
                .flatten()
                .map(|s| parse_ts(&s))
                .unwrap_or_else(Utc::now),
        });

        Ok(Episode {
            id: row.get(0)?,
            timestamp: parse_ts(&row.get::<_, String>(1)?),
            url: row.get(2)?,
            domain: row.get(3)?,
            page_type: PageType::parse_name(&row.get::<_, String>(4)?),
            confidence: row.get(5)?,
            original_decision: row.get::<_, i64>(6)? != 0,
            reasoning: row.get(7)?,
            correction,
            features: ContentFeatures {
                title: row.get(12)?,
                content_sample: row.get(13)?,
                word_count: row.get::<_, i64>(14)? as usize,
                has_code_blocks: row.get::<_, i64>(15)? != 0,
                link_density: row.get(16)?,
                meta_description: row.get(17)?,
            },
            has_embedding: row.get::<_, i64>(18)? != 0,
        })
    }
}

const EPISODE_SELECT: &str = "SELECT id, timestamp, url, domain, page_type, confidence,
        original_decision, reasoning,
        corrected_decision, corrected_type, correction_explanation, corrected_at,
        title, content_sample, word_count, has_code_blocks, link_density,
        meta_description, has_embedding
 FROM episodic_memory";

/// Parse an RFC 3339 timestamp, falling back to now on malformed rows.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Condition, Comparator};
    use tempfile::tempdir;

    fn create_test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        (Storage::new(Some(db_path)).unwrap(), dir)
    }

    fn test_visit(url: &str, loaded_at: &str) -> Visit {
        Visit::new(
            url,
            loaded_at,
            parse_ts(loaded_at),
            "<html><body>content</body></html>",
        )
    }

    #[test]
    fn test_insert_visit_is_idempotent() {
        let (storage, _dir) = create_test_storage();
        let visit = test_visit("https://docs.example.com/intro", "2024-01-15T10:00:00Z");

        assert!(storage.insert_visit(&visit).unwrap());
        assert!(!storage.insert_visit(&visit).unwrap());

        let stats = storage.stats().unwrap();
        assert_eq!(stats.visits, 1);
    }

    #[test]
    fn test_update_visit_referrer() {
        let (storage, _dir) = create_test_storage();
        let visit = test_visit("https://child.example.com", "2024-01-15T10:00:05Z");
        storage.insert_visit(&visit).unwrap();

        let ts = parse_ts("2024-01-15T10:00:00Z");
        storage
            .update_visit_referrer(&visit.id, "https://parent.example.com", Some(ts))
            .unwrap();

        let stored = storage.get_visit(&visit.id).unwrap().unwrap();
        assert_eq!(stored.referrer.as_deref(), Some("https://parent.example.com"));
        assert_eq!(stored.referrer_timestamp, Some(ts));
    }

    #[test]
    fn test_analysis_upsert_is_idempotent() {
        let (storage, _dir) = create_test_storage();
        let visit = test_visit("https://docs.example.com/intro", "2024-01-15T10:00:00Z");
        storage.insert_visit(&visit).unwrap();

        let analysis = PageAnalysis {
            visit_id: visit.id.clone(),
            title: "Intro".to_string(),
            summary: "An introduction.".to_string(),
            intentions: vec!["learn the basics".to_string()],
            analysed_at: Utc::now(),
        };
        storage.upsert_analysis(&analysis).unwrap();
        storage.upsert_analysis(&analysis).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.analysed, 1);

        let stored = storage.get_analysis(&visit.id).unwrap().unwrap();
        assert_eq!(stored.title, "Intro");
        assert_eq!(stored.intentions, vec!["learn the basics".to_string()]);
    }

    #[test]
    fn test_tree_membership_moves_visit() {
        let (storage, _dir) = create_test_storage();
        let visit = test_visit("https://a.example.com", "2024-01-15T10:00:00Z");
        storage.insert_visit(&visit).unwrap();

        let tree_a = storage.create_tree().unwrap();
        let tree_b = storage.create_tree().unwrap();

        storage.add_tree_member(&tree_a, &visit.id).unwrap();
        assert_eq!(storage.tree_of_visit(&visit.id).unwrap(), Some(tree_a));

        storage.add_tree_member(&tree_b, &visit.id).unwrap();
        assert_eq!(
            storage.tree_of_visit(&visit.id).unwrap(),
            Some(tree_b.clone())
        );
        assert_eq!(storage.tree_members(&tree_b).unwrap().len(), 1);
    }

    #[test]
    fn test_find_tree_by_referrer() {
        let (storage, _dir) = create_test_storage();
        let parent = test_visit("https://parent.example.com", "2024-01-15T10:00:00Z");
        storage.insert_visit(&parent).unwrap();
        let tree = storage.create_tree().unwrap();
        storage.add_tree_member(&tree, &parent.id).unwrap();

        let mut child = test_visit("https://child.example.com/page", "2024-01-15T10:00:10Z");
        child.referrer = Some("https://parent.example.com".to_string());
        child.referrer_timestamp = Some(parse_ts("2024-01-15T10:00:00Z"));

        assert_eq!(storage.find_tree_for_visit(&child).unwrap(), Some(tree));
    }

    #[test]
    fn test_find_tree_by_domain_proximity() {
        let (storage, _dir) = create_test_storage();
        let first = test_visit("https://docs.example.com/a", "2024-01-15T10:00:00Z");
        storage.insert_visit(&first).unwrap();
        let tree = storage.create_tree().unwrap();
        storage.add_tree_member(&tree, &first.id).unwrap();

        // Same domain, 10 minutes later, no referrer
        let near = test_visit("https://docs.example.com/b", "2024-01-15T10:10:00Z");
        storage.insert_visit(&near).unwrap();
        assert_eq!(storage.find_tree_for_visit(&near).unwrap(), Some(tree));

        // Same domain but outside the 30 minute window
        let far = test_visit("https://docs.example.com/c", "2024-01-15T11:00:00Z");
        storage.insert_visit(&far).unwrap();
        assert_eq!(storage.find_tree_for_visit(&far).unwrap(), None);

        // Different domain inside the window
        let other = test_visit("https://unrelated.example.org", "2024-01-15T10:05:00Z");
        storage.insert_visit(&other).unwrap();
        assert_eq!(storage.find_tree_for_visit(&other).unwrap(), None);
    }

    #[test]
    fn test_tree_intentions_replace() {
        let (storage, _dir) = create_test_storage();
        let tree = storage.create_tree().unwrap();

        let mut first = BTreeMap::new();
        first.insert(0, vec!["learn rust".to_string()]);
        storage.replace_tree_intentions(&tree, &first).unwrap();

        let mut second = BTreeMap::new();
        second.insert(0, vec!["compare frameworks".to_string()]);
        second.insert(1, vec!["evaluate tokio".to_string()]);
        storage.replace_tree_intentions(&tree, &second).unwrap();

        let stored = storage.get_tree_intentions(&tree).unwrap();
        assert_eq!(stored.by_visit.len(), 2);
        assert_eq!(
            stored.by_visit.get(&0).unwrap(),
            &vec!["compare frameworks".to_string()]
        );
    }

    #[test]
    fn test_rule_roundtrip_and_audit() {
        let (storage, _dir) = create_test_storage();
        let rule = ProceduralRule::new(
            "block facebook",
            RuleType::Domain,
            Condition::leaf("url", Comparator::Contains, "facebook.com"),
            RuleAction::Reject,
            100,
        );
        storage.insert_rule(&rule).unwrap();

        let stored = storage.get_rule(&rule.id).unwrap().unwrap();
        assert_eq!(stored.name, "block facebook");
        assert_eq!(stored.usage_count, 0);

        storage
            .record_rule_execution(&rule.id, "https://facebook.com/x", "reject")
            .unwrap();
        let stored = storage.get_rule(&rule.id).unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
        assert!(stored.last_used.is_some());
        assert_eq!(storage.rule_execution_count(&rule.id).unwrap(), 1);
    }

    #[test]
    fn test_correction_never_overwrites_original() {
        let (storage, _dir) = create_test_storage();
        let episode = Episode::new(
            "https://python-news.example/post",
            PageType::Knowledge,
            0.9,
            true,
            "looks like documentation",
            ContentFeatures::default(),
        );
        storage.insert_episode(&episode).unwrap();

        storage
            .apply_user_correction(
                &episode.id,
                &UserCorrection {
                    corrected_decision: false,
                    corrected_type: Some(PageType::Aggregator),
                    explanation: "news feed, not docs".to_string(),
                    corrected_at: Utc::now(),
                },
            )
            .unwrap();

        let stored = storage.get_episode(&episode.id).unwrap().unwrap();
        assert!(stored.original_decision);
        assert_eq!(stored.confidence, 0.9);
        assert_eq!(stored.reasoning, "looks like documentation");
        let correction = stored.correction.unwrap();
        assert!(!correction.corrected_decision);
        assert_eq!(correction.corrected_type, Some(PageType::Aggregator));
    }

    #[test]
    fn test_episode_statistics() {
        let (storage, _dir) = create_test_storage();

        // accepted, then corrected to reject => false positive
        let fp = Episode::new(
            "https://a.example.com",
            PageType::Knowledge,
            0.8,
            true,
            "r1",
            ContentFeatures::default(),
        );
        storage.insert_episode(&fp).unwrap();
        storage
            .apply_user_correction(
                &fp.id,
                &UserCorrection {
                    corrected_decision: false,
                    corrected_type: Some(PageType::Leisure),
                    explanation: String::new(),
                    corrected_at: Utc::now(),
                },
            )
            .unwrap();

        // rejected, then corrected to accept => false negative
        let fn_ = Episode::new(
            "https://b.example.com",
            PageType::Other,
            0.4,
            false,
            "r2",
            ContentFeatures::default(),
        );
        storage.insert_episode(&fn_).unwrap();
        storage
            .apply_user_correction(
                &fn_.id,
                &UserCorrection {
                    corrected_decision: true,
                    corrected_type: Some(PageType::Knowledge),
                    explanation: String::new(),
                    corrected_at: Utc::now(),
                },
            )
            .unwrap();

        // uncorrected
        let plain = Episode::new(
            "https://c.example.com",
            PageType::Knowledge,
            0.9,
            true,
            "r3",
            ContentFeatures::default(),
        );
        storage.insert_episode(&plain).unwrap();

        let stats = storage.episode_statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.corrections, 2);
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.false_negatives, 1);
        assert_eq!(stats.corrections_by_type.get("knowledge"), Some(&1));
        assert_eq!(stats.corrections_by_type.get("leisure"), Some(&1));
    }

    #[test]
    fn test_episodes_by_domain_recency_order() {
        let (storage, _dir) = create_test_storage();
        for (i, hour) in [("a", 10), ("b", 11), ("c", 12)] {
            let mut episode = Episode::new(
                format!("https://docs.example.com/{}", i),
                PageType::Knowledge,
                0.8,
                true,
                "r",
                ContentFeatures::default(),
            );
            episode.timestamp = parse_ts(&format!("2024-01-15T{:02}:00:00Z", hour));
            storage.insert_episode(&episode).unwrap();
        }

        let episodes = storage.episodes_by_domain("docs.example.com", 2).unwrap();
        assert_eq!(episodes.len(), 2);
        assert!(episodes[0].timestamp > episodes[1].timestamp);
    }
}
