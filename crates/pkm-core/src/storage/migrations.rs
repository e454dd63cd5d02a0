//! Database Migrations
//!
//! Schema migration definitions for the relational store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: visits, analyses, navigation trees",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Procedural memory: rules and execution audit",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Episodic memory with user corrections",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: visits, page analyses, trees
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS visits (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    page_loaded_at TEXT NOT NULL,
    referrer TEXT,
    referrer_timestamp TEXT,
    raw_content TEXT NOT NULL,
    tree_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(url, page_loaded_at)
);

CREATE INDEX IF NOT EXISTS idx_visits_url ON visits(url);
CREATE INDEX IF NOT EXISTS idx_visits_loaded ON visits(page_loaded_at);
CREATE INDEX IF NOT EXISTS idx_visits_tree ON visits(tree_id);

CREATE TABLE IF NOT EXISTS page_analyses (
    visit_id TEXT PRIMARY KEY REFERENCES visits(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    intentions TEXT NOT NULL DEFAULT '[]',
    analysed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trees (
    id TEXT PRIMARY KEY,
    head_visit_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tree_members (
    visit_id TEXT PRIMARY KEY REFERENCES visits(id) ON DELETE CASCADE,
    tree_id TEXT NOT NULL REFERENCES trees(id) ON DELETE CASCADE,
    added_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tree_members_tree ON tree_members(tree_id);

CREATE TABLE IF NOT EXISTS tree_intentions (
    tree_id TEXT NOT NULL REFERENCES trees(id) ON DELETE CASCADE,
    visit_index INTEGER NOT NULL,
    intentions TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tree_id, visit_index)
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: procedural rules
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS procedural_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    condition TEXT NOT NULL,
    action TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used TEXT
);

CREATE INDEX IF NOT EXISTS idx_rules_priority ON procedural_rules(priority);

CREATE TABLE IF NOT EXISTS rule_execution_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id TEXT NOT NULL REFERENCES procedural_rules(id) ON DELETE CASCADE,
    url TEXT,
    action_taken TEXT NOT NULL,
    executed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rule_history_rule ON rule_execution_history(rule_id);
"#;

/// V3: episodic memory
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS episodic_memory (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    page_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    original_decision INTEGER NOT NULL,
    reasoning TEXT NOT NULL,

    -- User correction, stored alongside the original, never overwriting it
    corrected_decision INTEGER,
    corrected_type TEXT,
    correction_explanation TEXT,
    corrected_at TEXT,

    -- Content features captured at classification time
    title TEXT NOT NULL DEFAULT '',
    content_sample TEXT NOT NULL DEFAULT '',
    word_count INTEGER NOT NULL DEFAULT 0,
    has_code_blocks INTEGER NOT NULL DEFAULT 0,
    link_density REAL NOT NULL DEFAULT 0.0,
    meta_description TEXT NOT NULL DEFAULT '',

    -- Embedding metadata (the vector itself lives in the vector store)
    has_embedding INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_episodes_domain ON episodic_memory(domain);
CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodic_memory(timestamp);
"#;

/// Apply pending migrations to a connection.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "Applying migration"
            );
            conn.execute_batch(migration.up)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
