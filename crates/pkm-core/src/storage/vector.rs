//! Vector Store
//!
//! A second SQLite database holding embedding vectors and their payloads,
//! one table per namespace. Similarity search is a linear cosine scan: the
//! row counts here (one entry per kept webpage / episode) stay small enough
//! that determinism wins over an approximate index.
//!
//! This is the only store that holds full cleaned page content.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::sqlite::{Result, StorageError};

/// Literal delimiter joining logical sections inside a record's single
/// content field.
pub const SECTION_DELIMITER: &str = "|||";

// ============================================================================
// NAMESPACES
// ============================================================================

/// The tables of the vector store. Using an enum keeps table names out of
/// caller strings entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Descriptions of the user's own notes (written by external tooling,
    /// read by the tool-protocol server).
    NoteDescriptions,
    /// Cleaned webpage markdown, keyed by visit id.
    WebpageContent,
    /// Episode embeddings, keyed by episode id.
    EpisodicMemory,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::NoteDescriptions => "note_descriptions",
            Namespace::WebpageContent => "webpage_content",
            Namespace::EpisodicMemory => "episodic_memory",
        }
    }

    const ALL: [Namespace; 3] = [
        Namespace::NoteDescriptions,
        Namespace::WebpageContent,
        Namespace::EpisodicMemory,
    ];
}

// ============================================================================
// RECORDS
// ============================================================================

/// One stored row.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub key: String,
    pub vector: Option<Vec<f32>>,
    pub content: String,
    pub payload: serde_json::Value,
}

/// A similarity hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub key: String,
    pub score: f32,
    pub content: String,
    pub payload: serde_json::Value,
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors. Zero for mismatched dimensions or
/// zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Pack a vector as little-endian f32 bytes for BLOB storage.
fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack a BLOB back into a vector. None when the length is not a multiple
/// of four.
fn vector_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let mut vector = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(vector)
}

/// Join logical sections with the store's literal delimiter.
pub fn join_sections(sections: &[&str]) -> String {
    sections.join(SECTION_DELIMITER)
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// Embedding store backed by its own SQLite file inside a dedicated
/// directory. Same reader/writer split as the relational store.
pub struct VectorStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl VectorStore {
    /// Open (or create) the store in the given directory; defaults to
    /// `<data_dir>/vectors/`.
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let dir = match dir {
            Some(d) => d,
            None => {
                let base = crate::storage::Storage::default_path()?;
                base.parent()
                    .map(|p| p.join("vectors"))
                    .ok_or_else(|| StorageError::Init("No parent for data dir".into()))?
            }
        };
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("vectors.db");

        let writer_conn = Connection::open(&path)?;
        writer_conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        for namespace in Namespace::ALL {
            writer_conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    vector BLOB,
                    dimensions INTEGER NOT NULL DEFAULT 0,
                    content TEXT NOT NULL DEFAULT '',
                    payload TEXT NOT NULL DEFAULT '{{}}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
                namespace.as_str()
            ))?;
        }

        let reader_conn = Connection::open(&path)?;
        reader_conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Vector writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Vector reader lock poisoned".into()))
    }

    /// Insert or replace a record by key. `created_at` survives replacement.
    pub fn upsert(
        &self,
        namespace: Namespace,
        key: &str,
        vector: Option<&[f32]>,
        content: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let bytes = vector.map(vector_to_bytes);
        let dimensions = vector.map(|v| v.len() as i64).unwrap_or(0);
        let writer = self.writer()?;
        writer.execute(
            &format!(
                "INSERT INTO {} (key, vector, dimensions, content, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    vector = excluded.vector,
                    dimensions = excluded.dimensions,
                    content = excluded.content,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                namespace.as_str()
            ),
            params![key, bytes, dimensions, content, payload.to_string(), now],
        )?;
        Ok(())
    }

    pub fn get(&self, namespace: Namespace, key: &str) -> Result<Option<VectorRecord>> {
        let reader = self.reader()?;
        let record = reader
            .query_row(
                &format!(
                    "SELECT key, vector, content, payload FROM {} WHERE key = ?1",
                    namespace.as_str()
                ),
                params![key],
                |row| {
                    Ok(VectorRecord {
                        key: row.get(0)?,
                        vector: row
                            .get::<_, Option<Vec<u8>>>(1)?
                            .and_then(|b| vector_from_bytes(&b)),
                        content: row.get(2)?,
                        payload: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn delete(&self, namespace: Namespace, key: &str) -> Result<bool> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            &format!("DELETE FROM {} WHERE key = ?1", namespace.as_str()),
            params![key],
        )?;
        Ok(deleted > 0)
    }

    pub fn count(&self, namespace: Namespace) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            &format!("SELECT COUNT(*) FROM {}", namespace.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Top-`limit` rows by cosine similarity to the query vector. Rows
    /// without a vector are skipped. Ties break by key so results are
    /// stable.
    pub fn search(
        &self,
        namespace: Namespace,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT key, vector, content, payload FROM {} WHERE vector IS NOT NULL",
            namespace.as_str()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut hits: Vec<VectorHit> = Vec::new();
        for row in rows {
            let (key, bytes, content, payload) = row?;
            if let Some(vector) = vector_from_bytes(&bytes) {
                let score = cosine_similarity(query, &vector);
                hits.push(VectorHit {
                    key,
                    score,
                    content,
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

// ============================================================================
// TESTS
// ============================================================================
