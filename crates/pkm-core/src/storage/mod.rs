//! Storage layer
//!
//! Two SQLite-backed stores with different shapes: the relational store
//! (visits, analyses, trees, memory tables) and the vector store (embeddings
//! plus full cleaned content). The markdown index lives in
//! [`crate::tree::MarkdownIndex`] because its format is owned by the tree
//! serialiser.

pub mod migrations;
mod sqlite;
mod vector;

pub use sqlite::{EpisodeStatistics, Result, Storage, StorageError, StoreStats};
pub use vector::{
    cosine_similarity, join_sections, Namespace, VectorHit, VectorRecord, VectorStore,
    SECTION_DELIMITER,
};
