//! # Rulebook Memory
//!
//! Per-project persistent memory for AI coding assistants: free-text records
//! searchable by keyword and by similarity, under a bounded storage budget.
//!
//! ## Architecture
//!
//! - **Record store** - SQLite working copy in memory, snapshotted to
//!   `.rulebook/memory/memory.db`; the only source of truth
//! - **Lexical index** - BM25 over per-project term statistics
//! - **Vector index** - HNSW graph over hashed TF-IDF vectors, persisted to
//!   `.rulebook/memory/vectors.hnsw` and rebuildable from the store
//! - **Hybrid search** - both rankings fused with Reciprocal Rank Fusion
//! - **Eviction** - least recently accessed first; decisions and records of
//!   active sessions are never evicted
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rulebook_memory::{Config, MemoryManager, NewMemory, SearchRequest};
//!
//! let manager = MemoryManager::open(Config::load(".")?).await?;
//!
//! // Save a memory; the type is inferred from the content
//! let saved = manager
//!     .save_memory(NewMemory::new("web", "Login fix", "Fixed token refresh bug"))
//!     .await?;
//!
//! // Compact hits first, full content only for the ids you need
//! let results = manager.search_memories(&SearchRequest::new("token refresh")).await?;
//! let full = manager.get_memory(&[results.hits[0].id]).await?;
//!
//! manager.close().await?;
//! ```

pub mod cache;
pub mod capture;
pub mod classify;
pub mod config;
pub mod embedding;
pub mod error;
pub mod export;
pub mod manager;
pub mod memory;
pub mod privacy;
pub mod retrieval;
pub mod storage;
pub mod tokenize;

pub use cache::CleanupReport;
pub use capture::CaptureHook;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use export::ExportFormat;
pub use manager::{IndexHealth, IndexStatus, MemoryManager, MemoryStats};
pub use memory::{
    CompactMemory, MatchType, MemoryRecord, MemoryType, MemoryUpdate, NewMemory, SearchFilters,
    SearchHit, SearchResults, Session, SessionStatus, TimelineEntry, TimelinePosition,
};
pub use retrieval::{SearchMode, SearchRequest};
