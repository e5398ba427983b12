//! Configuration for rulebook-memory

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tokenize::DEFAULT_STOP_WORDS;

/// Directory (relative to the project root) holding Rulebook metadata
pub const RULEBOOK_DIR: &str = ".rulebook";

/// HNSW graph parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HnswConfig {
    /// Max neighbors per node on upper layers (layer 0 allows 2 * m)
    pub m: usize,

    /// Beam width used while inserting
    pub ef_construction: usize,

    /// Default beam width used while searching
    pub ef_search: usize,

    /// Seed for the layer assignment RNG
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            seed: 0x5eed_cafe,
        }
    }
}

/// BM25 ranking constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Config {
    /// Term frequency saturation
    pub k1: f32,

    /// Length normalization strength (0 disables it)
    pub b: f32,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Whether memory is enabled at all
    pub enabled: bool,

    /// Directory holding the record store snapshot and the vector index blob
    pub data_dir: PathBuf,

    /// Length of the vectors produced by the vectorizer
    pub vector_dimensions: usize,

    pub hnsw: HnswConfig,

    pub bm25: Bm25Config,

    /// Reciprocal rank fusion smoothing constant
    pub rrf_k: f32,

    /// Each ranking in hybrid mode fetches `limit * candidate_pool_factor` candidates
    pub candidate_pool_factor: usize,

    /// Storage budget (record store + vector index), in bytes
    pub max_size_bytes: u64,

    /// Eviction stops once usage drops to this fraction of `max_size_bytes`
    pub eviction_target_ratio: f64,

    /// Records deleted per eviction batch
    pub eviction_batch_size: usize,

    /// Snapshot the store to disk after this many writes
    pub flush_every: usize,

    /// Words ignored by the tokenizer
    pub stop_words: Vec<String>,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from(RULEBOOK_DIR).join("memory"),
            vector_dimensions: 256,
            hnsw: HnswConfig::default(),
            bm25: Bm25Config::default(),
            rrf_k: 60.0,
            candidate_pool_factor: 3,
            max_size_bytes: 500 * 1024 * 1024,
            eviction_target_ratio: 0.85,
            eviction_batch_size: 100,
            flush_every: 10,
            stop_words: DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
            server_port: 8420,
        }
    }
}

/// Shape of `.rulebook/config.json`; only the `memory` section is read here
#[derive(Debug, Deserialize)]
struct RulebookFile {
    #[serde(default)]
    memory: Option<Config>,
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Default config with the store placed under `<root>/.rulebook/memory`
    pub fn for_project(root: impl AsRef<Path>) -> Self {
        Self::with_data_dir(root.as_ref().join(RULEBOOK_DIR).join("memory"))
    }

    /// Load the `memory` section of `<root>/.rulebook/config.json`.
    ///
    /// Memory is opt-in: a missing file or section yields a disabled config.
    /// A relative `dataDir` is resolved against the project root.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let path = Self::config_file_path(root);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: RulebookFile = serde_json::from_str(&raw)
                .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
            match file.memory {
                Some(mut config) => {
                    if config.data_dir.is_relative() {
                        config.data_dir = root.join(&config.data_dir);
                    }
                    config
                }
                None => Self::disabled(root),
            }
        } else {
            Self::disabled(root)
        };

        if config.stop_words.is_empty() {
            config.stop_words = Config::default().stop_words;
        }
        config.validate()?;
        Ok(config)
    }

    fn disabled(root: &Path) -> Self {
        Self {
            enabled: false,
            ..Self::for_project(root)
        }
    }

    /// Path of the project's Rulebook config file
    pub fn config_file_path(root: &Path) -> PathBuf {
        root.join(RULEBOOK_DIR).join("config.json")
    }

    /// Get the path to the record store snapshot
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Get the path to the vector index blob
    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir.join("vectors.hnsw")
    }

    /// Eviction target in bytes
    pub fn eviction_target_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.eviction_target_ratio).floor() as u64
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.vector_dimensions == 0 {
            return Err(Error::config("vectorDimensions must be greater than 0"));
        }
        if self.hnsw.m < 2 {
            return Err(Error::config("hnsw.m must be at least 2"));
        }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search == 0 {
            return Err(Error::config("hnsw ef values must be greater than 0"));
        }
        if !(self.rrf_k > 0.0) {
            return Err(Error::config("rrfK must be positive"));
        }
        if self.candidate_pool_factor == 0 {
            return Err(Error::config("candidatePoolFactor must be greater than 0"));
        }
        if !(self.eviction_target_ratio > 0.0 && self.eviction_target_ratio <= 1.0) {
            return Err(Error::config("evictionTargetRatio must be in (0, 1]"));
        }
        if self.eviction_batch_size == 0 {
            return Err(Error::config("evictionBatchSize must be greater than 0"));
        }
        if self.flush_every == 0 {
            return Err(Error::config("flushEvery must be greater than 0"));
        }
        if self.bm25.k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25.b) {
            return Err(Error::config("bm25.k1 must be >= 0 and bm25.b in [0, 1]"));
        }
        Ok(())
    }
}
