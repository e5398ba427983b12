//! Storage backends for rulebook-memory

pub mod lexical;
mod sqlite;
pub mod vector;

pub use lexical::{DocumentMeta, LexicalIndex, Weights};
pub use sqlite::{
    EvictionCandidate, FlushState, RecordStore, RECORD_OVERHEAD_BYTES, SESSION_OVERHEAD_BYTES,
};
pub use vector::HnswIndex;
