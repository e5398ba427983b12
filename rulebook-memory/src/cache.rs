//! Storage budget enforcement (least-recently-accessed eviction)

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{HnswIndex, LexicalIndex, RecordStore};

/// Logical storage usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    /// Records and sessions in the record store
    pub store_bytes: u64,
    /// Vector index footprint
    pub vector_bytes: u64,
    pub max_bytes: u64,
}

impl StorageUsage {
    pub fn measure(store: &RecordStore, vectors: &HnswIndex, max_bytes: u64) -> Result<Self> {
        Ok(Self {
            store_bytes: store.data_bytes()?,
            vector_bytes: vectors.size_bytes(),
            max_bytes,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.store_bytes + self.vector_bytes
    }

    pub fn usage_percent(&self) -> f64 {
        if self.max_bytes == 0 {
            return 100.0;
        }
        self.total_bytes() as f64 / self.max_bytes as f64 * 100.0
    }

    pub fn exceeds_max(&self) -> bool {
        self.total_bytes() > self.max_bytes
    }
}

/// Outcome of a cleanup run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub evicted_count: usize,
    pub freed_bytes: u64,
    pub usage_before: u64,
    pub usage_after: u64,
    pub target_bytes: u64,
}

/// Deletes unprotected records, least recently accessed first, until usage
/// is back under the target
#[derive(Debug, Clone)]
pub struct EvictionManager {
    max_bytes: u64,
    target_bytes: u64,
    batch_size: usize,
}

impl EvictionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            max_bytes: config.max_size_bytes,
            target_bytes: config.eviction_target_bytes(),
            batch_size: config.eviction_batch_size.max(1),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    /// Evict down to the target. Without `force` nothing happens unless usage
    /// exceeds the maximum.
    ///
    /// Records are deleted from the store first, then from both indexes.
    /// Eviction stops as soon as usage is at or below the target, even in the
    /// middle of a batch. Fails with [`Error::CannotReclaim`] when usage is
    /// still above the maximum and only protected records remain.
    pub fn run(
        &self,
        store: &RecordStore,
        lexical: &mut LexicalIndex,
        vectors: &mut HnswIndex,
        force: bool,
    ) -> Result<CleanupReport> {
        let usage = StorageUsage::measure(store, vectors, self.max_bytes)?;
        let before = usage.total_bytes();
        let mut report = CleanupReport {
            usage_before: before,
            usage_after: before,
            target_bytes: self.target_bytes,
            ..Default::default()
        };

        if !force && !usage.exceeds_max() {
            debug!(usage = before, max = self.max_bytes, "Usage within budget, no eviction");
            return Ok(report);
        }

        let mut current = before;
        while current > self.target_bytes {
            let candidates = store.eviction_candidates(self.batch_size)?;
            if candidates.is_empty() {
                break;
            }

            // Only as much of the batch as it takes to reach the target
            let mut projected = current;
            let mut batch: Vec<Uuid> = Vec::new();
            for candidate in &candidates {
                if projected <= self.target_bytes {
                    break;
                }
                let vector_bytes = vectors.entry_bytes(&candidate.id).unwrap_or(0);
                projected = projected.saturating_sub(candidate.bytes + vector_bytes);
                batch.push(candidate.id);
            }

            let deleted = match store.delete_memories(&batch) {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "Eviction batch failed, retrying once");
                    store.delete_memories(&batch)?
                }
            };

            for id in &batch {
                lexical.remove(id);
                vectors.remove(id);
            }

            report.evicted_count += deleted;
            let after = StorageUsage::measure(store, vectors, self.max_bytes)?.total_bytes();
            debug!(deleted, usage = after, "Evicted batch");
            current = after;
        }

        if report.evicted_count > 0 {
            store.vacuum()?;
            lexical.shrink_to_fit();
        }

        report.usage_after = current;
        report.freed_bytes = before.saturating_sub(current);

        if current > self.max_bytes {
            warn!(
                usage = current,
                max = self.max_bytes,
                evicted = report.evicted_count,
                "Storage over budget and only protected records remain"
            );
            return Err(Error::CannotReclaim {
                evicted: report.evicted_count,
                freed_bytes: report.freed_bytes,
                usage_bytes: current,
                max_bytes: self.max_bytes,
            });
        }

        info!(
            evicted = report.evicted_count,
            freed_bytes = report.freed_bytes,
            usage = current,
            target = self.target_bytes,
            "Eviction finished"
        );
        Ok(report)
    }
}
