//! Memory manager: the single entry point over the record store, the derived
//! indexes, hybrid search and eviction.
//!
//! Every mutation commits to the record store first and updates the lexical
//! and vector indexes afterwards, under their write lock. Derived state that
//! misses an update is repaired on the next open (reconciliation) or lazily
//! during search (orphan removal).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CleanupReport, EvictionManager, StorageUsage};
use crate::classify::classify;
use crate::config::Config;
use crate::embedding::Vectorizer;
use crate::error::{Error, Result};
use crate::export::{self, ExportFormat};
use crate::memory::{
    normalize_tags, now, CompactMemory, MemoryRecord, MemoryUpdate, NewMemory, SearchResults,
    Session, TimelineEntry,
};
use crate::privacy::{has_private, strip_private};
use crate::retrieval::{HybridSearchEngine, SearchRequest, MAX_LIMIT};
use crate::storage::{DocumentMeta, HnswIndex, LexicalIndex, RecordStore};
use crate::tokenize::Tokenizer;

/// Largest accepted timeline window (neighbors around the anchor)
pub const MAX_TIMELINE_WINDOW: usize = 100;

/// State of the derived indexes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum IndexStatus {
    Healthy,
    /// Rebuilt from the record store while opening
    Rebuilt { reason: String },
    /// Serving, but the vector index is stale or unsaved; rebuild recommended
    Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHealth {
    pub status: IndexStatus,
    pub lexical_entries: usize,
    pub vector_entries: usize,
    /// Index entries dropped because their record no longer exists
    pub orphans_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub record_count: usize,
    pub session_count: usize,
    pub store_bytes: u64,
    pub vector_bytes: u64,
    pub usage_bytes: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
    /// On-disk size of the record store snapshot
    pub store_file_bytes: u64,
    /// On-disk size of the vector index blob
    pub vector_file_bytes: u64,
    /// Writes not yet flushed to disk
    pub pending_writes: usize,
    pub index_health: IndexHealth,
}

/// Derived indexes, guarded together so a record is never visible in one and
/// missing from the other
struct Indexes {
    lexical: LexicalIndex,
    vectors: HnswIndex,
    vectors_dirty: bool,
    status: IndexStatus,
    orphans_removed: u64,
}

impl Indexes {
    fn index_record(&mut self, record: &MemoryRecord, vectorizer: &Vectorizer) {
        let text = record.indexable_text();
        self.lexical
            .index(record.id, &text, DocumentMeta::from(record));
        let vector = vectorizer.vectorize(&text, &self.lexical.weights(Some(&record.project)));
        match self.vectors.insert(record.id, vector) {
            Ok(()) => self.vectors_dirty = true,
            Err(e) => {
                warn!(memory_id = %record.id, error = %e, "Vector index update failed");
                self.status = IndexStatus::Degraded {
                    reason: format!("vector index update failed: {}", e),
                };
            }
        }
    }

    fn remove_record(&mut self, id: &Uuid) -> bool {
        let lexical = self.lexical.remove(id);
        let vector = self.vectors.remove(id);
        if vector {
            self.vectors_dirty = true;
        }
        lexical || vector
    }
}

fn embed_record(
    index: &mut HnswIndex,
    record: &MemoryRecord,
    lexical: &LexicalIndex,
    vectorizer: &Vectorizer,
) -> Result<()> {
    let vector = vectorizer.vectorize(
        &record.indexable_text(),
        &lexical.weights(Some(&record.project)),
    );
    index.insert(record.id, vector)
}

fn build_vectors(
    config: &Config,
    records: &[MemoryRecord],
    lexical: &LexicalIndex,
    vectorizer: &Vectorizer,
) -> Result<HnswIndex> {
    let mut index = HnswIndex::new(config.vector_dimensions, config.hnsw.clone());
    for record in records {
        embed_record(&mut index, record, lexical, vectorizer)?;
    }
    Ok(index)
}

/// Load the vector blob and reconcile it with the records, or rebuild it.
/// Returns the index, its status and whether it differs from the blob.
fn load_vectors(
    config: &Config,
    records: &[MemoryRecord],
    lexical: &LexicalIndex,
    vectorizer: &Vectorizer,
) -> Result<(HnswIndex, IndexStatus, bool)> {
    let path = config.vector_index_path();
    let loaded = HnswIndex::load(&path, config.vector_dimensions, config.hnsw.clone());

    let reason = match loaded {
        Ok(Some(mut index)) => {
            let live: HashSet<Uuid> = records.iter().map(|r| r.id).collect();
            let stale: Vec<Uuid> = index.ids().filter(|id| !live.contains(id)).copied().collect();
            for id in &stale {
                index.remove(id);
            }
            let missing: Vec<&MemoryRecord> =
                records.iter().filter(|r| !index.contains(&r.id)).collect();
            for record in &missing {
                embed_record(&mut index, record, lexical, vectorizer)?;
            }

            let changed = !stale.is_empty() || !missing.is_empty();
            if changed {
                warn!(
                    stale = stale.len(),
                    missing = missing.len(),
                    "Reconciled vector index with record store"
                );
            }
            return Ok((index, IndexStatus::Healthy, changed));
        }
        Ok(None) if records.is_empty() => {
            let index = HnswIndex::new(config.vector_dimensions, config.hnsw.clone());
            return Ok((index, IndexStatus::Healthy, false));
        }
        Ok(None) => "vector index missing".to_string(),
        Err(e) => format!("vector index unreadable: {}", e),
    };

    warn!(reason = %reason, records = records.len(), "Rebuilding vector index from record store");
    let index = build_vectors(config, records, lexical, vectorizer)?;
    Ok((index, IndexStatus::Rebuilt { reason }, true))
}

/// Per-project memory store
pub struct MemoryManager {
    config: Config,
    store: RecordStore,
    vectorizer: Vectorizer,
    engine: HybridSearchEngine,
    eviction: EvictionManager,
    indexes: RwLock<Indexes>,
    /// Serializes mutations; searches never take it
    writer: Mutex<()>,
}

impl MemoryManager {
    /// Open the store described by `config`, creating it if needed.
    ///
    /// Fails with [`Error::Disabled`] before touching the filesystem when
    /// memory is not enabled.
    pub async fn open(config: Config) -> Result<Self> {
        if !config.enabled {
            return Err(Error::Disabled);
        }
        config.validate()?;
        config.ensure_dirs()?;

        let store = RecordStore::open(Some(&config.store_path()), config.flush_every)?;
        let tokenizer = Tokenizer::new(&config.stop_words);
        let vectorizer = Vectorizer::new(config.vector_dimensions, tokenizer.clone());

        let records = store.all_memories()?;
        let mut lexical = LexicalIndex::new(tokenizer, config.bm25);
        for record in &records {
            lexical.index(record.id, &record.indexable_text(), DocumentMeta::from(record));
        }
        let (vectors, status, vectors_dirty) =
            load_vectors(&config, &records, &lexical, &vectorizer)?;

        info!(
            data_dir = %config.data_dir.display(),
            records = records.len(),
            vectors = vectors.len(),
            "Opened memory store"
        );

        Ok(Self {
            engine: HybridSearchEngine::new(&config),
            eviction: EvictionManager::new(&config),
            store,
            vectorizer,
            indexes: RwLock::new(Indexes {
                lexical,
                vectors,
                vectors_dirty,
                status,
                orphans_removed: 0,
            }),
            writer: Mutex::new(()),
            config,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Save a new memory.
    ///
    /// Privacy-marked spans are removed from title, content and tags before
    /// anything else sees them. Re-saving an id that already exists returns
    /// the stored record unchanged.
    pub async fn save_memory(&self, input: NewMemory) -> Result<MemoryRecord> {
        input.validate()?;
        let _writer = self.writer.lock().await;

        if let Some(id) = input.id {
            if let Some(existing) = self.store.get_memory(id)? {
                debug!(memory_id = %id, "Memory already saved");
                return Ok(existing);
            }
        }

        if let Some(session_id) = input.session_id {
            match self.store.get_session(session_id)? {
                Some(session) if session.is_active() => {}
                Some(_) => return Err(Error::validation("sessionId", "session is not active")),
                None => return Err(Error::validation("sessionId", "unknown session")),
            }
        }

        if has_private(&input.title) || has_private(&input.content) {
            debug!("Removing private spans before save");
        }
        let title = strip_private(&input.title);
        if title.trim().is_empty() {
            return Err(Error::validation("title", "must not be empty"));
        }
        let content = strip_private(&input.content);
        let tags = normalize_tags(input.tags.iter().map(|t| strip_private(t)));
        let memory_type = input.memory_type.unwrap_or_else(|| classify(&content));

        let at = now();
        let record = MemoryRecord {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            memory_type,
            title,
            content,
            project: input.project,
            tags,
            session_id: input.session_id,
            created_at: at,
            updated_at: at,
            accessed_at: at,
        };

        self.store.insert_memory(&record)?;
        self.indexes
            .write()
            .await
            .index_record(&record, &self.vectorizer);
        self.after_write().await;

        info!(memory_id = %record.id, memory_type = %record.memory_type, "Saved memory");
        Ok(record)
    }

    /// Full records for `ids`, in request order. Unknown ids are omitted and
    /// duplicates returned once. Every returned record has its access time bumped.
    pub async fn get_memory(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let _writer = self.writer.lock().await;
        let mut found: HashMap<Uuid, MemoryRecord> = self
            .store
            .get_memories(&unique)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let ordered: Vec<Uuid> = unique.into_iter().filter(|id| found.contains_key(id)).collect();
        let at = now();
        self.store.touch(&ordered, at)?;
        self.after_write().await;

        Ok(ordered
            .iter()
            .filter_map(|id| found.remove(id))
            .map(|mut record| {
                record.accessed_at = at;
                record
            })
            .collect())
    }

    /// Patch a record and re-index it. `None` if the id is unknown.
    pub async fn update_memory(&self, id: Uuid, update: MemoryUpdate) -> Result<Option<MemoryRecord>> {
        let _writer = self.writer.lock().await;
        let Some(mut record) = self.store.get_memory(id)? else {
            return Ok(None);
        };
        if update.is_empty() {
            return Ok(Some(record));
        }

        if let Some(title) = update.title {
            let title = strip_private(&title);
            if title.trim().is_empty() {
                return Err(Error::validation("title", "must not be empty"));
            }
            record.title = title;
        }
        if let Some(content) = update.content {
            record.content = strip_private(&content);
        }
        if let Some(memory_type) = update.memory_type {
            record.memory_type = memory_type;
        }
        if let Some(tags) = update.tags {
            record.tags = normalize_tags(tags.iter().map(|t| strip_private(t)));
        }
        record.updated_at = now();

        if !self.store.update_memory(&record)? {
            return Ok(None);
        }
        self.indexes
            .write()
            .await
            .index_record(&record, &self.vectorizer);
        self.after_write().await;

        debug!(memory_id = %id, "Updated memory");
        Ok(Some(record))
    }

    /// Delete a record; `false` if it did not exist.
    ///
    /// The store is updated first, so an interruption can only leave index
    /// entries pointing at nothing, which search skips and removes.
    pub async fn delete_memory(&self, id: Uuid) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let deleted = self.store.delete_memory(id)?;
        self.indexes.write().await.remove_record(&id);
        if deleted {
            self.after_write().await;
            info!(memory_id = %id, "Deleted memory");
        }
        Ok(deleted)
    }

    /// Ranked compact results plus the number of candidates before truncation
    pub async fn search_memories(&self, request: &SearchRequest) -> Result<SearchResults> {
        request.validate()?;

        let candidates = {
            let indexes = self.indexes.read().await;
            self.engine
                .rank(request, &indexes.lexical, &indexes.vectors, &self.vectorizer)?
        };
        if candidates.is_empty() {
            return Ok(SearchResults::default());
        }

        let ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
        let records: HashMap<Uuid, CompactMemory> = self
            .store
            .get_memories(&ids)?
            .into_iter()
            .map(|r| (r.id, r.compact()))
            .collect();

        let (mut hits, orphans) = HybridSearchEngine::hydrate(candidates, &records);
        if !orphans.is_empty() {
            self.remove_orphans(&orphans).await;
        }

        let total = hits.len();
        hits.truncate(request.limit);
        Ok(SearchResults { hits, total })
    }

    /// Drop index entries whose record is gone. Each id is re-checked under
    /// the index write lock so a concurrent re-save is never undone.
    async fn remove_orphans(&self, orphans: &[Uuid]) {
        let mut indexes = self.indexes.write().await;
        for id in orphans {
            match self.store.get_memory(*id) {
                Ok(None) => {
                    if indexes.remove_record(id) {
                        indexes.orphans_removed += 1;
                        warn!(memory_id = %id, "Removed orphaned index entry");
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(memory_id = %id, error = %e, "Could not check orphan"),
            }
        }
    }

    /// `anchor` with up to `window` chronological neighbors from its project,
    /// split across both sides, oldest first. `None` if the anchor does not exist.
    pub async fn get_timeline(
        &self,
        anchor: Uuid,
        window: usize,
    ) -> Result<Option<Vec<TimelineEntry>>> {
        if window > MAX_TIMELINE_WINDOW {
            return Err(Error::validation(
                "window",
                format!("must be between 0 and {}", MAX_TIMELINE_WINDOW),
            ));
        }
        self.store.timeline(anchor, window)
    }

    /// Most recently created records first, compact form
    pub async fn list_recent(
        &self,
        project: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CompactMemory>> {
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(Error::validation(
                "limit",
                format!("must be between 1 and {}", MAX_LIMIT),
            ));
        }
        Ok(self
            .store
            .list_recent(project, limit, offset)?
            .iter()
            .map(MemoryRecord::compact)
            .collect())
    }

    /// Begin a new active session
    pub async fn start_session(&self, project: &str) -> Result<Session> {
        if project.trim().is_empty() {
            return Err(Error::validation("project", "must not be empty"));
        }
        let _writer = self.writer.lock().await;
        let session = Session::start(project);
        self.store.insert_session(&session)?;
        self.after_write().await;
        info!(session_id = %session.id, project = %project, "Started session");
        Ok(session)
    }

    /// Complete a session. Ending a completed session returns it unchanged;
    /// an unknown id yields `None`.
    pub async fn end_session(&self, id: Uuid, summary: Option<String>) -> Result<Option<Session>> {
        let _writer = self.writer.lock().await;
        let Some(mut session) = self.store.get_session(id)? else {
            return Ok(None);
        };
        if !session.is_active() {
            return Ok(Some(session));
        }

        session.complete(summary.map(|s| strip_private(&s)));
        self.store.update_session(&session)?;
        self.after_write().await;
        info!(session_id = %id, "Ended session");
        Ok(Some(session))
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.store.get_session(id)
    }

    /// Count a tool call against an active session
    pub async fn record_tool_call(&self, id: Uuid) -> Result<Option<Session>> {
        let _writer = self.writer.lock().await;
        let Some(mut session) = self.store.get_session(id)? else {
            return Ok(None);
        };
        if !session.is_active() {
            return Err(Error::validation("sessionId", "session is not active"));
        }
        session.tool_call_count += 1;
        self.store.update_session(&session)?;
        self.after_write().await;
        Ok(Some(session))
    }

    /// Evict least recently accessed records until usage is under the target.
    /// `force` runs even when usage is within the maximum.
    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let _writer = self.writer.lock().await;
        let result = self.evict_locked(force).await;
        self.flush_locked().await?;
        result
    }

    async fn evict_locked(&self, force: bool) -> Result<CleanupReport> {
        let mut guard = self.indexes.write().await;
        let indexes = &mut *guard;
        let result = self.eviction.run(
            &self.store,
            &mut indexes.lexical,
            &mut indexes.vectors,
            force,
        );
        // A failed run may still have removed entries
        let changed = match &result {
            Ok(report) => report.evicted_count > 0,
            Err(Error::CannotReclaim { evicted, .. }) => *evicted > 0,
            Err(_) => true,
        };
        if changed {
            indexes.vectors_dirty = true;
        }
        result
    }

    /// Discard both indexes and rebuild them from the record store.
    /// Returns the number of records indexed.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let records = self.store.all_memories()?;

        let mut lexical = LexicalIndex::new(self.vectorizer.tokenizer().clone(), self.config.bm25);
        for record in &records {
            lexical.index(record.id, &record.indexable_text(), DocumentMeta::from(record));
        }
        let vectors = build_vectors(&self.config, &records, &lexical, &self.vectorizer)?;

        {
            let mut indexes = self.indexes.write().await;
            indexes.lexical = lexical;
            indexes.vectors = vectors;
            indexes.vectors_dirty = true;
            indexes.status = IndexStatus::Healthy;
        }
        self.save_vectors().await?;

        info!(records = records.len(), "Rebuilt indexes");
        Ok(records.len())
    }

    /// Counts, sizes and index health
    pub async fn stats(&self) -> Result<MemoryStats> {
        let indexes = self.indexes.read().await;
        let usage = StorageUsage::measure(&self.store, &indexes.vectors, self.eviction.max_bytes())?;
        let vector_file_bytes = std::fs::metadata(self.config.vector_index_path())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(MemoryStats {
            record_count: self.store.count_memories()?,
            session_count: self.store.count_sessions()?,
            store_bytes: usage.store_bytes,
            vector_bytes: usage.vector_bytes,
            usage_bytes: usage.total_bytes(),
            max_bytes: usage.max_bytes,
            usage_percent: usage.usage_percent(),
            store_file_bytes: self.store.file_size(),
            vector_file_bytes,
            pending_writes: self.store.flush_state()?.pending(),
            index_health: IndexHealth {
                status: indexes.status.clone(),
                lexical_entries: indexes.lexical.len(),
                vector_entries: indexes.vectors.len(),
                orphans_removed: indexes.orphans_removed,
            },
        })
    }

    /// Every record with full content, in insertion order
    pub async fn export_all(&self, format: ExportFormat) -> Result<String> {
        let records = self.store.all_memories()?;
        debug!(records = records.len(), format = ?format, "Exporting memories");
        export::render(&records, format)
    }

    /// Flush the store snapshot and the vector index to disk
    pub async fn close(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.flush_locked().await?;
        info!(data_dir = %self.config.data_dir.display(), "Closed memory store");
        Ok(())
    }

    /// Flush at the write-count threshold, evicting first if over budget.
    /// Caller holds the writer lock. Failures are logged; the write that
    /// triggered this has already committed.
    async fn after_write(&self) {
        match self.store.flush_due() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Could not read flush state");
                return;
            }
        }

        match self.evict_locked(false).await {
            Ok(report) if report.evicted_count > 0 => {
                info!(evicted = report.evicted_count, "Automatic eviction ran")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Automatic eviction failed"),
        }

        if let Err(e) = self.flush_locked().await {
            warn!(error = %e, "Periodic flush failed");
        }
    }

    /// Caller holds the writer lock
    async fn flush_locked(&self) -> Result<()> {
        self.store.flush()?;
        self.save_vectors().await
    }

    async fn save_vectors(&self) -> Result<()> {
        let saved = {
            let indexes = self.indexes.read().await;
            if !indexes.vectors_dirty {
                return Ok(());
            }
            indexes.vectors.save(&self.config.vector_index_path())
        };

        let mut indexes = self.indexes.write().await;
        match saved {
            Ok(()) => {
                indexes.vectors_dirty = false;
                Ok(())
            }
            Err(e) => {
                indexes.status = IndexStatus::Degraded {
                    reason: format!("vector index not saved: {}", e),
                };
                Err(e)
            }
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        // The record store flushes itself when dropped
        let path = self.config.vector_index_path();
        let indexes = self.indexes.get_mut();
        if indexes.vectors_dirty {
            match indexes.vectors.save(&path) {
                Ok(()) => indexes.vectors_dirty = false,
                Err(e) => warn!(error = %e, "Failed to save vector index on drop"),
            }
        }
    }
}
