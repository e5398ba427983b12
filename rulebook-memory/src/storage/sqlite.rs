//! SQLite record store: the durable source of truth for records and sessions.
//!
//! The working copy is an in-memory database. It is restored from the
//! snapshot file on open and written back with the online backup API on
//! [`RecordStore::flush`]. Writes since the last flush are lost on a crash.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::backup::Progress;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::{
    MemoryRecord, MemoryType, Session, SessionStatus, TimelineEntry, TimelinePosition,
};

/// Fixed accounting overhead per stored record, in bytes
pub const RECORD_OVERHEAD_BYTES: u64 = 160;

/// Fixed accounting overhead per stored session, in bytes
pub const SESSION_OVERHEAD_BYTES: u64 = 96;

const MEMORY_COLUMNS: &str = "id, memory_type, title, content, project, tags, session_id, \
                              created_at, updated_at, accessed_at";

const RECORD_BYTES_SQL: &str = "length(CAST(m.title AS BLOB)) + length(CAST(m.content AS BLOB)) \
                                + length(CAST(m.tags AS BLOB)) + length(CAST(m.project AS BLOB))";

const ID_CHUNK: usize = 500;

/// Dirty/flush state of the in-memory working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Clean,
    /// Number of writes since the last flush
    Dirty(usize),
}

impl FlushState {
    fn record(self, writes: usize) -> Self {
        match self {
            FlushState::Clean => FlushState::Dirty(writes),
            FlushState::Dirty(n) => FlushState::Dirty(n + writes),
        }
    }

    pub fn pending(self) -> usize {
        match self {
            FlushState::Clean => 0,
            FlushState::Dirty(n) => n,
        }
    }
}

/// Record selected for eviction, with its accounted size
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub id: Uuid,
    pub bytes: u64,
}

/// Record store backed by an in-memory SQLite database
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
    state: Mutex<FlushState>,
    path: Option<PathBuf>,
    flush_every: usize,
}

impl RecordStore {
    /// Open the store, loading the snapshot at `path` if one exists.
    /// `None` keeps everything in memory.
    pub fn open(path: Option<&Path>, flush_every: usize) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;

        if let Some(path) = path.filter(|p| p.exists()) {
            conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)
                .map_err(|e| {
                    Error::storage(format!("Cannot load record store {}: {}", path.display(), e))
                })?;
            info!(path = %path.display(), "Loaded record store snapshot");
        }

        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            state: Mutex::new(FlushState::Clean),
            path: path.map(Path::to_path_buf),
            flush_every: flush_every.max(1),
        })
    }

    /// Purely in-memory store
    pub fn in_memory() -> Result<Self> {
        Self::open(None, usize::MAX)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    fn mark_dirty(&self, writes: usize) -> Result<()> {
        if writes == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().map_err(|e| Error::storage(e.to_string()))?;
        *state = state.record(writes);
        Ok(())
    }

    pub fn flush_state(&self) -> Result<FlushState> {
        let state = self.state.lock().map_err(|e| Error::storage(e.to_string()))?;
        Ok(*state)
    }

    /// Whether enough writes accumulated to warrant a flush
    pub fn flush_due(&self) -> Result<bool> {
        Ok(self.flush_state()?.pending() >= self.flush_every)
    }

    /// Write the working copy to the snapshot file. A clean store is a no-op.
    /// Returns whether anything was written.
    pub fn flush(&self) -> Result<bool> {
        let conn = self.lock()?;
        let mut state = self.state.lock().map_err(|e| Error::storage(e.to_string()))?;
        if *state == FlushState::Clean {
            return Ok(false);
        }

        if let Some(path) = &self.path {
            let tmp = path.with_extension("db.tmp");
            if tmp.exists() {
                std::fs::remove_file(&tmp)?;
            }
            conn.backup(DatabaseName::Main, &tmp, None)
                .map_err(|e| Error::storage(format!("Cannot write {}: {}", tmp.display(), e)))?;
            std::fs::rename(&tmp, path)?;
            debug!(path = %path.display(), writes = state.pending(), "Flushed record store");
        }

        *state = FlushState::Clean;
        Ok(true)
    }

    /// Size of the snapshot file on disk
    pub fn file_size(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len())
    }

    /// Insert a new memory record
    pub fn insert_memory(&self, memory: &MemoryRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO memories (
                id, memory_type, title, content, project, tags, session_id,
                created_at, updated_at, accessed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                memory.id.to_string(),
                memory.memory_type.as_str(),
                memory.title,
                memory.content,
                memory.project,
                serde_json::to_string(&memory.tags)?,
                memory.session_id.map(|s| s.to_string()),
                timestamp(&memory.created_at),
                timestamp(&memory.updated_at),
                timestamp(&memory.accessed_at),
            ],
        )?;
        self.mark_dirty(1)
    }

    /// Overwrite the mutable fields of an existing record
    pub fn update_memory(&self, memory: &MemoryRecord) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE memories
            SET memory_type = ?2, title = ?3, content = ?4, tags = ?5,
                updated_at = ?6, accessed_at = ?7
            WHERE id = ?1
            "#,
            params![
                memory.id.to_string(),
                memory.memory_type.as_str(),
                memory.title,
                memory.content,
                serde_json::to_string(&memory.tags)?,
                timestamp(&memory.updated_at),
                timestamp(&memory.accessed_at),
            ],
        )?;
        self.mark_dirty(changed.min(1))?;
        Ok(changed > 0)
    }

    /// Get a memory by ID
    pub fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS);
        let row = conn
            .query_row(&sql, params![id.to_string()], MemoryRow::from_row)
            .optional()?;
        row.map(MemoryRow::into_record).transpose()
    }

    /// Get the records that exist among `ids`, in no particular order
    pub fn get_memories(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let mut records = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM memories WHERE id IN ({})",
                MEMORY_COLUMNS, placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.to_string())),
                MemoryRow::from_row,
            )?;
            for row in rows {
                records.push(row?.into_record()?);
            }
        }

        Ok(records)
    }

    /// Set `accessed_at` for every id in `ids`; counts as one write
    pub fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut touched = 0;
        {
            let mut stmt = tx.prepare("UPDATE memories SET accessed_at = ?1 WHERE id = ?2")?;
            let at = timestamp(&at);
            for id in ids {
                touched += stmt.execute(params![at, id.to_string()])?;
            }
        }
        tx.commit()?;
        self.mark_dirty(touched.min(1))?;
        Ok(touched)
    }

    /// Delete a memory; `false` if it did not exist
    pub fn delete_memory(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
        self.mark_dirty(deleted)?;
        Ok(deleted > 0)
    }

    /// Delete several memories in one transaction
    pub fn delete_memories(&self, ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM memories WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        self.mark_dirty(deleted)?;
        Ok(deleted)
    }

    /// Most recently created records first
    pub fn list_recent(
        &self,
        project: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {} FROM memories
            WHERE (?1 IS NULL OR project = ?1)
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2 OFFSET ?3
            "#,
            MEMORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![project, limit as i64, offset as i64],
            MemoryRow::from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Every record, in insertion order
    pub fn all_memories(&self) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM memories ORDER BY seq ASC", MEMORY_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], MemoryRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// `anchor` with up to `window` neighbors from its project, ordered by
    /// `created_at` then insertion order. The window is split across both
    /// sides, the earlier side taking the odd one. `None` if the anchor is unknown.
    pub fn timeline(&self, anchor: Uuid, window: usize) -> Result<Option<Vec<TimelineEntry>>> {
        let conn = self.lock()?;
        let sql = format!("SELECT seq, {} FROM memories WHERE id = ?1", MEMORY_COLUMNS);
        let found = conn
            .query_row(&sql, params![anchor.to_string()], |row| {
                let seq: i64 = row.get(0)?;
                Ok((seq, MemoryRow::from_row_at(row, 1)?))
            })
            .optional()?;
        let Some((seq, anchor_row)) = found else {
            return Ok(None);
        };
        let anchor = anchor_row.into_record()?;
        let created_at = timestamp(&anchor.created_at);

        let neighbors = |sql: String, limit: usize| -> Result<Vec<MemoryRecord>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![anchor.project, created_at, seq, limit as i64],
                MemoryRow::from_row,
            )?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record()?);
            }
            Ok(records)
        };

        let mut before = neighbors(format!(
            r#"
            SELECT {} FROM memories
            WHERE project = ?1 AND (created_at < ?2 OR (created_at = ?2 AND seq < ?3))
            ORDER BY created_at DESC, seq DESC
            LIMIT ?4
            "#,
            MEMORY_COLUMNS
        ), window.div_ceil(2))?;
        before.reverse();
        let after = neighbors(format!(
            r#"
            SELECT {} FROM memories
            WHERE project = ?1 AND (created_at > ?2 OR (created_at = ?2 AND seq > ?3))
            ORDER BY created_at ASC, seq ASC
            LIMIT ?4
            "#,
            MEMORY_COLUMNS
        ), window / 2)?;

        let entry = |position, record: &MemoryRecord| TimelineEntry {
            position,
            memory: record.compact(),
        };
        let mut entries: Vec<TimelineEntry> = before
            .iter()
            .map(|r| entry(TimelinePosition::Before, r))
            .collect();
        entries.push(entry(TimelinePosition::Anchor, &anchor));
        entries.extend(after.iter().map(|r| entry(TimelinePosition::After, r)));
        Ok(Some(entries))
    }

    pub fn count_memories(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_sessions(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Logical bytes held by records and sessions, overheads included
    pub fn data_bytes(&self) -> Result<u64> {
        let conn = self.lock()?;
        let (record_bytes, records): (i64, i64) = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM({}), 0), COUNT(*) FROM memories m",
                RECORD_BYTES_SQL
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (summary_bytes, sessions): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(summary AS BLOB))), 0), COUNT(*) FROM sessions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(record_bytes as u64
            + records as u64 * RECORD_OVERHEAD_BYTES
            + summary_bytes as u64
            + sessions as u64 * SESSION_OVERHEAD_BYTES)
    }

    /// Least recently accessed records that may be evicted: never decisions,
    /// never records of an active session
    pub fn eviction_candidates(&self, limit: usize) -> Result<Vec<EvictionCandidate>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT m.id, {}
            FROM memories m
            LEFT JOIN sessions s ON s.id = m.session_id
            WHERE m.memory_type != 'decision'
              AND (s.status IS NULL OR s.status != 'active')
            ORDER BY m.accessed_at ASC, m.created_at ASC, m.seq ASC
            LIMIT ?1
            "#,
            RECORD_BYTES_SQL
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: String = row.get(0)?;
            let bytes: i64 = row.get(1)?;
            Ok((id, bytes))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (id, bytes) = row?;
            candidates.push(EvictionCandidate {
                id: parse_uuid(&id)?,
                bytes: bytes as u64 + RECORD_OVERHEAD_BYTES,
            });
        }
        Ok(candidates)
    }

    /// Rebuild the database to release free pages
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Save a new session
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (id, project, started_at, ended_at, status, summary, tool_call_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session.id.to_string(),
                session.project,
                timestamp(&session.started_at),
                session.ended_at.as_ref().map(timestamp),
                session.status.as_str(),
                session.summary,
                session.tool_call_count,
            ],
        )?;
        self.mark_dirty(1)
    }

    /// Overwrite the mutable fields of a session
    pub fn update_session(&self, session: &Session) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE sessions
            SET ended_at = ?2, status = ?3, summary = ?4, tool_call_count = ?5
            WHERE id = ?1
            "#,
            params![
                session.id.to_string(),
                session.ended_at.as_ref().map(timestamp),
                session.status.as_str(),
                session.summary,
                session.tool_call_count,
            ],
        )?;
        self.mark_dirty(changed.min(1))?;
        Ok(changed > 0)
    }

    /// Get a session by ID
    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, project, started_at, ended_at, status, summary, tool_call_count
                FROM sessions WHERE id = ?1
                "#,
                params![id.to_string()],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        project: row.get(1)?,
                        started_at: row.get(2)?,
                        ended_at: row.get(3)?,
                        status: row.get(4)?,
                        summary: row.get(5)?,
                        tool_call_count: row.get(6)?,
                    })
                },
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush record store on drop");
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::storage(format!("Invalid id '{}': {}", raw, e)))
}

/// Internal row representation
struct MemoryRow {
    id: String,
    memory_type: String,
    title: String,
    content: String,
    project: String,
    tags: String,
    session_id: Option<String>,
    created_at: String,
    updated_at: String,
    accessed_at: String,
}

impl MemoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Self::from_row_at(row, 0)
    }

    fn from_row_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            memory_type: row.get(offset + 1)?,
            title: row.get(offset + 2)?,
            content: row.get(offset + 3)?,
            project: row.get(offset + 4)?,
            tags: row.get(offset + 5)?,
            session_id: row.get(offset + 6)?,
            created_at: row.get(offset + 7)?,
            updated_at: row.get(offset + 8)?,
            accessed_at: row.get(offset + 9)?,
        })
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: parse_uuid(&self.id)?,
            memory_type: self
                .memory_type
                .parse::<MemoryType>()
                .map_err(|_| Error::storage(format!("Invalid memory type '{}'", self.memory_type)))?,
            title: self.title,
            content: self.content,
            project: self.project,
            tags: serde_json::from_str(&self.tags)?,
            session_id: self.session_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            accessed_at: parse_timestamp(&self.accessed_at)?,
        })
    }
}

struct SessionRow {
    id: String,
    project: String,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    summary: Option<String>,
    tool_call_count: u32,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let status = match self.status.as_str() {
            "active" => SessionStatus::Active,
            "completed" => SessionStatus::Completed,
            other => return Err(Error::storage(format!("Invalid session status '{}'", other))),
        };
        Ok(Session {
            id: parse_uuid(&self.id)?,
            project: self.project,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            status,
            summary: self.summary,
            tool_call_count: self.tool_call_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::now;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn record(project: &str, title: &str, memory_type: MemoryType) -> MemoryRecord {
        let at = now();
        MemoryRecord {
            id: Uuid::new_v4(),
            memory_type,
            title: title.to_string(),
            content: format!("{} content", title),
            project: project.to_string(),
            tags: vec!["a".into(), "b".into()],
            session_id: None,
            created_at: at,
            updated_at: at,
            accessed_at: at,
        }
    }

    #[test]
    fn insert_get_update_delete() {
        let store = RecordStore::in_memory().unwrap();
        let mut memory = record("web", "first", MemoryType::Feature);
        store.insert_memory(&memory).unwrap();

        assert_eq!(store.get_memory(memory.id).unwrap(), Some(memory.clone()));

        memory.title = "renamed".into();
        memory.memory_type = MemoryType::Refactor;
        assert!(store.update_memory(&memory).unwrap());
        assert_eq!(store.get_memory(memory.id).unwrap().unwrap().title, "renamed");

        assert!(store.delete_memory(memory.id).unwrap());
        assert!(!store.delete_memory(memory.id).unwrap());
        assert_eq!(store.get_memory(memory.id).unwrap(), None);
    }

    #[test]
    fn batch_lookup_skips_unknown_ids() {
        let store = RecordStore::in_memory().unwrap();
        let a = record("web", "a", MemoryType::Change);
        let b = record("web", "b", MemoryType::Change);
        store.insert_memory(&a).unwrap();
        store.insert_memory(&b).unwrap();

        let found = store.get_memories(&[a.id, Uuid::new_v4(), b.id]).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn flush_state_tracks_writes() {
        let store = RecordStore::in_memory().unwrap();
        assert_eq!(store.flush_state().unwrap(), FlushState::Clean);
        store.insert_memory(&record("p", "x", MemoryType::Change)).unwrap();
        store.insert_memory(&record("p", "y", MemoryType::Change)).unwrap();
        assert_eq!(store.flush_state().unwrap(), FlushState::Dirty(2));
        assert!(store.flush().unwrap());
        assert!(!store.flush().unwrap());
        assert_eq!(store.flush_state().unwrap(), FlushState::Clean);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        let memory = record("web", "persisted", MemoryType::Discovery);
        let session = Session::start("web");

        {
            let store = RecordStore::open(Some(&path), 10).unwrap();
            store.insert_memory(&memory).unwrap();
            store.insert_session(&session).unwrap();
            // Dropped without an explicit flush
        }

        assert!(path.exists());
        let store = RecordStore::open(Some(&path), 10).unwrap();
        assert_eq!(store.get_memory(memory.id).unwrap(), Some(memory));
        assert_eq!(store.get_session(session.id).unwrap(), Some(session));
        assert!(store.file_size() > 0);
    }

    #[test]
    fn unreadable_snapshot_is_storage_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let result = RecordStore::open(Some(&path), 10);
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
    }

    #[test]
    fn list_recent_orders_newest_first() {
        let store = RecordStore::in_memory().unwrap();
        let base = now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut memory = record(if i % 2 == 0 { "web" } else { "api" }, &format!("m{i}"), MemoryType::Change);
            memory.created_at = base + Duration::seconds(i);
            store.insert_memory(&memory).unwrap();
            ids.push(memory.id);
        }

        let recent: Vec<Uuid> = store.list_recent(None, 3, 0).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(recent, vec![ids[4], ids[3], ids[2]]);

        let web: Vec<Uuid> = store.list_recent(Some("web"), 10, 1).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(web, vec![ids[2], ids[0]]);
    }

    #[test]
    fn timeline_is_scoped_and_windowed() {
        let store = RecordStore::in_memory().unwrap();
        let base = now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut memory = record("web", &format!("m{i}"), MemoryType::Change);
            memory.created_at = base + Duration::seconds(i);
            store.insert_memory(&memory).unwrap();
            ids.push(memory.id);
        }
        let mut other = record("api", "elsewhere", MemoryType::Change);
        other.created_at = base + Duration::milliseconds(2500);
        store.insert_memory(&other).unwrap();

        let timeline = store.timeline(ids[2], 2).unwrap().unwrap();
        let got: Vec<(TimelinePosition, Uuid)> =
            timeline.iter().map(|e| (e.position, e.memory.id)).collect();
        assert_eq!(
            got,
            vec![
                (TimelinePosition::Before, ids[1]),
                (TimelinePosition::Anchor, ids[2]),
                (TimelinePosition::After, ids[3]),
            ]
        );

        let edge = store.timeline(ids[0], 4).unwrap().unwrap();
        assert_eq!(edge.len(), 3);
        assert_eq!(edge[0].position, TimelinePosition::Anchor);

        let odd = store.timeline(ids[2], 3).unwrap().unwrap();
        assert_eq!(odd.first().map(|e| e.memory.id), Some(ids[0]));
        assert_eq!(odd.last().map(|e| e.memory.id), Some(ids[3]));

        assert!(store.timeline(Uuid::new_v4(), 2).unwrap().is_none());
    }

    #[test]
    fn timeline_breaks_timestamp_ties_by_insertion_order() {
        let store = RecordStore::in_memory().unwrap();
        let at = now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut memory = record("web", &format!("tie{i}"), MemoryType::Change);
            memory.created_at = at;
            store.insert_memory(&memory).unwrap();
            ids.push(memory.id);
        }
        let timeline = store.timeline(ids[1], 4).unwrap().unwrap();
        let got: Vec<Uuid> = timeline.iter().map(|e| e.memory.id).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn eviction_candidates_skip_protected_records() {
        let store = RecordStore::in_memory().unwrap();
        let active = Session::start("web");
        let mut ended = Session::start("web");
        store.insert_session(&active).unwrap();
        ended.complete(None);
        store.insert_session(&ended).unwrap();

        let base = now() - Duration::days(30);
        let mut stale = record("web", "stale", MemoryType::Change);
        stale.accessed_at = base;
        let mut fresh = record("web", "fresh", MemoryType::Change);
        fresh.accessed_at = base + Duration::days(10);
        let mut decision = record("web", "decision", MemoryType::Decision);
        decision.accessed_at = base - Duration::days(100);
        let mut in_active = record("web", "active session", MemoryType::Change);
        in_active.accessed_at = base - Duration::days(100);
        in_active.session_id = Some(active.id);
        let mut in_ended = record("web", "ended session", MemoryType::Change);
        in_ended.accessed_at = base + Duration::days(5);
        in_ended.session_id = Some(ended.id);

        for m in [&fresh, &stale, &decision, &in_active, &in_ended] {
            store.insert_memory(m).unwrap();
        }

        let ids: Vec<Uuid> = store
            .eviction_candidates(10)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![stale.id, in_ended.id, fresh.id]);
        assert_eq!(store.eviction_candidates(1).unwrap().len(), 1);
    }

    #[test]
    fn data_bytes_accounts_records_and_sessions() {
        let store = RecordStore::in_memory().unwrap();
        assert_eq!(store.data_bytes().unwrap(), 0);

        let memory = record("web", "abc", MemoryType::Change);
        store.insert_memory(&memory).unwrap();
        let expected = (memory.title.len()
            + memory.content.len()
            + serde_json::to_string(&memory.tags).unwrap().len()
            + memory.project.len()) as u64
            + RECORD_OVERHEAD_BYTES;
        assert_eq!(store.data_bytes().unwrap(), expected);
        assert_eq!(store.eviction_candidates(1).unwrap()[0].bytes, expected);

        let mut session = Session::start("web");
        session.complete(Some("done".into()));
        store.insert_session(&session).unwrap();
        assert_eq!(
            store.data_bytes().unwrap(),
            expected + 4 + SESSION_OVERHEAD_BYTES
        );
    }

    #[test]
    fn touch_updates_access_time() {
        let store = RecordStore::in_memory().unwrap();
        let memory = record("web", "read me", MemoryType::Change);
        store.insert_memory(&memory).unwrap();
        store.flush().unwrap();

        let later = memory.accessed_at + Duration::minutes(5);
        assert_eq!(store.touch(&[memory.id, Uuid::new_v4()], later).unwrap(), 1);
        assert_eq!(store.get_memory(memory.id).unwrap().unwrap().accessed_at, later);
        assert_eq!(store.flush_state().unwrap(), FlushState::Dirty(1));
    }
}
