//! Memory records, sessions and the compact shapes returned by search

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Current time at the precision the record store keeps (microseconds)
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Type of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Bugfix,
    Feature,
    Refactor,
    /// Never evicted
    Decision,
    Discovery,
    Change,
    Observation,
}

impl MemoryType {
    pub const ALL: [MemoryType; 7] = [
        MemoryType::Bugfix,
        MemoryType::Feature,
        MemoryType::Refactor,
        MemoryType::Decision,
        MemoryType::Discovery,
        MemoryType::Change,
        MemoryType::Observation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Bugfix => "bugfix",
            MemoryType::Feature => "feature",
            MemoryType::Refactor => "refactor",
            MemoryType::Decision => "decision",
            MemoryType::Discovery => "discovery",
            MemoryType::Change => "change",
            MemoryType::Observation => "observation",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MemoryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::validation("type", format!("unknown memory type '{}'", s)))
    }
}

/// A stored unit of project knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Unique memory ID, immutable
    pub id: Uuid,

    #[serde(rename = "type")]
    pub memory_type: MemoryType,

    pub title: String,

    /// Body text, already stripped of privacy-marked spans
    pub content: String,

    /// Project this memory belongs to
    pub project: String,

    /// Sorted, de-duplicated labels
    #[serde(default)]
    pub tags: Vec<String>,

    /// Session that was active when the memory was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Last time the full record was read; drives eviction order
    pub accessed_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Text fed to the lexical index and the vectorizer
    pub fn indexable_text(&self) -> String {
        let mut text = String::with_capacity(self.title.len() + self.content.len() + 16);
        text.push_str(&self.title);
        text.push('\n');
        text.push_str(&self.content);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }

    pub fn compact(&self) -> CompactMemory {
        CompactMemory {
            id: self.id,
            title: self.title.clone(),
            memory_type: self.memory_type,
            created_at: self.created_at,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One continuous interaction; records created during it point back here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub project: String,
    pub started_at: DateTime<Utc>,
    /// Absent while the session is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tool_call_count: u32,
}

impl Session {
    /// Create a new active session
    pub fn start(project: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            started_at: now(),
            ended_at: None,
            status: SessionStatus::Active,
            summary: None,
            tool_call_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Mark the session completed
    pub fn complete(&mut self, summary: Option<String>) {
        self.status = SessionStatus::Completed;
        self.ended_at = Some(now());
        if summary.is_some() {
            self.summary = summary;
        }
    }
}

/// Input for a save
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMemory {
    /// Client-chosen id; re-saving an existing id returns the stored record
    #[serde(default)]
    pub id: Option<Uuid>,

    /// Auto-classified from the content when absent
    #[serde(default, rename = "type")]
    pub memory_type: Option<MemoryType>,

    pub title: String,

    pub content: String,

    pub project: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub session_id: Option<Uuid>,
}

impl NewMemory {
    pub fn new(
        project: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title", "must not be empty"));
        }
        if self.project.trim().is_empty() {
            return Err(Error::validation("project", "must not be empty"));
        }
        Ok(())
    }
}

/// Partial update; `None` fields are left as they are
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.memory_type.is_none()
            && self.tags.is_none()
    }
}

/// Trim, drop empties, de-duplicate and sort
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Record summary without content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactMemory {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub created_at: DateTime<Utc>,
}

/// Which ranking(s) produced a search hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Lexical,
    Vector,
    /// Present in both rankings
    Hybrid,
}

/// Compact search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub score: f32,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
}

/// Ranked hits plus the number of candidates before truncation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

/// Where a timeline entry sits relative to the anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelinePosition {
    Before,
    Anchor,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub position: TimelinePosition,
    #[serde(flatten)]
    pub memory: CompactMemory,
}

/// Restrictions applied identically by every search mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(default, rename = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub project: Option<String>,
    /// Inclusive lower bound on `createdAt`
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `createdAt`
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(Error::validation("filters.since", "must not be after filters.until"));
            }
        }
        Ok(())
    }

    pub fn admits(&self, memory_type: MemoryType, project: &str, created_at: DateTime<Utc>) -> bool {
        self.memory_type.map_or(true, |t| t == memory_type)
            && self.project.as_deref().map_or(true, |p| p == project)
            && self.since.map_or(true, |since| created_at >= since)
            && self.until.map_or(true, |until| created_at <= until)
    }
}
