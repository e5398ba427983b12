//! In-memory inverted index with BM25 ranking.
//!
//! Statistics (document frequencies, average length) are kept per project so
//! one project's vocabulary never skews another's ranking. Document frequency
//! is the size of a term's posting map, so the vocabulary can never disagree
//! with what is retrievable.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::Bm25Config;
use crate::embedding::TermWeights;
use crate::memory::{MemoryRecord, MemoryType, SearchFilters};
use crate::tokenize::Tokenizer;

/// Filterable attributes of an indexed document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMeta {
    pub project: String,
    pub memory_type: MemoryType,
    pub created_at: DateTime<Utc>,
}

impl From<&MemoryRecord> for DocumentMeta {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            project: record.project.clone(),
            memory_type: record.memory_type,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone)]
struct Document {
    meta: DocumentMeta,
    /// Distinct terms with their frequency in this document
    terms: Vec<(String, u32)>,
    length: u32,
}

/// Index and statistics for one project
#[derive(Debug, Default, Clone)]
pub struct Corpus {
    documents: HashMap<Uuid, Document>,
    postings: BTreeMap<String, HashMap<Uuid, u32>>,
    total_length: u64,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of documents containing `term`
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, HashMap::len)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    fn average_length(&self) -> f32 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.documents.len() as f32
        }
    }

    fn insert(&mut self, id: Uuid, tokens: Vec<String>, meta: DocumentMeta) {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_default() += 1;
        }
        let length = tokens.len() as u32;

        let mut terms: Vec<(String, u32)> = counts.into_iter().collect();
        terms.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (term, tf) in &terms {
            self.postings.entry(term.clone()).or_default().insert(id, *tf);
        }
        self.total_length += length as u64;
        self.documents.insert(id, Document { meta, terms, length });
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        let Some(document) = self.documents.remove(id) else {
            return false;
        };
        for (term, _) in &document.terms {
            if let Some(posting) = self.postings.get_mut(term) {
                posting.remove(id);
                if posting.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length -= document.length as u64;
        true
    }

    /// Terms starting with `prefix`, in lexical order
    fn expand_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.postings
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .map(|(term, _)| term)
            .take_while(move |term| term.starts_with(prefix))
    }

    fn bm25_idf(&self, df: usize) -> f32 {
        let n = self.documents.len() as f32;
        let df = df as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score_into(
        &self,
        terms: &[String],
        params: Bm25Config,
        filters: &SearchFilters,
        scores: &mut HashMap<Uuid, f32>,
    ) {
        let avg_len = self.average_length().max(1.0);
        for term in terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.bm25_idf(posting.len());
            for (id, tf) in posting {
                let Some(document) = self.documents.get(id) else {
                    continue;
                };
                if !admits(filters, &document.meta) {
                    continue;
                }
                let tf = *tf as f32;
                let norm = 1.0 - params.b + params.b * document.length as f32 / avg_len;
                let contribution = idf * tf * (params.k1 + 1.0) / (tf + params.k1 * norm);
                *scores.entry(*id).or_default() += contribution;
            }
        }
    }
}

impl TermWeights for Corpus {
    /// Smoothed IDF used by the vectorizer: `ln((N + 1) / (df + 1)) + 1`
    fn idf(&self, term: &str) -> f32 {
        smoothed_idf(self.documents.len(), self.document_frequency(term))
    }
}

fn smoothed_idf(n: usize, df: usize) -> f32 {
    ((n as f32 + 1.0) / (df as f32 + 1.0)).ln() + 1.0
}

fn admits(filters: &SearchFilters, meta: &DocumentMeta) -> bool {
    filters.admits(meta.memory_type, &meta.project, meta.created_at)
}

/// Vocabulary view handed to the vectorizer
pub enum Weights<'a> {
    Project(&'a Corpus),
    /// Statistics pooled over every project
    Pooled(&'a LexicalIndex),
}

impl TermWeights for Weights<'_> {
    fn idf(&self, term: &str) -> f32 {
        match self {
            Weights::Project(corpus) => corpus.idf(term),
            Weights::Pooled(index) => {
                let (n, df) = index.corpora.values().fold((0, 0), |(n, df), corpus| {
                    (n + corpus.len(), df + corpus.document_frequency(term))
                });
                smoothed_idf(n, df)
            }
        }
    }
}

/// Keyword index over every project in the store
#[derive(Debug, Clone)]
pub struct LexicalIndex {
    tokenizer: Tokenizer,
    params: Bm25Config,
    corpora: HashMap<String, Corpus>,
    /// Document id to owning project
    owners: HashMap<Uuid, String>,
}

impl LexicalIndex {
    pub fn new(tokenizer: Tokenizer, params: Bm25Config) -> Self {
        Self {
            tokenizer,
            params,
            corpora: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.owners.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> {
        self.owners.keys()
    }

    pub fn corpus(&self, project: &str) -> Option<&Corpus> {
        self.corpora.get(project)
    }

    pub fn meta(&self, id: &Uuid) -> Option<&DocumentMeta> {
        let project = self.owners.get(id)?;
        self.corpora.get(project)?.documents.get(id).map(|d| &d.meta)
    }

    /// Whether the document exists and passes `filters`
    pub fn matches(&self, id: &Uuid, filters: &SearchFilters) -> bool {
        self.meta(id).is_some_and(|meta| admits(filters, meta))
    }

    /// IDF source for a project, or pooled statistics when `project` is `None`
    pub fn weights(&self, project: Option<&str>) -> Weights<'_> {
        match project.and_then(|p| self.corpora.get(p)) {
            Some(corpus) => Weights::Project(corpus),
            None => Weights::Pooled(self),
        }
    }

    /// Insert or replace a document. Indexing the same arguments twice leaves
    /// the index exactly as indexing once.
    pub fn index(&mut self, id: Uuid, text: &str, meta: DocumentMeta) {
        self.remove(&id);

        let tokens = self.tokenizer.tokenize(text);
        let project = meta.project.clone();
        self.corpora
            .entry(project.clone())
            .or_default()
            .insert(id, tokens, meta);
        self.owners.insert(id, project);
    }

    /// Remove a document; returns whether it was present
    pub fn remove(&mut self, id: &Uuid) -> bool {
        let Some(project) = self.owners.remove(id) else {
            return false;
        };
        if let Some(corpus) = self.corpora.get_mut(&project) {
            corpus.remove(id);
            if corpus.is_empty() {
                self.corpora.remove(&project);
            }
        }
        true
    }

    /// Release capacity left behind by deletions
    pub fn shrink_to_fit(&mut self) {
        self.owners.shrink_to_fit();
        self.corpora.shrink_to_fit();
        for corpus in self.corpora.values_mut() {
            corpus.documents.shrink_to_fit();
            for posting in corpus.postings.values_mut() {
                posting.shrink_to_fit();
            }
        }
    }

    /// Parse a query into terms. A word ending in `*` is a prefix term,
    /// expanded separately in each corpus.
    fn parse_query(&self, query: &str) -> (Vec<String>, Vec<String>) {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for word in query.split_whitespace() {
            let is_prefix = word.ends_with('*');
            let mut tokens = self.tokenizer.tokenize(word.trim_end_matches('*'));
            if is_prefix {
                if let Some(last) = tokens.pop() {
                    prefixes.push(last);
                }
            }
            exact.extend(tokens);
        }
        exact.sort();
        exact.dedup();
        prefixes.sort();
        prefixes.dedup();
        (exact, prefixes)
    }

    /// BM25-ranked `(id, score)` pairs, best first, at most `limit` long.
    /// Ties are ordered by id.
    pub fn search(&self, query: &str, filters: &SearchFilters, limit: usize) -> Vec<(Uuid, f32)> {
        let (exact, prefixes) = self.parse_query(query);
        if exact.is_empty() && prefixes.is_empty() {
            return Vec::new();
        }

        let mut projects: Vec<&String> = match &filters.project {
            Some(project) => self.corpora.get_key_value(project).map(|(k, _)| k).into_iter().collect(),
            None => self.corpora.keys().collect(),
        };
        projects.sort();

        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        for project in projects {
            let corpus = &self.corpora[project];
            let mut terms = exact.clone();
            for prefix in &prefixes {
                terms.extend(corpus.expand_prefix(prefix).cloned());
            }
            terms.sort();
            terms.dedup();
            corpus.score_into(&terms, self.params, filters, &mut scores);
        }

        let mut ranked: Vec<(Uuid, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);

        debug!(query = %query, results = ranked.len(), "Lexical search");
        ranked
    }
}
