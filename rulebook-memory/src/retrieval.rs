//! Hybrid retrieval: BM25 and vector rankings fused with Reciprocal Rank Fusion

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Vectorizer;
use crate::error::{Error, Result};
use crate::memory::{CompactMemory, MatchType, SearchFilters, SearchHit};
use crate::storage::{HnswIndex, LexicalIndex};

/// Default number of results
pub const DEFAULT_LIMIT: usize = 10;

/// Largest accepted `limit`
pub const MAX_LIMIT: usize = 1000;

/// Which ranking(s) a search uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Vector,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Lexical => "lexical",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lexical" => Ok(SearchMode::Lexical),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::validation(
                "mode",
                format!("unknown search mode '{}' (expected lexical, vector or hybrid)", other),
            )),
        }
    }
}

/// A search query with its options
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub limit: usize,
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: SearchMode::default(),
            limit: DEFAULT_LIMIT,
            filters: SearchFilters::default(),
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Reject malformed requests before any index is touched
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::validation("query", "must not be empty"));
        }
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(Error::validation(
                "limit",
                format!("must be between 1 and {}", MAX_LIMIT),
            ));
        }
        self.filters.validate()
    }
}

/// A ranked id before hydration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub id: Uuid,
    pub score: f32,
    pub match_type: MatchType,
}

/// Fuse rankings: each id scores `sum(1 / (k + rank))` over the rankings it
/// appears in, with 1-based ranks. Best first; ties ordered by id.
pub fn reciprocal_rank_fusion(rankings: &[Vec<Uuid>], k: f32) -> Vec<(Uuid, f32)> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    for ranking in rankings {
        for (position, id) in ranking.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) += 1.0 / (k + (position + 1) as f32);
        }
    }

    let mut fused: Vec<(Uuid, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

/// Runs the lexical and vector rankings and fuses them
#[derive(Debug, Clone)]
pub struct HybridSearchEngine {
    rrf_k: f32,
    candidate_pool_factor: usize,
    ef_search: usize,
}

impl HybridSearchEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            rrf_k: config.rrf_k,
            candidate_pool_factor: config.candidate_pool_factor.max(1),
            ef_search: config.hnsw.ef_search,
        }
    }

    /// Number of candidates each ranking contributes for `limit`
    pub fn pool_size(&self, limit: usize) -> usize {
        limit.saturating_mul(self.candidate_pool_factor)
    }

    /// Vector ranking as `(id, similarity)`; records sharing no term bucket
    /// with the query are not matches
    fn vector_ranking(
        &self,
        request: &SearchRequest,
        pool: usize,
        lexical: &LexicalIndex,
        vectors: &HnswIndex,
        vectorizer: &Vectorizer,
    ) -> Result<Vec<(Uuid, f32)>> {
        let weights = lexical.weights(request.filters.project.as_deref());
        let query = vectorizer.vectorize(&request.query, &weights);
        if query.iter().all(|c| *c == 0.0) {
            return Ok(Vec::new());
        }

        let hits = vectors.search_filtered(&query, pool, self.ef_search.max(pool), |id| {
            lexical.matches(id, &request.filters)
        })?;
        Ok(hits
            .into_iter()
            .map(|(id, distance)| (id, 1.0 - distance))
            .filter(|(_, similarity)| *similarity > 0.0)
            .collect())
    }

    /// Rank candidates for `request`. Returns every candidate of the pool,
    /// best first, not yet truncated to `limit`.
    pub fn rank(
        &self,
        request: &SearchRequest,
        lexical: &LexicalIndex,
        vectors: &HnswIndex,
        vectorizer: &Vectorizer,
    ) -> Result<Vec<RankedCandidate>> {
        request.validate()?;
        let pool = self.pool_size(request.limit);

        let candidates: Vec<RankedCandidate> = match request.mode {
            SearchMode::Lexical => lexical
                .search(&request.query, &request.filters, pool)
                .into_iter()
                .map(|(id, score)| RankedCandidate {
                    id,
                    score,
                    match_type: MatchType::Lexical,
                })
                .collect(),
            SearchMode::Vector => self
                .vector_ranking(request, pool, lexical, vectors, vectorizer)?
                .into_iter()
                .map(|(id, score)| RankedCandidate {
                    id,
                    score,
                    match_type: MatchType::Vector,
                })
                .collect(),
            SearchMode::Hybrid => {
                // Both rankings are read-only, so running them in sequence
                // gives the same result as running them concurrently
                let lexical_ids: Vec<Uuid> = lexical
                    .search(&request.query, &request.filters, pool)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                let vector_ids: Vec<Uuid> = self
                    .vector_ranking(request, pool, lexical, vectors, vectorizer)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();

                let fused =
                    reciprocal_rank_fusion(&[lexical_ids.clone(), vector_ids.clone()], self.rrf_k);
                fused
                    .into_iter()
                    .map(|(id, score)| {
                        let match_type =
                            match (lexical_ids.contains(&id), vector_ids.contains(&id)) {
                                (true, true) => MatchType::Hybrid,
                                (true, false) => MatchType::Lexical,
                                _ => MatchType::Vector,
                            };
                        RankedCandidate {
                            id,
                            score,
                            match_type,
                        }
                    })
                    .collect()
            }
        };

        debug!(
            query = %request.query,
            mode = %request.mode,
            candidates = candidates.len(),
            "Ranked search candidates"
        );
        Ok(candidates)
    }

    /// Attach compact record data to ranked candidates. Candidates whose id
    /// resolves to no record are returned separately as orphans.
    pub fn hydrate(
        candidates: Vec<RankedCandidate>,
        records: &HashMap<Uuid, CompactMemory>,
    ) -> (Vec<SearchHit>, Vec<Uuid>) {
        let mut hits = Vec::with_capacity(candidates.len());
        let mut orphans = Vec::new();

        for candidate in candidates {
            match records.get(&candidate.id) {
                Some(memory) => hits.push(SearchHit {
                    id: memory.id,
                    title: memory.title.clone(),
                    memory_type: memory.memory_type,
                    score: candidate.score,
                    match_type: candidate.match_type,
                    created_at: memory.created_at,
                }),
                None => orphans.push(candidate.id),
            }
        }

        (hits, orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswConfig;
    use crate::memory::{now, MemoryType};
    use crate::storage::DocumentMeta;
    use crate::tokenize::Tokenizer;
    use pretty_assertions::assert_eq;

    struct Fixture {
        lexical: LexicalIndex,
        vectors: HnswIndex,
        vectorizer: Vectorizer,
        engine: HybridSearchEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::default();
            Self {
                lexical: LexicalIndex::new(Tokenizer::default(), config.bm25),
                vectors: HnswIndex::new(config.vector_dimensions, HnswConfig::default()),
                vectorizer: Vectorizer::new(config.vector_dimensions, Tokenizer::default()),
                engine: HybridSearchEngine::new(&config),
            }
        }

        fn add(&mut self, project: &str, memory_type: MemoryType, text: &str) -> Uuid {
            let id = Uuid::new_v4();
            let meta = DocumentMeta {
                project: project.to_string(),
                memory_type,
                created_at: now(),
            };
            self.lexical.index(id, text, meta);
            let vector = self
                .vectorizer
                .vectorize(text, &self.lexical.weights(Some(project)));
            self.vectors.insert(id, vector).unwrap();
            id
        }

        fn rank(&self, request: SearchRequest) -> Vec<RankedCandidate> {
            self.engine
                .rank(&request, &self.lexical, &self.vectors, &self.vectorizer)
                .unwrap()
        }
    }

    #[test]
    fn parses_known_modes_only() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("lexical".parse::<SearchMode>().unwrap(), SearchMode::Lexical);
        assert!(matches!(
            "semantic".parse::<SearchMode>(),
            Err(Error::Validation { field: "mode", .. })
        ));
    }

    #[test]
    fn validates_limit_and_query() {
        assert!(SearchRequest::new("x").validate().is_ok());
        assert!(matches!(
            SearchRequest::new("x").with_limit(0).validate(),
            Err(Error::Validation { field: "limit", .. })
        ));
        assert!(matches!(
            SearchRequest::new("x").with_limit(MAX_LIMIT + 1).validate(),
            Err(Error::Validation { field: "limit", .. })
        ));
        assert!(matches!(
            SearchRequest::new("   ").validate(),
            Err(Error::Validation { field: "query", .. })
        ));
    }

    #[test]
    fn fusion_rewards_presence_in_both_rankings() {
        let both = Uuid::from_u128(1);
        let lexical_only = Uuid::from_u128(2);
        let vector_only = Uuid::from_u128(3);

        let fused = reciprocal_rank_fusion(
            &[vec![lexical_only, both], vec![vector_only, both]],
            60.0,
        );
        assert_eq!(fused[0].0, both);
        assert!((fused[0].1 - 2.0 / 62.0).abs() < 1e-6);

        // Same individual rank, one ranking only
        let single = reciprocal_rank_fusion(&[vec![lexical_only, both]], 60.0);
        let single_score = single.iter().find(|(id, _)| *id == both).unwrap().1;
        assert!(fused[0].1 > single_score);
    }

    #[test]
    fn fusion_orders_ties_by_id() {
        let a = Uuid::from_u128(10);
        let b = Uuid::from_u128(20);
        let fused = reciprocal_rank_fusion(&[vec![b], vec![a]], 60.0);
        assert_eq!(fused, vec![(a, 1.0 / 61.0), (b, 1.0 / 61.0)]);
    }

    #[test]
    fn hybrid_ranks_relevant_record_first() {
        let mut fx = Fixture::new();
        let a = fx.add("p", MemoryType::Discovery, "database connection pooling patterns");
        let b = fx.add("p", MemoryType::Observation, "unrelated topic about cooking");

        let ranked = fx.rank(SearchRequest::new("connection pooling"));
        assert_eq!(ranked[0].id, a);
        assert_eq!(ranked[0].match_type, MatchType::Hybrid);
        if let Some(pos_b) = ranked.iter().position(|c| c.id == b) {
            assert!(pos_b > 0);
        }
    }

    #[test]
    fn modes_report_their_match_type() {
        let mut fx = Fixture::new();
        fx.add("p", MemoryType::Feature, "retry queue with exponential backoff");

        let lexical = fx.rank(SearchRequest::new("backoff").with_mode(SearchMode::Lexical));
        assert_eq!(lexical[0].match_type, MatchType::Lexical);

        let vector = fx.rank(SearchRequest::new("backoff").with_mode(SearchMode::Vector));
        assert_eq!(vector[0].match_type, MatchType::Vector);
        assert!(vector[0].score > 0.0 && vector[0].score <= 1.0 + 1e-5);
    }

    #[test]
    fn filters_apply_in_every_mode() {
        let mut fx = Fixture::new();
        fx.add("web", MemoryType::Bugfix, "cache invalidation race");
        let api = fx.add("api", MemoryType::Bugfix, "cache invalidation race");

        for mode in [SearchMode::Lexical, SearchMode::Vector, SearchMode::Hybrid] {
            let ranked = fx.rank(
                SearchRequest::new("cache invalidation")
                    .with_mode(mode)
                    .with_filters(SearchFilters::for_project("api")),
            );
            let ids: Vec<Uuid> = ranked.iter().map(|c| c.id).collect();
            assert_eq!(ids, vec![api], "mode {mode}");
        }
    }

    #[test]
    fn empty_indexes_rank_nothing() {
        let fx = Fixture::new();
        assert!(fx.rank(SearchRequest::new("anything")).is_empty());
    }

    #[test]
    fn hydration_separates_orphans() {
        let at = now();
        let live = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let records = HashMap::from([(
            live,
            CompactMemory {
                id: live,
                title: "live".into(),
                memory_type: MemoryType::Change,
                created_at: at,
            },
        )]);
        let candidates = vec![
            RankedCandidate {
                id: gone,
                score: 0.5,
                match_type: MatchType::Vector,
            },
            RankedCandidate {
                id: live,
                score: 0.4,
                match_type: MatchType::Lexical,
            },
        ];

        let (hits, orphans) = HybridSearchEngine::hydrate(candidates, &records);
        assert_eq!(orphans, vec![gone]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "live");
    }
}
