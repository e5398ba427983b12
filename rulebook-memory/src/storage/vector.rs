//! Approximate nearest-neighbor index (HNSW) over unit vectors.
//!
//! Nodes live in a flat arena addressed by `u32` slots; adjacency lists hold
//! slots, never references, so the graph serializes as plain data. Removed
//! slots go on a free list and are reused; other nodes are never renumbered.
//! Incoming edges are tracked per slot and layer so a removal only revisits
//! the nodes that actually point at the removed one.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::HnswConfig;
use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"RBHNSW01";
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: Uuid,
    vector: Vec<f32>,
    /// Outgoing edges per layer; `neighbors.len() == level + 1`
    neighbors: Vec<Vec<u32>>,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }

    fn size_bytes(&self) -> usize {
        let edges: usize = self.neighbors.iter().map(Vec::len).sum();
        16 + self.vector.len() * 4 + edges * 4 + self.neighbors.len() * 24
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    slot: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

/// Cosine distance for unit vectors: `1 - a·b`
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    dimensions: u32,
    max_level: u32,
    entry: Option<u32>,
    nodes: &'a [Option<Node>],
}

#[derive(Deserialize)]
struct Snapshot {
    dimensions: u32,
    max_level: u32,
    entry: Option<u32>,
    nodes: Vec<Option<Node>>,
}

/// HNSW graph keyed by memory id
pub struct HnswIndex {
    params: HnswConfig,
    dimensions: usize,
    nodes: Vec<Option<Node>>,
    /// `inbound[slot][layer]`: slots with an edge to `slot` on `layer`.
    /// Derived from `nodes`, never serialized.
    inbound: Vec<Vec<HashSet<u32>>>,
    slots: HashMap<Uuid, u32>,
    free: Vec<u32>,
    entry: Option<u32>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
}

impl HnswIndex {
    /// Create an empty index
    pub fn new(dimensions: usize, params: HnswConfig) -> Self {
        let level_mult = 1.0 / (params.m.max(2) as f64).ln();
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            dimensions,
            nodes: Vec::new(),
            inbound: Vec::new(),
            slots: HashMap::new(),
            free: Vec::new(),
            entry: None,
            max_level: 0,
            level_mult,
            rng,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> {
        self.slots.keys()
    }

    /// Approximate in-memory footprint of the graph
    pub fn size_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .flatten()
            .map(|n| n.size_bytes() as u64)
            .sum()
    }

    /// Footprint of a single entry, if present
    pub fn entry_bytes(&self, id: &Uuid) -> Option<u64> {
        let slot = *self.slots.get(id)?;
        self.node(slot).map(|n| n.size_bytes() as u64)
    }

    fn node(&self, slot: u32) -> Option<&Node> {
        self.nodes.get(slot as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: u32) -> Option<&mut Node> {
        self.nodes.get_mut(slot as usize).and_then(Option::as_mut)
    }

    fn vector(&self, slot: u32) -> &[f32] {
        self.node(slot).map_or(&[][..], |n| n.vector.as_slice())
    }

    /// Replace the edges of `slot` on `layer`, keeping `inbound` in step
    fn set_edges(&mut self, slot: u32, layer: usize, edges: Vec<u32>) {
        let old = match self
            .node_mut(slot)
            .and_then(|n| n.neighbors.get_mut(layer))
        {
            Some(current) => std::mem::replace(current, edges.clone()),
            None => return,
        };
        for target in old.iter().filter(|t| !edges.contains(*t)) {
            if let Some(set) = self.inbound_mut(*target, layer) {
                set.remove(&slot);
            }
        }
        for target in edges.iter().filter(|t| !old.contains(*t)) {
            if let Some(set) = self.inbound_mut(*target, layer) {
                set.insert(slot);
            }
        }
    }

    fn inbound_mut(&mut self, slot: u32, layer: usize) -> Option<&mut HashSet<u32>> {
        self.inbound
            .get_mut(slot as usize)
            .and_then(|layers| layers.get_mut(layer))
    }

    fn rebuild_inbound(&mut self) {
        let mut inbound: Vec<Vec<HashSet<u32>>> = self
            .nodes
            .iter()
            .map(|n| n.as_ref().map_or_else(Vec::new, |n| vec![HashSet::new(); n.neighbors.len()]))
            .collect();
        for (source, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else {
                continue;
            };
            for (layer, edges) in node.neighbors.iter().enumerate() {
                for &target in edges {
                    if let Some(set) = inbound
                        .get_mut(target as usize)
                        .and_then(|layers| layers.get_mut(layer))
                    {
                        set.insert(source as u32);
                    }
                }
            }
        }
        self.inbound = inbound;
    }

    fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = 1.0 - self.rng.gen::<f64>();
        let level = (-uniform.ln() * self.level_mult).floor();
        (level as usize).min(MAX_LEVEL)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::vector_index(format!(
                "Vector dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(())
    }

    /// Insert a vector, replacing any existing entry for `id`
    pub fn insert(&mut self, id: Uuid, vector: Vec<f32>) -> Result<()> {
        self.check_dimensions(&vector)?;
        self.remove(&id);

        let level = self.random_level();
        let node = Node {
            id,
            vector,
            neighbors: vec![Vec::new(); level + 1],
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                self.inbound[slot as usize] = vec![HashSet::new(); level + 1];
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.inbound.push(vec![HashSet::new(); level + 1]);
                (self.nodes.len() - 1) as u32
            }
        };
        self.slots.insert(id, slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return Ok(());
        };

        let query = self.vector(slot).to_vec();
        let mut entry_points = vec![Candidate {
            distance: cosine_distance(&query, self.vector(entry)),
            slot: entry,
        }];

        for layer in (level + 1..=self.max_level).rev() {
            entry_points = self.search_layer(&query, &entry_points, 1, layer, None);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(
                &query,
                &entry_points,
                self.params.ef_construction,
                layer,
                None,
            );
            let selected = self.select_neighbors(&found, self.params.m);
            self.set_edges(slot, layer, selected.clone());
            for neighbor in selected {
                self.connect(neighbor, slot, layer);
            }
            entry_points = found;
        }

        if level > self.max_level {
            self.entry = Some(slot);
            self.max_level = level;
        }

        Ok(())
    }

    /// Add the edge `from -> to` on `layer`, pruning `from` back to its degree bound
    fn connect(&mut self, from: u32, to: u32, layer: usize) {
        let Some(edges) = self.node(from).and_then(|n| n.neighbors.get(layer)) else {
            return;
        };
        if edges.contains(&to) {
            return;
        }
        let mut edges = edges.clone();
        edges.push(to);
        let edges = if edges.len() > self.max_degree(layer) {
            self.select_for(from, edges, layer)
        } else {
            edges
        };
        self.set_edges(from, layer, edges);
    }

    /// Choose up to the degree bound of `layer` among `pool` for node `base`
    fn select_for(&self, base: u32, pool: Vec<u32>, layer: usize) -> Vec<u32> {
        let base_vector = self.vector(base);
        let mut candidates: Vec<Candidate> = pool
            .into_iter()
            .filter(|slot| *slot != base)
            .filter(|slot| self.node(*slot).is_some_and(|n| n.level() >= layer))
            .map(|slot| Candidate {
                distance: cosine_distance(base_vector, self.vector(slot)),
                slot,
            })
            .collect();
        candidates.sort();
        candidates.dedup_by_key(|c| c.slot);
        self.select_neighbors(&candidates, self.max_degree(layer))
    }

    /// Heuristic neighbor selection: keep a candidate only if it is closer to
    /// the base than to every neighbor already kept, then top up with the
    /// pruned ones. `candidates` must be sorted by distance to the base.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Vec<u32> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        let mut pruned: Vec<Candidate> = Vec::new();

        for candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let vector = self.vector(candidate.slot);
            let diverse = selected
                .iter()
                .all(|kept| cosine_distance(vector, self.vector(kept.slot)) > candidate.distance);
            if diverse {
                selected.push(*candidate);
            } else {
                pruned.push(*candidate);
            }
        }

        for candidate in pruned {
            if selected.len() >= m {
                break;
            }
            selected.push(candidate);
        }

        selected.into_iter().map(|c| c.slot).collect()
    }

    /// Beam search on one layer. Only nodes accepted by `filter` enter the
    /// result set, but traversal goes through every node. Returns candidates
    /// sorted nearest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[Candidate],
        ef: usize,
        layer: usize,
        filter: Option<&dyn Fn(&Node) -> bool>,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let accepts = |node: &Node| filter.map_or(true, |f| f(node));

        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for ep in entry_points {
            if !visited.insert(ep.slot) {
                continue;
            }
            let Some(node) = self.node(ep.slot) else {
                continue;
            };
            candidates.push(Reverse(*ep));
            if accepts(node) {
                results.push(*ep);
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }

            let Some(edges) = self.node(current.slot).and_then(|n| n.neighbors.get(layer)) else {
                continue;
            };

            for &slot in edges {
                if !visited.insert(slot) {
                    continue;
                }
                let Some(node) = self.node(slot) else {
                    continue;
                };
                let distance = cosine_distance(query, &node.vector);
                let worth_visiting = results.len() < ef
                    || results.peek().map_or(true, |worst| distance < worst.distance);
                if !worth_visiting {
                    continue;
                }
                let candidate = Candidate { distance, slot };
                candidates.push(Reverse(candidate));
                if accepts(node) {
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// The `k` nearest entries to `query` as `(id, distance)`, nearest first.
    /// `ef` is raised to `k` when smaller.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<(Uuid, f32)>> {
        self.search_filtered(query, k, ef, |_| true)
    }

    /// Like [`search`](Self::search), restricted to ids accepted by `filter`
    pub fn search_filtered<F>(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: F,
    ) -> Result<Vec<(Uuid, f32)>>
    where
        F: Fn(&Uuid) -> bool,
    {
        self.check_dimensions(query)?;
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<(Uuid, f32)> = if k >= self.len() {
            // Asking for everything: an exact scan is cheaper and complete
            self.nodes
                .iter()
                .flatten()
                .filter(|n| filter(&n.id))
                .map(|n| (n.id, cosine_distance(query, &n.vector)))
                .collect()
        } else {
            let mut entry_points = vec![Candidate {
                distance: cosine_distance(query, self.vector(entry)),
                slot: entry,
            }];
            for layer in (1..=self.max_level).rev() {
                entry_points = self.search_layer(query, &entry_points, 1, layer, None);
            }
            let accepts = |node: &Node| filter(&node.id);
            self.search_layer(query, &entry_points, ef.max(k), 0, Some(&accepts))
                .into_iter()
                .filter_map(|c| self.node(c.slot).map(|n| (n.id, c.distance)))
                .collect()
        };

        results.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    /// Delete an entry and repair the edges of every node that pointed at it
    pub fn remove(&mut self, id: &Uuid) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        let Some(removed) = self.nodes.get_mut(slot as usize).and_then(Option::take) else {
            return false;
        };
        self.free.push(slot);
        let inbound = self
            .inbound
            .get_mut(slot as usize)
            .map(std::mem::take)
            .unwrap_or_default();

        for (layer, removed_edges) in removed.neighbors.iter().enumerate() {
            for target in removed_edges {
                if let Some(set) = self.inbound_mut(*target, layer) {
                    set.remove(&slot);
                }
            }

            let mut referrers: Vec<u32> = inbound
                .get(layer)
                .map(|set| set.iter().copied().filter(|s| *s != slot).collect())
                .unwrap_or_default();
            referrers.sort_unstable();

            for referrer in referrers {
                let Some(edges) = self.node(referrer).and_then(|n| n.neighbors.get(layer)) else {
                    continue;
                };
                let mut pool: Vec<u32> = edges.iter().copied().filter(|s| *s != slot).collect();
                pool.extend(removed_edges.iter().copied().filter(|s| *s != slot));
                let kept = self.select_for(referrer, pool, layer);
                self.set_edges(referrer, layer, kept);
            }
        }

        if self.entry == Some(slot) {
            let replacement = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i as u32, n.level())))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            self.entry = replacement.map(|(s, _)| s);
            self.max_level = replacement.map_or(0, |(_, level)| level);
        }

        if self.slots.is_empty() {
            self.nodes.clear();
            self.inbound.clear();
            self.free.clear();
        }

        true
    }

    /// Serialize the whole graph into a binary blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let snapshot = SnapshotRef {
            dimensions: self.dimensions as u32,
            max_level: self.max_level as u32,
            entry: self.entry,
            nodes: &self.nodes,
        };
        let mut out = MAGIC.to_vec();
        bincode::serialize_into(&mut out, &snapshot)?;
        Ok(out)
    }

    /// Rebuild a graph from [`to_bytes`](Self::to_bytes) output, validating
    /// every edge and dimension
    pub fn from_bytes(bytes: &[u8], dimensions: usize, params: HnswConfig) -> Result<Self> {
        let payload = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| Error::vector_index("Not a vector index blob (bad header)"))?;
        let snapshot: Snapshot = bincode::deserialize(payload)?;

        if snapshot.dimensions as usize != dimensions {
            return Err(Error::vector_index(format!(
                "Vector index has {} dimensions, config expects {}",
                snapshot.dimensions, dimensions
            )));
        }

        let mut index = Self::new(dimensions, params);
        let total = snapshot.nodes.len();
        for (slot, node) in snapshot.nodes.iter().enumerate() {
            let Some(node) = node else {
                index.free.push(slot as u32);
                continue;
            };
            if node.vector.len() != dimensions || node.neighbors.is_empty() {
                return Err(Error::vector_index(format!("Corrupt node at slot {}", slot)));
            }
            for (layer, edges) in node.neighbors.iter().enumerate() {
                let valid = edges.iter().all(|&s| {
                    (s as usize) < total
                        && snapshot.nodes[s as usize]
                            .as_ref()
                            .is_some_and(|n| n.level() >= layer)
                });
                if !valid {
                    return Err(Error::vector_index(format!(
                        "Dangling edge at slot {} layer {}",
                        slot, layer
                    )));
                }
            }
            if index.slots.insert(node.id, slot as u32).is_some() {
                return Err(Error::vector_index(format!("Duplicate id {}", node.id)));
            }
        }

        match snapshot.entry {
            Some(entry) => {
                let level = snapshot
                    .nodes
                    .get(entry as usize)
                    .and_then(Option::as_ref)
                    .map(Node::level)
                    .ok_or_else(|| Error::vector_index("Entry point does not exist"))?;
                if level != snapshot.max_level as usize {
                    return Err(Error::vector_index("Entry point level mismatch"));
                }
            }
            None if !index.slots.is_empty() => {
                return Err(Error::vector_index("Missing entry point"));
            }
            None => {}
        }

        index.rng = StdRng::seed_from_u64(index.params.seed ^ total as u64);
        index.entry = snapshot.entry;
        index.max_level = snapshot.max_level as usize;
        index.nodes = snapshot.nodes;
        index.rebuild_inbound();
        Ok(index)
    }

    /// Write the blob atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entries = self.len(), bytes = bytes.len(), "Saved vector index");
        Ok(())
    }

    /// Load a blob written by [`save`](Self::save); `Ok(None)` if there is none
    pub fn load(path: &Path, dimensions: usize, params: HnswConfig) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let index = Self::from_bytes(&bytes, dimensions, params)?;
        info!(path = %path.display(), entries = index.len(), "Loaded vector index");
        Ok(Some(index))
    }
}
