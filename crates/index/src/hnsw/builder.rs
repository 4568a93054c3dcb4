use super::format::{Layout, SliceHeader, NONE};
use super::{splitmix64, Candidate, IndexSlice, VisitedSet, MAX_LEVEL};
use crate::error::{IndexError, Result};
use crate::kernels::DistanceKernels;
use crate::quantizer::ScalarQuantizer;
use byteorder::{ByteOrder, LittleEndian};
use quiver_core::{IndexSettings, Key};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Builds one HNSW slice from full-precision vectors.
///
/// Construction uses exact distances; the frozen slice keeps only the
/// quantized codes, so searches traverse the graph approximately and the
/// caller reranks against the stored vectors.
///
/// Level assignment is a deterministic function of the settings seed and the
/// insertion order, so the same inputs always produce the same graph.
pub struct HnswBuilder {
    settings: IndexSettings,
    kernels: &'static DistanceKernels,
    level_mult: f64,
    keys: Vec<Key>,
    vectors: Vec<f32>,
    levels: Vec<usize>,
    /// node -> layer -> neighbor positions
    links: Vec<Vec<Vec<u32>>>,
    entry_point: Option<u32>,
    max_level: usize,
    visited: VisitedSet,
}

impl HnswBuilder {
    /// Empty builder for `settings`.
    pub fn new(settings: IndexSettings) -> Self {
        let m = settings.m.max(2);
        HnswBuilder {
            level_mult: 1.0 / (m as f64).ln(),
            settings: IndexSettings { m, ..settings },
            kernels: DistanceKernels::global(),
            keys: Vec::new(),
            vectors: Vec::new(),
            levels: Vec::new(),
            links: Vec::new(),
            entry_point: None,
            max_level: 0,
            visited: VisitedSet::new(0),
        }
    }

    /// Nodes inserted so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn vector(&self, node: u32) -> &[f32] {
        let dim = self.settings.dimension;
        let at = node as usize * dim;
        &self.vectors[at..at + dim]
    }

    fn distance(&self, query: &[f32], node: u32) -> f32 {
        self.kernels
            .distance(self.settings.metric, query, self.vector(node))
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            2 * self.settings.m
        } else {
            self.settings.m
        }
    }

    fn assign_level(&self) -> usize {
        let hash = splitmix64(self.settings.seed.wrapping_add(self.keys.len() as u64 + 1));
        let uniform = ((hash >> 11) as f64 / (1u64 << 53) as f64).max(1e-15);
        ((-uniform.ln() * self.level_mult) as usize).min(MAX_LEVEL)
    }

    /// Add `key` with `vector`. Returns its node position.
    pub fn insert(&mut self, key: Key, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.settings.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.settings.dimension,
                actual: vector.len(),
            });
        }
        if self.keys.len() >= NONE as usize {
            return Err(IndexError::Full);
        }
        let node = self.keys.len() as u32;
        let level = self.assign_level();
        self.keys.push(key);
        self.vectors.extend_from_slice(vector);
        self.levels.push(level);
        self.links.push(vec![Vec::new(); level + 1]);
        self.visited.ensure_capacity(self.keys.len());

        let entry = match self.entry_point {
            Some(entry) => entry,
            None => {
                self.entry_point = Some(node);
                self.max_level = level;
                return Ok(node);
            }
        };

        let mut current = entry;
        for layer in (level + 1..=self.max_level).rev() {
            current = self.greedy(vector, current, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(vector, current, self.settings.ef_construction, layer);
            let chosen: Vec<u32> = candidates
                .iter()
                .take(self.settings.m)
                .map(|c| c.node)
                .collect();
            for &nb in &chosen {
                self.links[nb as usize][layer].push(node);
                if self.links[nb as usize][layer].len() > self.max_links(layer) {
                    self.prune(nb, layer);
                }
            }
            self.links[node as usize][layer] = chosen;
            if let Some(closest) = candidates.first() {
                current = closest.node;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(node);
            self.max_level = level;
        }
        Ok(node)
    }

    fn greedy(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance(query, current);
        let mut improved = true;
        while improved {
            improved = false;
            for &nb in &self.links[current as usize][layer] {
                let d = self.distance(query, nb);
                if d < current_dist || (d == current_dist && nb < current) {
                    current = nb;
                    current_dist = d;
                    improved = true;
                }
            }
        }
        current
    }

    fn search_layer(&mut self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<Candidate> {
        self.visited.clear();
        self.visited.insert(entry);
        let start = Candidate {
            node: entry,
            distance: self.distance(query, entry),
        };
        let mut frontier = BinaryHeap::from([Reverse(start)]);
        let mut best = BinaryHeap::from([start]);
        let ef = ef.max(1);

        while let Some(Reverse(nearest)) = frontier.pop() {
            if best.len() >= ef && best.peek().map_or(false, |worst| nearest > *worst) {
                break;
            }
            let count = self.links[nearest.node as usize]
                .get(layer)
                .map_or(0, Vec::len);
            for i in 0..count {
                let nb = self.links[nearest.node as usize][layer][i];
                if !self.visited.insert(nb) {
                    continue;
                }
                let cand = Candidate {
                    node: nb,
                    distance: self.distance(query, nb),
                };
                if best.len() < ef || best.peek().map_or(true, |worst| cand < *worst) {
                    frontier.push(Reverse(cand));
                    best.push(cand);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        best.into_sorted_vec()
    }

    /// Keep the closest `max_links(layer)` neighbors of `node`.
    fn prune(&mut self, node: u32, layer: usize) {
        let base = self.vector(node).to_vec();
        let mut scored: Vec<Candidate> = self.links[node as usize][layer]
            .iter()
            .map(|&nb| Candidate {
                node: nb,
                distance: self.distance(&base, nb),
            })
            .collect();
        scored.sort();
        scored.truncate(self.max_links(layer));
        self.links[node as usize][layer] = scored.into_iter().map(|c| c.node).collect();
    }

    /// Freeze into a slice for `segment_id`.
    pub fn build(self, segment_id: u64) -> Result<IndexSlice> {
        let n = self.keys.len();
        let m = self.settings.m;
        let dim = self.settings.dimension;

        let mut upper_start = vec![NONE; n];
        let mut upper_slots = 0usize;
        for (node, &level) in self.levels.iter().enumerate() {
            if level > 0 {
                upper_start[node] = upper_slots as u32;
                upper_slots += level * m;
            }
        }
        let keys_bytes: usize = self.keys.iter().map(Key::len).sum();
        if upper_slots >= NONE as usize || keys_bytes >= NONE as usize {
            return Err(IndexError::Full);
        }

        let header = SliceHeader {
            metric: self.settings.metric,
            dimension: dim as u32,
            node_count: n as u32,
            m: m as u32,
            max_level: if n == 0 { 0 } else { self.max_level as u32 },
            entry_point: self.entry_point.unwrap_or(NONE),
            upper_slots: upper_slots as u32,
            keys_bytes: keys_bytes as u32,
            segment_id,
        };
        let layout = Layout::new(&header);
        let mut buf = vec![0u8; layout.total];
        header.write(&mut buf);

        let put = |buf: &mut [u8], base: usize, i: usize, v: u32| {
            LittleEndian::write_u32(&mut buf[base + i * 4..base + i * 4 + 4], v);
        };

        // Unused neighbor slots read as NONE
        buf[layout.layer0..layout.key_offsets].fill(0xff);

        let mut key_offset = 0u32;
        for node in 0..n {
            let vector = &self.vectors[node * dim..(node + 1) * dim];
            let (codes, magnitude) = ScalarQuantizer::quantize_vector(vector);
            let at = layout.magnitudes + node * 4;
            LittleEndian::write_f32(&mut buf[at..at + 4], magnitude);
            buf[layout.codes + node * dim..layout.codes + (node + 1) * dim]
                .copy_from_slice(&codes);

            put(&mut buf, layout.levels, node, self.levels[node] as u32);
            put(&mut buf, layout.upper_start, node, upper_start[node]);

            for (layer, neighbors) in self.links[node].iter().enumerate() {
                let base = if layer == 0 {
                    layout.layer0 + node * 2 * m * 4
                } else {
                    layout.upper + (upper_start[node] as usize + (layer - 1) * m) * 4
                };
                for (i, &nb) in neighbors.iter().enumerate() {
                    put(&mut buf, base, i, nb);
                }
            }

            put(&mut buf, layout.key_offsets, node, key_offset);
            let key = self.keys[node].as_bytes();
            let at = layout.keys + key_offset as usize;
            buf[at..at + key.len()].copy_from_slice(key);
            key_offset += key.len() as u32;
        }
        put(&mut buf, layout.key_offsets, n, key_offset);

        let crc = crc32fast::hash(&buf[..layout.crc]);
        put(&mut buf, layout.crc, 0, crc);

        tracing::debug!(
            target: "quiver::index",
            segment_id,
            nodes = n,
            max_level = header.max_level,
            bytes = layout.total,
            "Built index slice"
        );
        IndexSlice::from_owned(buf)
    }
}
