//! Temporal heterogeneous neighbor sampling.
//!
//! Every seed grows its own tree (disjoint sampling): starting from the seed
//! node, each hop expands the current frontier through every incoming edge
//! type, keeping at most `fanouts[hop]` neighbors per node and edge type.
//! Only edges with `time <= seed_time` (and, for temporal node types, nodes
//! created by then) are visible. Nodes are deduplicated within a tree but not
//! across trees, so every node in the batch belongs to exactly one seed.
//!
//! The per-seed trees are merged into one [`Subgraph`] whose seed-type node
//! set starts with the seeds themselves, in input order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use rand::prelude::*;
use rand::rngs::SmallRng;
use rand::seq::index;
use rayon::prelude::*;
use tracing::debug;

use crate::common::{NodeType, TemporalStrategy, Timestamp};
use crate::graph::HeteroGraph;

// ============================================================================
// Sampled Subgraph
// ============================================================================

/// Nodes of one type in a sampled subgraph, in local index order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSet {
    /// Global node ids.
    pub ids: Vec<u32>,
    /// Index of the seed whose tree each node belongs to.
    pub batch: Vec<u32>,
    pub feature_dim: usize,
    /// Row-major `[len, feature_dim]`.
    pub features: Vec<f32>,
    /// Node creation times, for temporal node types.
    pub times: Option<Vec<Timestamp>>,
}

impl NodeSet {
    fn new(feature_dim: usize, temporal: bool) -> Self {
        Self {
            feature_dim,
            times: temporal.then(Vec::new),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Sampled edges of one edge type as parallel arrays of local indices.
/// Messages flow from `src[i]` to `dst[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSet {
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
    pub time: Vec<Timestamp>,
}

impl EdgeSet {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn in_degree(&self, num_dst: usize) -> Vec<u32> {
        let mut degree = vec![0u32; num_dst];
        for &d in &self.dst {
            degree[d as usize] += 1;
        }
        degree
    }

    /// Source indices grouped by destination row, each row padded with `pad`
    /// up to the largest in-degree. Returns the flat `[num_dst, width]` matrix
    /// and `width`.
    pub fn padded_neighbors(&self, num_dst: usize, pad: u32) -> (Vec<u32>, usize) {
        let degree = self.in_degree(num_dst);
        let width = degree.iter().copied().max().unwrap_or(0) as usize;
        let mut out = vec![pad; num_dst * width];
        let mut fill = vec![0usize; num_dst];
        for (&s, &d) in self.src.iter().zip(&self.dst) {
            let d = d as usize;
            out[d * width + fill[d]] = s;
            fill[d] += 1;
        }
        (out, width)
    }
}

/// Union of the sampled trees of a batch of seeds.
///
/// `nodes` is indexed by [`NodeType`], `edges` by [`EdgeType`](crate::common::EdgeType).
/// The first `num_seeds()` nodes of `seed_type` are the seeds.
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    pub seed_type: NodeType,
    /// Seed time of each seed.
    pub seed_time: Vec<Timestamp>,
    pub nodes: Vec<NodeSet>,
    pub edges: Vec<EdgeSet>,
}

impl Subgraph {
    pub fn num_seeds(&self) -> usize {
        self.seed_time.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().map(NodeSet::len).sum()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.iter().map(EdgeSet::len).sum()
    }

    /// Seed time of the tree that local node `local` of `node_type` belongs to.
    pub fn node_seed_time(&self, node_type: NodeType, local: usize) -> Timestamp {
        self.seed_time[self.nodes[node_type.index()].batch[local] as usize]
    }

    /// Global ids of the seeds.
    pub fn seed_ids(&self) -> &[u32] {
        &self.nodes[self.seed_type.index()].ids[..self.num_seeds()]
    }

    fn push_node(&mut self, graph: &HeteroGraph, node_type: NodeType, node: u32, seed: usize) {
        let set = &mut self.nodes[node_type.index()];
        set.ids.push(node);
        set.batch.push(seed as u32);
        set.features.extend_from_slice(graph.features(node_type, node));
        if let (Some(times), Some(t)) = (set.times.as_mut(), graph.node_time(node_type, node)) {
            times.push(t);
        }
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// One seed's tree: global ids per node type (local index = position) and
/// `(dst_local, src_local, time)` edges per edge type.
struct SeedTree {
    nodes: Vec<Vec<u32>>,
    edges: Vec<Vec<(u32, u32, Timestamp)>>,
}

#[derive(Debug)]
pub struct NeighborSampler {
    graph: Arc<HeteroGraph>,
    fanouts: Vec<usize>,
    strategy: TemporalStrategy,
}

impl NeighborSampler {
    pub fn new(graph: Arc<HeteroGraph>, fanouts: Vec<usize>, strategy: TemporalStrategy) -> Self {
        debug!("NeighborSampler: fanouts={fanouts:?}, strategy={strategy}");
        Self {
            graph,
            fanouts,
            strategy,
        }
    }

    pub fn graph(&self) -> &Arc<HeteroGraph> {
        &self.graph
    }

    pub fn fanouts(&self) -> &[usize] {
        &self.fanouts
    }

    pub fn strategy(&self) -> TemporalStrategy {
        self.strategy
    }

    /// Sample the temporal neighborhood of every `(seed, time)` pair.
    ///
    /// Each seed gets its own RNG drawn from `rng`, and trees are grown in
    /// parallel, so the result depends only on the inputs and `rng`'s state.
    pub fn sample(
        &self,
        seed_type: NodeType,
        seeds: &[u32],
        times: &[Timestamp],
        rng: &mut SmallRng,
    ) -> Result<Subgraph, SamplerError> {
        let schema = self.graph.schema();
        if seed_type.index() >= schema.num_node_types() {
            return Err(SamplerError::UnknownNodeType(seed_type.0));
        }
        if seeds.len() != times.len() {
            return Err(SamplerError::LengthMismatch {
                seeds: seeds.len(),
                times: times.len(),
            });
        }
        let num_nodes = self.graph.num_nodes(seed_type);
        if let Some(&bad) = seeds.iter().find(|&&s| s as usize >= num_nodes) {
            return Err(SamplerError::SeedOutOfRange {
                node: bad,
                node_type: schema.node_meta(seed_type).name.clone(),
                num_nodes,
            });
        }

        let thread_seeds: Vec<u64> = (0..seeds.len()).map(|_| rng.random()).collect();
        let trees: Vec<SeedTree> = thread_seeds
            .par_iter()
            .zip(seeds.par_iter().zip(times.par_iter()))
            .map(|(&thread_seed, (&seed, &time))| {
                let mut thread_rng = SmallRng::seed_from_u64(thread_seed);
                self.sample_tree(seed_type, seed, time, &mut thread_rng)
            })
            .collect();

        Ok(self.merge(seed_type, times, &trees))
    }

    fn sample_tree(&self, seed_type: NodeType, seed: u32, time: Timestamp, rng: &mut SmallRng) -> SeedTree {
        let graph = &*self.graph;
        let schema = graph.schema();
        let mut local: Vec<HashMap<u32, u32>> = vec![HashMap::new(); schema.num_node_types()];
        let mut nodes: Vec<Vec<u32>> = vec![Vec::new(); schema.num_node_types()];
        let mut edges: Vec<Vec<(u32, u32, Timestamp)>> = vec![Vec::new(); schema.num_edge_types()];

        nodes[seed_type.index()].push(seed);
        local[seed_type.index()].insert(seed, 0);
        let mut frontier = vec![(seed_type, seed, 0u32)];
        let mut candidates = Vec::new();

        for &fanout in &self.fanouts {
            let mut next = Vec::new();
            for &(node_type, node, node_local) in &frontier {
                for &edge_type in graph.incoming(node_type) {
                    let src_type = schema.edge_meta(edge_type).src;
                    let (cols, edge_times) = graph.neighbors(node, edge_type, time);

                    candidates.clear();
                    if schema.node_meta(src_type).temporal {
                        candidates.extend((0..cols.len()).filter(|&i| {
                            graph.node_time(src_type, cols[i]).is_none_or(|t| t <= time)
                        }));
                    } else {
                        candidates.extend(0..cols.len());
                    }

                    for pos in pick(candidates.len(), fanout, self.strategy, rng) {
                        let i = candidates[pos];
                        let neighbor = cols[i];
                        let neighbor_local = match local[src_type.index()].entry(neighbor) {
                            Entry::Occupied(e) => *e.get(),
                            Entry::Vacant(e) => {
                                let id = nodes[src_type.index()].len() as u32;
                                e.insert(id);
                                nodes[src_type.index()].push(neighbor);
                                next.push((src_type, neighbor, id));
                                id
                            }
                        };
                        edges[edge_type.index()].push((node_local, neighbor_local, edge_times[i]));
                    }
                }
            }
            frontier = next;
        }

        SeedTree { nodes, edges }
    }

    fn merge(&self, seed_type: NodeType, times: &[Timestamp], trees: &[SeedTree]) -> Subgraph {
        let graph = &*self.graph;
        let schema = graph.schema();
        let mut sub = Subgraph {
            seed_type,
            seed_time: times.to_vec(),
            nodes: schema
                .node_types
                .iter()
                .map(|m| NodeSet::new(m.feature_dim as usize, m.temporal))
                .collect(),
            edges: vec![EdgeSet::default(); schema.num_edge_types()],
        };

        for (k, tree) in trees.iter().enumerate() {
            sub.push_node(graph, seed_type, tree.nodes[seed_type.index()][0], k);
        }

        for (k, tree) in trees.iter().enumerate() {
            let offsets: Vec<u32> = sub.nodes.iter().map(|n| n.len() as u32).collect();
            for (t, ids) in tree.nodes.iter().enumerate() {
                let node_type = NodeType(t as u32);
                let skip = usize::from(node_type == seed_type);
                for &id in &ids[skip..] {
                    sub.push_node(graph, node_type, id, k);
                }
            }

            let to_batch = |node_type: NodeType, l: u32| -> u32 {
                if node_type != seed_type {
                    offsets[node_type.index()] + l
                } else if l == 0 {
                    k as u32
                } else {
                    offsets[node_type.index()] + l - 1
                }
            };
            for (e, tree_edges) in tree.edges.iter().enumerate() {
                let meta = &schema.edge_types[e];
                let out = &mut sub.edges[e];
                for &(d, s, t) in tree_edges {
                    out.dst.push(to_batch(meta.dst, d));
                    out.src.push(to_batch(meta.src, s));
                    out.time.push(t);
                }
            }
        }
        sub
    }
}

/// Positions (ascending) of the neighbors kept out of `n` visible ones.
fn pick(n: usize, fanout: usize, strategy: TemporalStrategy, rng: &mut SmallRng) -> Vec<usize> {
    if fanout == 0 || n == 0 {
        return Vec::new();
    }
    if n <= fanout {
        return (0..n).collect();
    }
    match strategy {
        TemporalStrategy::Last => (n - fanout..n).collect(),
        TemporalStrategy::Uniform => {
            let mut chosen = index::sample(rng, n, fanout).into_vec();
            chosen.sort_unstable();
            chosen
        }
    }
}

/// Error type for sampler operations.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("unknown node type index {0}")]
    UnknownNodeType(u32),

    #[error("{seeds} seeds but {times} seed times")]
    LengthMismatch { seeds: usize, times: usize },

    #[error("seed {node} out of range for node type '{node_type}' with {num_nodes} nodes")]
    SeedOutOfRange {
        node: u32,
        node_type: String,
        num_nodes: usize,
    },

    #[error("destination entity has no nodes to draw negatives from")]
    NoDestinations,

    #[error("failed to spawn prefetch thread: {0}")]
    Spawn(#[from] std::io::Error),
}
