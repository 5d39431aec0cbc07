//! Common types and constants used throughout the project.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Event times are stored as epoch seconds.
pub type Timestamp = i64;

/// Time carried by edges of relations that have no time column.
/// Such edges are visible from every seed time.
pub const TIMELESS: Timestamp = Timestamp::MIN;

/// Seconds per day, the unit of relative time fed to the temporal encoder.
pub const SECONDS_PER_DAY: f64 = 60.0 * 60.0 * 24.0;

// ============================================================================
// Index NewTypes
// ============================================================================
/// Node type (entity table) index in the graph schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeType(pub u32);

/// Edge type (directed relation) index in the graph schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeType(pub u32);

impl NodeType {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl EdgeType {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Splits
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// Offset mixed into RNG seeds so splits never share a random stream.
    pub(crate) fn seed_offset(self) -> u64 {
        match self {
            Split::Train => 0,
            Split::Val => 1,
            Split::Test => 2,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Temporal Sampling Strategy
// ============================================================================

/// How neighbors are picked among the edges visible at the seed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalStrategy {
    /// Uniformly at random, without replacement.
    #[default]
    Uniform,
    /// The most recent edges.
    Last,
}

impl FromStr for TemporalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uniform" => Ok(TemporalStrategy::Uniform),
            "last" => Ok(TemporalStrategy::Last),
            other => Err(format!("unknown temporal strategy '{other}' (expected uniform|last)")),
        }
    }
}

impl fmt::Display for TemporalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemporalStrategy::Uniform => f.write_str("uniform"),
            TemporalStrategy::Last => f.write_str("last"),
        }
    }
}

/// Per-layer fan-out, halved at every hop: `[base, base/2, base/4, ...]`.
pub fn fanout_schedule(base: usize, num_layers: usize) -> Vec<usize> {
    (0..num_layers)
        .map(|i| base.checked_shr(i as u32).unwrap_or(0))
        .collect()
}

/// Mix a sequence of integers into one RNG seed (splitmix64 finalizer per
/// step). Batch randomness is derived this way from `(seed, rank, epoch,
/// batch)` so a batch never depends on which thread builds it.
pub fn derive_seed(parts: &[u64]) -> u64 {
    parts.iter().fold(0x9E37_79B9_7F4A_7C15, |acc, &p| {
        let mut z = acc ^ p.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    })
}

// ============================================================================
// Topology
// ============================================================================

/// CSR adjacency of one edge type, keyed by the node that receives messages.
///
/// `row_ptr[i]..row_ptr[i+1]` indexes the neighbors of node `i` in `col_idx`
/// and their edge times in `edge_time`. Each neighbor list is sorted by edge
/// time (ascending), so the edges visible at a seed time are always a prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalCsr {
    pub row_ptr: Vec<u32>,
    pub col_idx: Vec<u32>,
    pub edge_time: Vec<Timestamp>,
}

impl TemporalCsr {
    /// Number of rows (receiving nodes).
    pub fn num_nodes(&self) -> usize {
        self.row_ptr.len().saturating_sub(1)
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.col_idx.len()
    }

    pub fn degree(&self, node: u32) -> u32 {
        self.row_ptr[node as usize + 1] - self.row_ptr[node as usize]
    }

    /// All neighbors of `node` with their edge times, oldest first.
    pub fn neighbors(&self, node: u32) -> (&[u32], &[Timestamp]) {
        let start = self.row_ptr[node as usize] as usize;
        let end = self.row_ptr[node as usize + 1] as usize;
        (&self.col_idx[start..end], &self.edge_time[start..end])
    }

    /// Neighbors of `node` reachable through edges with `time <= max_time`.
    pub fn neighbors_until(&self, node: u32, max_time: Timestamp) -> (&[u32], &[Timestamp]) {
        let (cols, times) = self.neighbors(node);
        let visible = times.partition_point(|&t| t <= max_time);
        (&cols[..visible], &times[..visible])
    }

    /// Build a CSR from `(row, col, time)` edges in any order.
    ///
    /// # Panics (debug builds)
    /// - If an edge references a row outside `0..num_nodes`.
    /// - If the number of edges exceeds `u32::MAX`.
    pub fn from_edges(num_nodes: usize, mut edges: Vec<(u32, u32, Timestamp)>) -> Self {
        debug_assert!(
            edges.iter().all(|&(row, _, _)| (row as usize) < num_nodes),
            "edge row out of range for {num_nodes} nodes"
        );
        debug_assert!(
            edges.len() <= u32::MAX as usize,
            "edge count {} exceeds u32::MAX",
            edges.len()
        );
        edges.sort_unstable_by_key(|&(row, col, time)| (row, time, col));

        let mut row_ptr = Vec::with_capacity(num_nodes + 1);
        let mut col_idx = Vec::with_capacity(edges.len());
        let mut edge_time = Vec::with_capacity(edges.len());
        let mut current_node = 0u32;
        row_ptr.push(0);

        for &(row, col, time) in &edges {
            // Fill in row_ptr entries for nodes with no edges.
            while current_node < row {
                row_ptr.push(col_idx.len() as u32);
                current_node += 1;
            }
            col_idx.push(col);
            edge_time.push(time);
        }

        // Pad trailing nodes that have no edges.
        while row_ptr.len() <= num_nodes {
            row_ptr.push(col_idx.len() as u32);
        }

        Self {
            row_ptr,
            col_idx,
            edge_time,
        }
    }

    /// Iterate `(row, col, time)` over every edge.
    pub fn edges(&self) -> impl Iterator<Item = (u32, u32, Timestamp)> + '_ {
        (0..self.num_nodes() as u32).flat_map(move |row| {
            let (cols, times) = self.neighbors(row);
            cols.iter().zip(times).map(move |(&c, &t)| (row, c, t))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_schedule_halves() {
        assert_eq!(fanout_schedule(160, 3), vec![160, 80, 40]);
        assert_eq!(fanout_schedule(5, 4), vec![5, 2, 1, 0]);
        assert!(fanout_schedule(10, 0).is_empty());
    }

    #[test]
    fn test_fanout_schedule_deep_stacks_reach_zero() {
        let schedule = fanout_schedule(8, 70);
        assert_eq!(schedule.len(), 70);
        assert_eq!(&schedule[..5], &[8, 4, 2, 1, 0]);
        assert_eq!(schedule[64..], [0; 6]);
        assert_eq!(fanout_schedule(usize::MAX, 65)[64], 0);
    }

    #[test]
    fn test_derive_seed_is_order_sensitive() {
        assert_eq!(derive_seed(&[42, 0, 1, 2]), derive_seed(&[42, 0, 1, 2]));
        assert_ne!(derive_seed(&[42, 0, 1, 2]), derive_seed(&[42, 0, 2, 1]));
        assert_ne!(derive_seed(&[42, 1, 1, 2]), derive_seed(&[42, 0, 1, 2]));
    }

    #[test]
    fn test_csr_sorted_by_time_and_padded() {
        let csr = TemporalCsr::from_edges(4, vec![(2, 7, 30), (0, 1, 5), (2, 8, 10), (2, 9, 20)]);
        assert_eq!(csr.num_nodes(), 4);
        assert_eq!(csr.num_edges(), 4);
        assert_eq!(csr.degree(1), 0);
        assert_eq!(csr.degree(3), 0);

        let (cols, times) = csr.neighbors(2);
        assert_eq!(cols, &[8, 9, 7]);
        assert_eq!(times, &[10, 20, 30]);
    }

    #[test]
    fn test_neighbors_until_is_prefix() {
        let csr = TemporalCsr::from_edges(1, vec![(0, 3, 30), (0, 1, 10), (0, 2, 20), (0, 4, TIMELESS)]);
        let (cols, _) = csr.neighbors_until(0, 20);
        assert_eq!(cols, &[4, 1, 2]);
        let (cols, _) = csr.neighbors_until(0, 9);
        assert_eq!(cols, &[4]);
        let (cols, _) = csr.neighbors_until(0, Timestamp::MAX);
        assert_eq!(cols.len(), 4);
    }

    #[test]
    fn test_edges_roundtrip_order() {
        let input = vec![(1, 0, 3), (0, 2, 1), (1, 1, 2)];
        let csr = TemporalCsr::from_edges(2, input);
        let edges: Vec<_> = csr.edges().collect();
        assert_eq!(edges, vec![(0, 2, 1), (1, 1, 2), (1, 0, 3)]);
    }

    #[test]
    fn test_temporal_strategy_parse() {
        assert_eq!("uniform".parse::<TemporalStrategy>(), Ok(TemporalStrategy::Uniform));
        assert_eq!("LAST".parse::<TemporalStrategy>(), Ok(TemporalStrategy::Last));
        assert!("recent".parse::<TemporalStrategy>().is_err());
    }
}
