//! Immutable, time-aware heterogeneous graph.
//!
//! One node type per entity table, one edge type per direction of every
//! foreign-key relation. Edge type `(src, rel, dst)` carries messages from
//! `src` nodes to `dst` nodes; its adjacency is stored as a [`TemporalCsr`]
//! keyed by the `dst` node, so expanding a `dst` node during sampling yields
//! the `src` nodes that point at it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{EdgeType, NodeType, TemporalCsr, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeMetadata {
    pub name: String,
    pub num_nodes: u32,
    /// Width of the dense feature vector of every node of this type.
    pub feature_dim: u32,
    /// Whether nodes of this type carry a creation time.
    pub temporal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTypeMetadata {
    pub src: NodeType,
    pub relation: String,
    pub dst: NodeType,
    pub num_edges: u64,
}

/// Node and edge types of a [`HeteroGraph`], indexed by [`NodeType`] / [`EdgeType`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub node_types: Vec<NodeTypeMetadata>,
    pub edge_types: Vec<EdgeTypeMetadata>,
}

impl GraphSchema {
    pub fn num_node_types(&self) -> usize {
        self.node_types.len()
    }

    pub fn num_edge_types(&self) -> usize {
        self.edge_types.len()
    }

    pub fn node_type(&self, name: &str) -> Option<NodeType> {
        self.node_types
            .iter()
            .position(|n| n.name == name)
            .map(|i| NodeType(i as u32))
    }

    pub fn node_meta(&self, node_type: NodeType) -> &NodeTypeMetadata {
        &self.node_types[node_type.index()]
    }

    pub fn edge_meta(&self, edge_type: EdgeType) -> &EdgeTypeMetadata {
        &self.edge_types[edge_type.index()]
    }

    /// Edge types whose messages arrive at `dst`.
    pub fn edge_types_into(&self, dst: NodeType) -> impl Iterator<Item = EdgeType> + '_ {
        self.edge_types
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.dst == dst)
            .map(|(i, _)| EdgeType(i as u32))
    }

    /// `"src__rel__dst"`, used for file names and logs.
    pub fn edge_type_name(&self, edge_type: EdgeType) -> String {
        let meta = self.edge_meta(edge_type);
        format!(
            "{}__{}__{}",
            self.node_types[meta.src.index()].name,
            meta.relation,
            self.node_types[meta.dst.index()].name
        )
    }
}

/// Dense features (row-major `[num_nodes, feature_dim]`) and optional node times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStore {
    pub features: Vec<f32>,
    pub times: Option<Vec<Timestamp>>,
}

#[derive(Debug)]
pub struct HeteroGraph {
    schema: GraphSchema,
    nodes: Vec<NodeStore>,
    adjacency: Vec<TemporalCsr>,
    incoming: Vec<Vec<EdgeType>>,
}

impl HeteroGraph {
    /// Assemble a graph from its parts, checking every size against the schema.
    pub fn new(
        schema: GraphSchema,
        nodes: Vec<NodeStore>,
        adjacency: Vec<TemporalCsr>,
    ) -> Result<Self, GraphError> {
        if nodes.len() != schema.num_node_types() {
            return Err(GraphError::Mismatch(format!(
                "{} node stores for {} node types",
                nodes.len(),
                schema.num_node_types()
            )));
        }
        if adjacency.len() != schema.num_edge_types() {
            return Err(GraphError::Mismatch(format!(
                "{} adjacency lists for {} edge types",
                adjacency.len(),
                schema.num_edge_types()
            )));
        }
        for (meta, store) in schema.node_types.iter().zip(&nodes) {
            if meta.feature_dim == 0 {
                return Err(GraphError::NoFeatures(meta.name.clone()));
            }
            let expected = meta.num_nodes as usize * meta.feature_dim as usize;
            if store.features.len() != expected {
                return Err(GraphError::Mismatch(format!(
                    "node type '{}': {} feature values, expected {expected}",
                    meta.name,
                    store.features.len()
                )));
            }
            match (&store.times, meta.temporal) {
                (Some(times), true) if times.len() == meta.num_nodes as usize => {}
                (None, false) => {}
                _ => {
                    return Err(GraphError::Mismatch(format!(
                        "node type '{}': node times do not match the schema",
                        meta.name
                    )));
                }
            }
        }
        for (i, (meta, csr)) in schema.edge_types.iter().zip(&adjacency).enumerate() {
            let num_dst = schema.node_types[meta.dst.index()].num_nodes as usize;
            let num_src = schema.node_types[meta.src.index()].num_nodes;
            if csr.row_ptr.len() != num_dst + 1 || csr.num_edges() as u64 != meta.num_edges {
                return Err(GraphError::Mismatch(format!(
                    "edge type {i}: csr has {} rows / {} edges, schema says {num_dst} / {}",
                    csr.num_nodes(),
                    csr.num_edges(),
                    meta.num_edges
                )));
            }
            if let Some(problem) = csr_layout_problem(csr) {
                return Err(GraphError::Mismatch(format!("edge type {i}: {problem}")));
            }
            if csr.col_idx.iter().any(|&c| c >= num_src) {
                return Err(GraphError::Mismatch(format!(
                    "edge type {i}: neighbor index out of range for {num_src} source nodes"
                )));
            }
        }

        let incoming = (0..schema.num_node_types())
            .map(|t| schema.edge_types_into(NodeType(t as u32)).collect())
            .collect();

        debug!(
            "HeteroGraph: {} node types, {} edge types",
            schema.num_node_types(),
            schema.num_edge_types()
        );

        Ok(Self {
            schema,
            nodes,
            adjacency,
            incoming,
        })
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    pub fn num_nodes(&self, node_type: NodeType) -> usize {
        self.schema.node_meta(node_type).num_nodes as usize
    }

    pub fn feature_dim(&self, node_type: NodeType) -> usize {
        self.schema.node_meta(node_type).feature_dim as usize
    }

    /// Feature vector of one node.
    pub fn features(&self, node_type: NodeType, node: u32) -> &[f32] {
        let dim = self.feature_dim(node_type);
        let start = node as usize * dim;
        &self.nodes[node_type.index()].features[start..start + dim]
    }

    pub fn node_store(&self, node_type: NodeType) -> &NodeStore {
        &self.nodes[node_type.index()]
    }

    /// Creation time of a node, if its type is temporal.
    pub fn node_time(&self, node_type: NodeType, node: u32) -> Option<Timestamp> {
        self.nodes[node_type.index()]
            .times
            .as_ref()
            .map(|t| t[node as usize])
    }

    pub fn adjacency(&self, edge_type: EdgeType) -> &TemporalCsr {
        &self.adjacency[edge_type.index()]
    }

    /// Edge types whose messages arrive at nodes of `node_type`.
    pub fn incoming(&self, node_type: NodeType) -> &[EdgeType] {
        &self.incoming[node_type.index()]
    }

    /// Source-side neighbors of `node` through `edge_type`, restricted to edges
    /// with `time <= max_time`, oldest first.
    pub fn neighbors(
        &self,
        node: u32,
        edge_type: EdgeType,
        max_time: Timestamp,
    ) -> (&[u32], &[Timestamp]) {
        self.adjacency[edge_type.index()].neighbors_until(node, max_time)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Incrementally assembles a [`HeteroGraph`] from entity tables and
/// foreign-key relations.
/// First structural defect of `csr`, if any: offsets must start at 0, never
/// decrease and end at the edge count, and every row must be time-sorted.
fn csr_layout_problem(csr: &TemporalCsr) -> Option<String> {
    if csr.edge_time.len() != csr.col_idx.len() {
        return Some(format!(
            "{} edge times for {} edges",
            csr.edge_time.len(),
            csr.col_idx.len()
        ));
    }
    if csr.row_ptr.first().is_some_and(|&start| start != 0) {
        return Some("row offsets do not start at 0".to_string());
    }
    if let Some(row) = csr.row_ptr.windows(2).position(|w| w[0] > w[1]) {
        return Some(format!("row offsets decrease at row {row}"));
    }
    if csr.row_ptr.last().is_some_and(|&end| end as usize != csr.col_idx.len()) {
        return Some(format!("row offsets end before {} edges", csr.col_idx.len()));
    }
    (0..csr.num_nodes() as u32)
        .find(|&row| csr.neighbors(row).1.windows(2).any(|w| w[0] > w[1]))
        .map(|row| format!("edge times of row {row} are not sorted"))
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    schema: GraphSchema,
    nodes: Vec<NodeStore>,
    edges: Vec<Vec<(u32, u32, Timestamp)>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity table. `features` is row-major `[num_nodes, feature_dim]`.
    pub fn add_node_type(
        &mut self,
        name: &str,
        feature_dim: usize,
        features: Vec<f32>,
        times: Option<Vec<Timestamp>>,
    ) -> Result<NodeType, GraphError> {
        if self.schema.node_type(name).is_some() {
            return Err(GraphError::Duplicate(name.to_string()));
        }
        if feature_dim == 0 {
            return Err(GraphError::NoFeatures(name.to_string()));
        }
        if features.len() % feature_dim != 0 {
            return Err(GraphError::Mismatch(format!(
                "node type '{name}': {} feature values is not a multiple of {feature_dim}",
                features.len()
            )));
        }
        let num_nodes = features.len() / feature_dim;
        self.schema.node_types.push(NodeTypeMetadata {
            name: name.to_string(),
            num_nodes: num_nodes as u32,
            feature_dim: feature_dim as u32,
            temporal: times.is_some(),
        });
        self.nodes.push(NodeStore { features, times });
        Ok(NodeType(self.schema.node_types.len() as u32 - 1))
    }

    /// Register a relation from `src` rows to `dst` rows given as
    /// `(src_node, dst_node, time)` links. Both directions become edge types:
    /// `(src, relation, dst)` and `(dst, rev_<relation>, src)`.
    pub fn add_relation(
        &mut self,
        src: NodeType,
        relation: &str,
        dst: NodeType,
        links: &[(u32, u32, Timestamp)],
    ) -> Result<(EdgeType, EdgeType), GraphError> {
        for &t in &[src, dst] {
            if t.index() >= self.schema.num_node_types() {
                return Err(GraphError::UnknownNodeType(t.0));
            }
        }
        let num_src = self.schema.node_meta(src).num_nodes;
        let num_dst = self.schema.node_meta(dst).num_nodes;
        if let Some(&(s, d, _)) = links.iter().find(|&&(s, d, _)| s >= num_src || d >= num_dst) {
            return Err(GraphError::Mismatch(format!(
                "relation '{relation}': link ({s}, {d}) out of range"
            )));
        }

        // Rows of the forward CSR are dst nodes; rows of the reverse CSR are src nodes.
        let forward = links.iter().map(|&(s, d, t)| (d, s, t)).collect();
        let reverse = links.to_vec();
        let fwd = self.push_edge_type(src, relation.to_string(), dst, forward);
        let rev = self.push_edge_type(dst, format!("rev_{relation}"), src, reverse);
        Ok((fwd, rev))
    }

    fn push_edge_type(
        &mut self,
        src: NodeType,
        relation: String,
        dst: NodeType,
        edges: Vec<(u32, u32, Timestamp)>,
    ) -> EdgeType {
        self.schema.edge_types.push(EdgeTypeMetadata {
            src,
            relation,
            dst,
            num_edges: edges.len() as u64,
        });
        self.edges.push(edges);
        EdgeType(self.schema.edge_types.len() as u32 - 1)
    }

    pub fn build(self) -> Result<HeteroGraph, GraphError> {
        let adjacency = self
            .schema
            .edge_types
            .iter()
            .zip(self.edges)
            .map(|(meta, edges)| {
                let rows = self.schema.node_types[meta.dst.index()].num_nodes as usize;
                TemporalCsr::from_edges(rows, edges)
            })
            .collect();
        HeteroGraph::new(self.schema, self.nodes, adjacency)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node type '{0}' registered twice")]
    Duplicate(String),

    #[error("node type '{0}' has no features")]
    NoFeatures(String),

    #[error("unknown node type index {0}")]
    UnknownNodeType(u32),

    #[error("graph size mismatch: {0}")]
    Mismatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_table_graph() -> HeteroGraph {
        let mut builder = GraphBuilder::new();
        let users = builder
            .add_node_type("users", 2, vec![0.0, 1.0, 2.0, 3.0], None)
            .unwrap();
        let items = builder
            .add_node_type("items", 1, vec![10.0, 11.0, 12.0], Some(vec![0, 5, 9]))
            .unwrap();
        builder
            .add_relation(users, "bought", items, &[(0, 1, 10), (0, 2, 20), (1, 1, 15)])
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_builder_adds_both_directions() {
        let graph = two_table_graph();
        let schema = graph.schema();
        assert_eq!(schema.num_edge_types(), 2);
        assert_eq!(schema.edge_type_name(EdgeType(0)), "users__bought__items");
        assert_eq!(schema.edge_type_name(EdgeType(1)), "items__rev_bought__users");

        let items = schema.node_type("items").unwrap();
        let users = schema.node_type("users").unwrap();
        assert_eq!(graph.incoming(items), &[EdgeType(0)]);
        assert_eq!(graph.incoming(users), &[EdgeType(1)]);

        // Item 1 was bought by users 0 (t=10) and 1 (t=15).
        let (buyers, times) = graph.neighbors(1, EdgeType(0), i64::MAX);
        assert_eq!(buyers, &[0, 1]);
        assert_eq!(times, &[10, 15]);

        // User 0 bought items 1 and 2, only item 1 by t=12.
        let (bought, _) = graph.neighbors(0, EdgeType(1), 12);
        assert_eq!(bought, &[1]);
    }

    #[test]
    fn test_feature_and_time_lookup() {
        let graph = two_table_graph();
        assert_eq!(graph.features(NodeType(0), 1), &[2.0, 3.0]);
        assert_eq!(graph.features(NodeType(1), 2), &[12.0]);
        assert_eq!(graph.node_time(NodeType(0), 0), None);
        assert_eq!(graph.node_time(NodeType(1), 1), Some(5));
    }

    #[test]
    fn test_rejects_out_of_range_links() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_node_type("a", 1, vec![0.0; 2], None).unwrap();
        let b = builder.add_node_type("b", 1, vec![0.0; 2], None).unwrap();
        let err = builder.add_relation(a, "r", b, &[(0, 2, 0)]).unwrap_err();
        assert!(matches!(err, GraphError::Mismatch(_)));
    }

    fn rebuild_with(graph: &HeteroGraph, edge_type: EdgeType, csr: TemporalCsr) -> Result<HeteroGraph, GraphError> {
        let nodes = (0..graph.schema().num_node_types())
            .map(|t| graph.node_store(NodeType(t as u32)).clone())
            .collect();
        let adjacency = (0..graph.schema().num_edge_types())
            .map(|e| {
                if e == edge_type.index() {
                    csr.clone()
                } else {
                    graph.adjacency(EdgeType(e as u32)).clone()
                }
            })
            .collect();
        HeteroGraph::new(graph.schema().clone(), nodes, adjacency)
    }

    #[test]
    fn test_rejects_corrupt_adjacency() {
        let graph = two_table_graph();
        // Edge type 0 has 3 rows (items) and 3 edges; item 1 holds two of them.
        let valid = graph.adjacency(EdgeType(0)).clone();
        assert_eq!(valid.row_ptr, vec![0, 0, 2, 3]);
        assert!(rebuild_with(&graph, EdgeType(0), valid.clone()).is_ok());

        let mut decreasing = valid.clone();
        decreasing.row_ptr = vec![0, 2, 1, 3];
        let err = rebuild_with(&graph, EdgeType(0), decreasing).unwrap_err();
        assert!(matches!(&err, GraphError::Mismatch(m) if m.contains("decrease")), "{err}");

        let mut unsorted = valid.clone();
        unsorted.edge_time.swap(0, 1);
        let err = rebuild_with(&graph, EdgeType(0), unsorted).unwrap_err();
        assert!(matches!(&err, GraphError::Mismatch(m) if m.contains("not sorted")), "{err}");

        let mut offset_start = valid.clone();
        offset_start.row_ptr = vec![1, 1, 2, 3];
        assert!(matches!(
            rebuild_with(&graph, EdgeType(0), offset_start),
            Err(GraphError::Mismatch(_))
        ));

        let mut short_times = valid;
        short_times.edge_time.pop();
        assert!(matches!(
            rebuild_with(&graph, EdgeType(0), short_times),
            Err(GraphError::Mismatch(_))
        ));
    }

    #[test]
    fn test_rejects_featureless_and_duplicate_types() {
        let mut builder = GraphBuilder::new();
        assert!(matches!(
            builder.add_node_type("a", 0, vec![], None),
            Err(GraphError::NoFeatures(_))
        ));
        builder.add_node_type("a", 1, vec![1.0], None).unwrap();
        assert!(matches!(
            builder.add_node_type("a", 1, vec![1.0], None),
            Err(GraphError::Duplicate(_))
        ));
    }
}
