//! Heterogeneous temporal GraphSAGE encoder.

use std::fmt;
use std::str::FromStr;

use burn::nn::{Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::TensorData;
use burn::tensor::activation::relu;
use catchment::common::{NodeType, SECONDS_PER_DAY};
use catchment::graph::GraphSchema;
use catchment::sampler::{EdgeSet, NodeSet, Subgraph};
use serde::{Deserialize, Serialize};

/// Produces one embedding per seed of a sampled subgraph.
pub trait Encoder<B: Backend> {
    /// Embeddings `[num_seeds, channels]` of the seeds of `subgraph`, which
    /// are nodes of `entity`.
    fn encode(&self, subgraph: &Subgraph, entity: NodeType, device: &B::Device) -> Tensor<B, 2>;

    /// A zero-valued scalar `[1]` that depends on every trainable parameter.
    ///
    /// Adding it to a loss gives every parameter a gradient, so workers whose
    /// batches reach different node and edge types still all-reduce the same
    /// gradient set.
    fn parameter_anchor(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::zeros([1], device)
    }
}

/// How neighbor messages of one edge type are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Aggregation::Sum),
            "mean" => Ok(Aggregation::Mean),
            other => Err(format!("unknown aggregation '{other}' (expected sum|mean)")),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Sum => f.write_str("sum"),
            Aggregation::Mean => f.write_str("mean"),
        }
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Width of every hidden representation and of the output embedding
    #[config(default = 128)]
    pub channels: usize,

    /// Number of message-passing layers (and sampling hops)
    #[config(default = 2)]
    pub num_layers: usize,

    /// Neighbor aggregation within an edge type
    #[config(default = "Aggregation::Sum")]
    pub aggr: Aggregation,

    /// Add a learned per-node embedding to the destination entity
    #[config(default = true)]
    pub use_shallow: bool,

    /// Width of the sinusoidal relative-time encoding (even)
    #[config(default = 16)]
    pub temporal_dim: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 {
            return Err("channels must be positive".into());
        }
        if self.temporal_dim == 0 || self.temporal_dim % 2 != 0 {
            return Err(format!("temporal_dim must be a positive even number, got {}", self.temporal_dim));
        }
        Ok(())
    }

    /// Returns an initialized model for graphs with `schema`. The shallow
    /// embedding, if enabled, covers every node of `shallow_entity`.
    pub fn init<B: Backend>(
        &self,
        schema: &GraphSchema,
        shallow_entity: NodeType,
        device: &B::Device,
    ) -> RelationalGnn<B> {
        let c = self.channels;
        let layers = (0..self.num_layers)
            .map(|_| HeteroSageLayer {
                convs: schema
                    .edge_types
                    .iter()
                    .map(|_| SageConv {
                        lin_neighbor: LinearConfig::new(c, c).init(device),
                        lin_root: LinearConfig::new(c, c).with_bias(false).init(device),
                    })
                    .collect(),
                norms: schema
                    .node_types
                    .iter()
                    .map(|_| LayerNormConfig::new(c).init(device))
                    .collect(),
            })
            .collect();

        RelationalGnn {
            encoders: schema
                .node_types
                .iter()
                .map(|m| LinearConfig::new(m.feature_dim as usize, c).init(device))
                .collect(),
            temporal_encoders: schema
                .node_types
                .iter()
                .map(|m| m.temporal.then(|| LinearConfig::new(self.temporal_dim, c).init(device)))
                .collect(),
            shallow: self.use_shallow.then(|| {
                EmbeddingConfig::new(schema.node_meta(shallow_entity).num_nodes as usize, c).init(device)
            }),
            layers,
            head: LinearConfig::new(c, c).init(device),
            feature_dims: schema.node_types.iter().map(|m| m.feature_dim as usize).collect(),
            edge_src: schema.edge_types.iter().map(|e| e.src.index()).collect(),
            edge_dst: schema.edge_types.iter().map(|e| e.dst.index()).collect(),
            shallow_type: shallow_entity.index(),
            mean_aggr: self.aggr == Aggregation::Mean,
            channels: c,
            temporal_dim: self.temporal_dim,
        }
    }
}

/// GraphSAGE convolution for one edge type: `lin_neighbor(aggr(x_src)) + lin_root(x_dst)`.
#[derive(Module, Debug)]
pub struct SageConv<B: Backend> {
    lin_neighbor: Linear<B>,
    lin_root: Linear<B>,
}

/// One round of message passing over every edge type, summed per destination
/// type, followed by per-type layer norm and ReLU.
#[derive(Module, Debug)]
pub struct HeteroSageLayer<B: Backend> {
    convs: Vec<SageConv<B>>, // one per edge type
    norms: Vec<LayerNorm<B>>, // one per node type
}

impl<B: Backend> HeteroSageLayer<B> {
    fn forward(
        &self,
        x: Vec<Option<Tensor<B, 2>>>,
        subgraph: &Subgraph,
        model: &RelationalGnn<B>,
        device: &B::Device,
    ) -> Vec<Option<Tensor<B, 2>>> {
        let mut out: Vec<Option<Tensor<B, 2>>> = vec![None; x.len()];
        for (e, conv) in self.convs.iter().enumerate() {
            let (src, dst) = (model.edge_src[e], model.edge_dst[e]);
            let Some(x_dst) = &x[dst] else { continue };

            let mut msg = conv.lin_root.forward(x_dst.clone());
            let edges = &subgraph.edges[e];
            if let (Some(x_src), false) = (&x[src], edges.is_empty()) {
                let num_dst = x_dst.dims()[0];
                let agg = aggregate(x_src.clone(), edges, num_dst, model.mean_aggr, device);
                msg = msg + conv.lin_neighbor.forward(agg);
            }
            out[dst] = Some(match out[dst].take() {
                Some(acc) => acc + msg,
                None => msg,
            });
        }

        // Node types without incoming edge types keep their representation.
        out.into_iter()
            .zip(x)
            .zip(&self.norms)
            .map(|((o, prev), norm)| o.or(prev).map(|h| relu(norm.forward(h))))
            .collect()
    }
}

#[derive(Module, Debug)]
pub struct RelationalGnn<B: Backend> {
    // Per node type
    encoders: Vec<Linear<B>>,
    temporal_encoders: Vec<Option<Linear<B>>>,

    // Learned embedding table for the destination entity
    shallow: Option<Embedding<B>>,

    layers: Vec<HeteroSageLayer<B>>,
    head: Linear<B>,

    // Graph layout: input width of every node type, source / destination
    // node type of every edge type
    feature_dims: Vec<usize>,
    edge_src: Vec<usize>,
    edge_dst: Vec<usize>,
    shallow_type: usize,
    mean_aggr: bool,
    channels: usize,
    temporal_dim: usize,
}

impl<B: Backend> RelationalGnn<B> {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn encode_nodes(&self, subgraph: &Subgraph, t: usize, set: &NodeSet, device: &B::Device) -> Option<Tensor<B, 2>> {
        if set.is_empty() {
            return None;
        }
        let n = set.len();
        let features = Tensor::from_data(TensorData::new(set.features.clone(), [n, set.feature_dim]), device);
        let mut h = self.encoders[t].forward(features);

        if let (Some(encoder), Some(times)) = (&self.temporal_encoders[t], &set.times) {
            let rel_days: Vec<f32> = times
                .iter()
                .zip(&set.batch)
                .map(|(&node_time, &seed)| {
                    ((subgraph.seed_time[seed as usize] - node_time) as f64 / SECONDS_PER_DAY) as f32
                })
                .collect();
            let pe = sinusoidal_encoding(&rel_days, self.temporal_dim);
            h = h + encoder.forward(Tensor::from_data(TensorData::new(pe, [n, self.temporal_dim]), device));
        }

        if let Some(shallow) = &self.shallow
            && t == self.shallow_type
        {
            let ids: Vec<i64> = set.ids.iter().map(|&i| i64::from(i)).collect();
            let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [1, n]), device);
            h = h + shallow.forward(ids).reshape([n, self.channels]);
        }
        Some(h)
    }
}

impl<B: Backend> Encoder<B> for RelationalGnn<B> {
    fn encode(&self, subgraph: &Subgraph, entity: NodeType, device: &B::Device) -> Tensor<B, 2> {
        debug_assert_eq!(entity, subgraph.seed_type, "seeds must be nodes of the encoded entity");
        let mut x: Vec<Option<Tensor<B, 2>>> = subgraph
            .nodes
            .iter()
            .enumerate()
            .map(|(t, set)| self.encode_nodes(subgraph, t, set, device))
            .collect();
        for layer in &self.layers {
            x = layer.forward(x, subgraph, self, device);
        }

        match x.swap_remove(entity.index()) {
            Some(h) => self.head.forward(h.slice([0..subgraph.num_seeds()])),
            None => Tensor::zeros([0, self.channels], device),
        }
    }

    fn parameter_anchor(&self, device: &B::Device) -> Tensor<B, 1> {
        let hidden = || Tensor::<B, 2>::zeros([1, self.channels], device);
        let mut outputs = Vec::new();
        for (encoder, &dim) in self.encoders.iter().zip(&self.feature_dims) {
            outputs.push(encoder.forward(Tensor::zeros([1, dim], device)));
        }
        for encoder in self.temporal_encoders.iter().flatten() {
            outputs.push(encoder.forward(Tensor::zeros([1, self.temporal_dim], device)));
        }
        if let Some(shallow) = &self.shallow {
            let first = Tensor::<B, 2, Int>::zeros([1, 1], device);
            outputs.push(shallow.forward(first).reshape([1, self.channels]));
        }
        for layer in &self.layers {
            for conv in &layer.convs {
                outputs.push(conv.lin_neighbor.forward(hidden()));
                outputs.push(conv.lin_root.forward(hidden()));
            }
            for norm in &layer.norms {
                outputs.push(norm.forward(hidden()));
            }
        }
        outputs.push(self.head.forward(hidden()));
        Tensor::cat(outputs, 1).sum().mul_scalar(0.0)
    }
}

/// Sum (or mean) of source representations per destination row.
///
/// Neighbor lists are padded to the largest in-degree with the index of an
/// appended zero row, so the gather and reduction stay dense.
fn aggregate<B: Backend>(
    x_src: Tensor<B, 2>,
    edges: &EdgeSet,
    num_dst: usize,
    mean: bool,
    device: &B::Device,
) -> Tensor<B, 2> {
    let [num_src, channels] = x_src.dims();
    let (index, width) = edges.padded_neighbors(num_dst, num_src as u32);
    let padded = Tensor::cat(vec![x_src, Tensor::zeros([1, channels], device)], 0);
    let index: Vec<i64> = index.into_iter().map(i64::from).collect();
    let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [num_dst * width]), device);
    let summed = padded
        .select(0, index)
        .reshape([num_dst, width, channels])
        .sum_dim(1)
        .reshape([num_dst, channels]);
    if !mean {
        return summed;
    }
    let inv_degree: Vec<f32> = edges
        .in_degree(num_dst)
        .into_iter()
        .map(|d| 1.0 / d.max(1) as f32)
        .collect();
    let inv_degree = Tensor::<B, 2>::from_data(TensorData::new(inv_degree, [num_dst, 1]), device);
    summed * inv_degree.repeat_dim(1, channels)
}

/// `[sin(t·ω_0), cos(t·ω_0), sin(t·ω_1), ...]` per value, with
/// `ω_i = 10000^(-2i/dim)`. Row-major `[values.len(), dim]`.
pub fn sinusoidal_encoding(values: &[f32], dim: usize) -> Vec<f32> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| 10000f32.powf(-(2.0 * i as f32) / dim as f32))
        .collect();
    let mut out = Vec::with_capacity(values.len() * dim);
    for &v in values {
        for &w in &freqs {
            out.push((v * w).sin());
            out.push((v * w).cos());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use catchment::common::{TIMELESS, TemporalStrategy};
    use catchment::graph::{GraphBuilder, HeteroGraph};
    use catchment::sampler::NeighborSampler;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::sync::Arc;

    type TB = NdArray;

    fn graph() -> Arc<HeteroGraph> {
        let mut b = GraphBuilder::new();
        let users = b.add_node_type("users", 2, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], None).unwrap();
        let items = b
            .add_node_type("items", 3, (0..12).map(|x| x as f32 / 10.0).collect(), Some(vec![0, 1, 2, 3]))
            .unwrap();
        b.add_relation(users, "bought", items, &[(0, 1, 5), (1, 2, 6), (2, 3, 7), (0, 0, 8)])
            .unwrap();
        b.add_relation(users, "follows", users, &[(0, 1, TIMELESS)]).unwrap();
        Arc::new(b.build().unwrap())
    }

    fn subgraph(seed_type: NodeType, seeds: &[u32]) -> Subgraph {
        let sampler = NeighborSampler::new(graph(), vec![4, 2], TemporalStrategy::Uniform);
        let times = vec![10; seeds.len()];
        sampler
            .sample(seed_type, seeds, &times, &mut SmallRng::seed_from_u64(1))
            .unwrap()
    }

    #[test]
    fn test_encode_shape() {
        let device = Default::default();
        let g = graph();
        for aggr in [Aggregation::Sum, Aggregation::Mean] {
            let config = ModelConfig::new().with_channels(8).with_aggr(aggr);
            let model: RelationalGnn<TB> = config.init(g.schema(), NodeType(1), &device);
            let sub = subgraph(NodeType(1), &[0, 3, 3]);
            let out = model.encode(&sub, NodeType(1), &device);
            assert_eq!(out.dims(), [3, 8]);
            let sub = subgraph(NodeType(0), &[2]);
            assert_eq!(model.encode(&sub, NodeType(0), &device).dims(), [1, 8]);
        }
    }

    #[test]
    fn test_parameter_anchor_reaches_every_parameter() {
        use burn::backend::Autodiff;
        use burn::optim::GradientsParams;

        type AB = Autodiff<NdArray>;

        let device = Default::default();
        let g = graph();
        let model: RelationalGnn<AB> = ModelConfig::new().with_channels(4).init(g.schema(), NodeType(1), &device);

        // Item 3 has no purchase visible at t=4, so no users are sampled.
        let sampler = NeighborSampler::new(g, vec![4, 2], TemporalStrategy::Uniform);
        let sub = sampler
            .sample(NodeType(1), &[3], &[4], &mut SmallRng::seed_from_u64(1))
            .unwrap();
        assert!(sub.nodes[0].is_empty());

        let user_encoder = model.encoders[0].weight.id;
        let neighbor = model.layers[0].convs[0].lin_neighbor.weight.id;
        let loss = model.encode(&sub, NodeType(1), &device).sum();

        let partial = GradientsParams::from_grads(loss.clone().backward(), &model);
        assert!(partial.get::<NdArray, 2>(user_encoder).is_none());
        assert!(partial.get::<NdArray, 2>(neighbor).is_none());

        let anchor = model.parameter_anchor(&device);
        assert_eq!(anchor.clone().into_scalar(), 0.0);
        let full = GradientsParams::from_grads((loss + anchor).backward(), &model);
        assert!(full.get::<NdArray, 2>(user_encoder).is_some());
        assert!(full.get::<NdArray, 2>(neighbor).is_some());
        assert!(full.len() > partial.len());
    }

    #[test]
    fn test_aggregate_sum_and_mean() {
        let device = Default::default();
        let x_src = Tensor::<TB, 2>::from_floats([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]], &device);
        // dst 0 <- {0, 2}, dst 1 <- {}, dst 2 <- {1}
        let edges = EdgeSet {
            src: vec![0, 2, 1],
            dst: vec![0, 0, 2],
            time: vec![0; 3],
        };
        let sum = aggregate(x_src.clone(), &edges, 3, false, &device);
        let sum: Vec<f32> = sum.into_data().to_vec().unwrap();
        assert_eq!(sum, vec![6.0, 8.0, 0.0, 0.0, 3.0, 4.0]);

        let mean = aggregate(x_src, &edges, 3, true, &device);
        let mean: Vec<f32> = mean.into_data().to_vec().unwrap();
        assert_eq!(mean, vec![3.0, 4.0, 0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_sinusoidal_encoding() {
        let pe = sinusoidal_encoding(&[0.0, 1.0], 4);
        assert_eq!(pe.len(), 8);
        assert_eq!(&pe[..4], &[0.0, 1.0, 0.0, 1.0]);
        assert!((pe[4] - 1f32.sin()).abs() < 1e-6);
        assert!((pe[6] - 0.01f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_config_validation_and_parse() {
        assert!(ModelConfig::new().validate().is_ok());
        assert!(ModelConfig::new().with_temporal_dim(3).validate().is_err());
        assert_eq!("MEAN".parse::<Aggregation>(), Ok(Aggregation::Mean));
        assert!("max".parse::<Aggregation>().is_err());
    }
}
