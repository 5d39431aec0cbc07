//! Top-k retrieval over all destination nodes.

use std::cmp::Ordering;

use burn::prelude::*;
use catchment::loader::NodeLoader;
use indicatif::ProgressBar;
use rayon::prelude::*;
use tracing::debug;

use crate::error::TrainError;
use crate::model::Encoder;

/// Row-major `[rows, k]` matrix of predicted destination indices, best first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionMatrix {
    rows: usize,
    k: usize,
    indices: Vec<u32>,
}

impl PredictionMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn row(&self, i: usize) -> &[u32] {
        &self.indices[i * self.k..(i + 1) * self.k]
    }
}

/// Embeddings of every seed `loader` yields, concatenated in loader order.
pub fn embed_nodes<B: Backend, M: Encoder<B>>(
    model: &M,
    loader: &NodeLoader,
    channels: usize,
    device: &B::Device,
    progress: &ProgressBar,
) -> Result<Tensor<B, 2>, TrainError> {
    let mut chunks = Vec::with_capacity(loader.num_batches());
    for batch in loader.iter()? {
        let batch = batch?;
        chunks.push(model.encode(&batch.subgraph, batch.subgraph.seed_type, device));
        progress.inc(1);
    }
    if chunks.is_empty() {
        return Ok(Tensor::zeros([0, channels], device));
    }
    Ok(Tensor::cat(chunks, 0))
}

/// Top-`k` destinations of every source seed of `src_loader`, scored by dot
/// product against every destination of `dst_loader`.
pub fn predict_top_k<B: Backend, M: Encoder<B>>(
    model: &M,
    src_loader: &NodeLoader,
    dst_loader: &NodeLoader,
    k: usize,
    channels: usize,
    device: &B::Device,
    progress: &ProgressBar,
) -> Result<PredictionMatrix, TrainError> {
    let num_dst = dst_loader.num_nodes();
    if k == 0 || k > num_dst {
        return Err(TrainError::Config(format!(
            "cannot take top-{k} of {num_dst} destination nodes"
        )));
    }

    let x_dst = embed_nodes(model, dst_loader, channels, device, progress)?;
    debug!("predict_top_k: embedded {num_dst} destinations");

    let mut indices = Vec::with_capacity(src_loader.num_nodes() * k);
    for batch in src_loader.iter()? {
        let batch = batch?;
        let x_src = model.encode(&batch.subgraph, batch.subgraph.seed_type, device);
        indices.extend(top_k_by_dot(x_src, x_dst.clone(), k)?);
        progress.inc(1);
    }
    Ok(PredictionMatrix {
        rows: indices.len() / k,
        k,
        indices,
    })
}

/// Row-major top-`k` destination indices of `x_src · x_dstᵀ`.
pub fn top_k_by_dot<B: Backend>(x_src: Tensor<B, 2>, x_dst: Tensor<B, 2>, k: usize) -> Result<Vec<u32>, TrainError> {
    let num_dst = x_dst.dims()[0];
    let scores: Vec<f32> = x_src
        .matmul(x_dst.transpose())
        .into_data()
        .to_vec()
        .map_err(|e| TrainError::Data(format!("{e:?}")))?;
    Ok(top_k_rows(&scores, num_dst, k))
}

/// Per row of a row-major score matrix, the indices of the `k` largest scores
/// in descending order. Equal scores rank the lower index first.
pub fn top_k_rows(scores: &[f32], num_cols: usize, k: usize) -> Vec<u32> {
    if num_cols == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(num_cols);
    scores
        .par_chunks(num_cols)
        .flat_map_iter(|row| {
            let by_score = |a: &u32, b: &u32| -> Ordering {
                row[*b as usize].total_cmp(&row[*a as usize]).then(a.cmp(b))
            };
            let mut order: Vec<u32> = (0..num_cols as u32).collect();
            if k < num_cols {
                order.select_nth_unstable_by(k - 1, by_score);
                order.truncate(k);
            }
            order.sort_unstable_by(by_score);
            order
        })
        .collect()
}
