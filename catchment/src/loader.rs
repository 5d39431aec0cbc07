//! Mini-batch loaders for training (link batches) and evaluation (node batches).
//!
//! A loader turns its examples into an ordered batch plan per epoch and
//! builds each batch from an RNG seeded by `(seed, rank, epoch, batch)`.
//! Batches are produced lazily, either inline or by a background producer
//! that stays `num_prefetch` batches ahead through a bounded channel. Both
//! paths yield identical batches in identical order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand::seq::index;
use tracing::{debug, info, warn};

use crate::common::{NodeType, Split, Timestamp, derive_seed};
use crate::sampler::{NeighborSampler, SamplerError, Subgraph};
use crate::task::LinkExample;

// ============================================================================
// Prefetching Batch Iterator
// ============================================================================

type BuildFn<T> = Arc<dyn Fn(usize) -> Result<T, SamplerError> + Send + Sync>;

enum Source<T> {
    Inline { build: BuildFn<T>, next: usize },
    Prefetch {
        rx: Receiver<Result<T, SamplerError>>,
        shutdown: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    },
}

/// Finite iterator over the batches `build(0..num_batches)`.
pub struct Batches<T> {
    num_batches: usize,
    source: Source<T>,
}

impl<T: Send + 'static> Batches<T> {
    fn new(
        name: &str,
        num_batches: usize,
        num_prefetch: usize,
        build: BuildFn<T>,
    ) -> Result<Self, SamplerError> {
        if num_prefetch == 0 {
            return Ok(Self {
                num_batches,
                source: Source::Inline { build, next: 0 },
            });
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(num_prefetch);
        let stop = Arc::clone(&shutdown);
        let thread_name = format!("loader-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("Producer {thread_name} started");
                for idx in 0..num_batches {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let batch = build(idx);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
                debug!("Producer {thread_name} exiting");
            })?;

        Ok(Self {
            num_batches,
            source: Source::Prefetch {
                rx,
                shutdown,
                handle: Some(handle),
            },
        })
    }
}

impl<T> Batches<T> {
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl<T> Iterator for Batches<T> {
    type Item = Result<T, SamplerError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Inline { build, next } => {
                if *next >= self.num_batches {
                    return None;
                }
                let batch = build(*next);
                *next += 1;
                Some(batch)
            }
            Source::Prefetch { rx, .. } => rx.recv().ok(),
        }
    }
}

impl<T> Drop for Batches<T> {
    fn drop(&mut self) {
        if let Source::Prefetch {
            rx,
            shutdown,
            handle,
        } = &mut self.source
        {
            shutdown.store(true, Ordering::SeqCst);
            // Drain until the producer drops its sender, so it never blocks on a full channel.
            while rx.recv().is_ok() {}
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

// ============================================================================
// Link Loader (training)
// ============================================================================

/// Configuration for [`LinkLoader`].
#[derive(Debug, Clone)]
pub struct LinkLoaderConfig {
    /// Examples per batch.
    pub batch_size: usize,
    /// Group batches by seed time and share negatives within a batch.
    pub shared_time: bool,
    /// RNG seed for shuffling and sampling.
    pub seed: u64,
    /// This worker's rank; mixed into every batch seed.
    pub rank: usize,
    /// Cap on batches per epoch.
    pub max_steps: usize,
    /// Batches built ahead on a background thread (0 = build inline).
    pub num_prefetch: usize,
}

impl Default for LinkLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            shared_time: true,
            seed: 42,
            rank: 0,
            max_steps: 2000,
            num_prefetch: 0,
        }
    }
}

/// One training batch. `src`, `pos_dst` and `neg_dst` hold one seed per
/// example (same order). In shared-time mode every seed time is equal and
/// `neg_dst` holds the batch's shared negatives.
#[derive(Debug, Clone)]
pub struct LinkBatch {
    pub src: Subgraph,
    pub pos_dst: Subgraph,
    pub neg_dst: Subgraph,
    pub times: Vec<Timestamp>,
    pub shared_time: bool,
}

impl LinkBatch {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Training loader over one worker's shard of link examples.
#[derive(Debug, Clone)]
pub struct LinkLoader {
    sampler: Arc<NeighborSampler>,
    examples: Arc<[LinkExample]>,
    src_type: NodeType,
    dst_type: NodeType,
    num_dst_nodes: u32,
    config: LinkLoaderConfig,
}

impl LinkLoader {
    pub fn new(
        sampler: Arc<NeighborSampler>,
        examples: Arc<[LinkExample]>,
        src_type: NodeType,
        dst_type: NodeType,
        config: LinkLoaderConfig,
    ) -> Result<Self, SamplerError> {
        let schema = sampler.graph().schema();
        for t in [src_type, dst_type] {
            if t.index() >= schema.num_node_types() {
                return Err(SamplerError::UnknownNodeType(t.0));
            }
        }
        let num_dst_nodes = sampler.graph().num_nodes(dst_type) as u32;
        if num_dst_nodes == 0 {
            return Err(SamplerError::NoDestinations);
        }
        if examples.is_empty() {
            warn!("LinkLoader: rank {} has an empty shard", config.rank);
        }
        info!(
            "LinkLoader: rank={}, examples={}, batches/epoch={}, shared_time={}",
            config.rank,
            examples.len(),
            count_batches(&examples, config.batch_size, config.shared_time).min(config.max_steps),
            config.shared_time
        );
        Ok(Self {
            sampler,
            examples,
            src_type,
            dst_type,
            num_dst_nodes,
            config,
        })
    }

    pub fn config(&self) -> &LinkLoaderConfig {
        &self.config
    }

    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }

    /// Batches per epoch before the `max_steps` cap.
    pub fn num_batches(&self) -> usize {
        count_batches(&self.examples, self.config.batch_size, self.config.shared_time)
    }

    /// Example indices of every batch of `epoch`, in emission order.
    pub fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let batch_size = self.config.batch_size.max(1);
        let mut rng = SmallRng::seed_from_u64(derive_seed(&[
            self.config.seed,
            self.config.rank as u64,
            epoch as u64,
        ]));

        let mut batches = Vec::new();
        if self.config.shared_time {
            for mut group in group_by_time(&self.examples).into_values() {
                group.shuffle(&mut rng);
                batches.extend(group.chunks(batch_size).map(<[usize]>::to_vec));
            }
            // Over the step cap, keep a random subset of batches. Emission stays
            // in ascending time order.
            if batches.len() > self.config.max_steps {
                let mut keep = index::sample(&mut rng, batches.len(), self.config.max_steps).into_vec();
                keep.sort_unstable();
                batches = keep.into_iter().map(|i| std::mem::take(&mut batches[i])).collect();
            }
        } else {
            let mut order: Vec<usize> = (0..self.examples.len()).collect();
            order.shuffle(&mut rng);
            batches.extend(order.chunks(batch_size).map(<[usize]>::to_vec));
        }
        batches.truncate(self.config.max_steps);
        batches
    }

    /// Lazy iterator over the batches of `epoch`, at most `steps` of them.
    pub fn epoch(&self, epoch: usize, steps: usize) -> Result<Batches<LinkBatch>, SamplerError> {
        let mut plan = self.plan(epoch);
        plan.truncate(steps);
        debug!("LinkLoader: epoch {epoch}, {} batches", plan.len());

        let plan = Arc::new(plan);
        let num_batches = plan.len();
        let loader = self.clone();
        let build: BuildFn<LinkBatch> = Arc::new(move |idx| loader.build_batch(epoch, idx, &plan[idx]));
        Batches::new(
            &format!("link-{}", self.config.rank),
            num_batches,
            self.config.num_prefetch,
            build,
        )
    }

    fn build_batch(&self, epoch: usize, idx: usize, members: &[usize]) -> Result<LinkBatch, SamplerError> {
        let mut rng = SmallRng::seed_from_u64(derive_seed(&[
            self.config.seed,
            self.config.rank as u64,
            epoch as u64,
            idx as u64,
        ]));

        let examples: Vec<LinkExample> = members.iter().map(|&i| self.examples[i]).collect();
        let src: Vec<u32> = examples.iter().map(|e| e.src).collect();
        let pos: Vec<u32> = examples.iter().map(|e| e.dst).collect();
        let times: Vec<Timestamp> = examples.iter().map(|e| e.time).collect();
        let neg: Vec<u32> = (0..examples.len())
            .map(|_| rng.random_range(0..self.num_dst_nodes))
            .collect();

        // Negatives are anchored at the batch time (shared) or their example's time.
        let neg_times = if self.config.shared_time {
            vec![times.first().copied().unwrap_or_default(); neg.len()]
        } else {
            times.clone()
        };

        let src = self.sampler.sample(self.src_type, &src, &times, &mut rng)?;
        let pos_dst = self.sampler.sample(self.dst_type, &pos, &times, &mut rng)?;
        let neg_dst = self.sampler.sample(self.dst_type, &neg, &neg_times, &mut rng)?;
        Ok(LinkBatch {
            src,
            pos_dst,
            neg_dst,
            times,
            shared_time: self.config.shared_time,
        })
    }
}

fn group_by_time(examples: &[LinkExample]) -> BTreeMap<Timestamp, Vec<usize>> {
    let mut groups: BTreeMap<Timestamp, Vec<usize>> = BTreeMap::new();
    for (i, ex) in examples.iter().enumerate() {
        groups.entry(ex.time).or_default().push(i);
    }
    groups
}

/// Batches an epoch over `examples` yields, ignoring the step cap.
pub fn count_batches(examples: &[LinkExample], batch_size: usize, shared_time: bool) -> usize {
    let batch_size = batch_size.max(1);
    if shared_time {
        group_by_time(examples)
            .values()
            .map(|g| g.len().div_ceil(batch_size))
            .sum()
    } else {
        examples.len().div_ceil(batch_size)
    }
}

// ============================================================================
// Node Loader (evaluation)
// ============================================================================

/// Configuration for [`NodeLoader`].
#[derive(Debug, Clone)]
pub struct NodeLoaderConfig {
    pub batch_size: usize,
    pub seed: u64,
    pub num_prefetch: usize,
}

impl Default for NodeLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            seed: 42,
            num_prefetch: 0,
        }
    }
}

/// Seeds of one evaluation batch and their sampled neighborhood.
#[derive(Debug, Clone)]
pub struct NodeBatch {
    pub ids: Vec<u32>,
    pub subgraph: Subgraph,
}

/// Ordered, full-coverage loader over a fixed list of nodes, all seeded at one
/// time. Repeated passes produce identical batches.
#[derive(Debug, Clone)]
pub struct NodeLoader {
    sampler: Arc<NeighborSampler>,
    node_type: NodeType,
    ids: Arc<[u32]>,
    time: Timestamp,
    split: Split,
    config: NodeLoaderConfig,
}

impl NodeLoader {
    pub fn new(
        sampler: Arc<NeighborSampler>,
        node_type: NodeType,
        ids: Arc<[u32]>,
        time: Timestamp,
        split: Split,
        config: NodeLoaderConfig,
    ) -> Result<Self, SamplerError> {
        if node_type.index() >= sampler.graph().schema().num_node_types() {
            return Err(SamplerError::UnknownNodeType(node_type.0));
        }
        Ok(Self {
            sampler,
            node_type,
            ids,
            time,
            split,
            config,
        })
    }

    /// Loader over every node of `node_type`, in id order.
    pub fn all_nodes(
        sampler: Arc<NeighborSampler>,
        node_type: NodeType,
        time: Timestamp,
        split: Split,
        config: NodeLoaderConfig,
    ) -> Result<Self, SamplerError> {
        if node_type.index() >= sampler.graph().schema().num_node_types() {
            return Err(SamplerError::UnknownNodeType(node_type.0));
        }
        let ids: Arc<[u32]> = (0..sampler.graph().num_nodes(node_type) as u32).collect();
        Self::new(sampler, node_type, ids, time, split, config)
    }

    pub fn num_nodes(&self) -> usize {
        self.ids.len()
    }

    pub fn num_batches(&self) -> usize {
        self.ids.len().div_ceil(self.config.batch_size.max(1))
    }

    pub fn iter(&self) -> Result<Batches<NodeBatch>, SamplerError> {
        let loader = self.clone();
        let build: BuildFn<NodeBatch> = Arc::new(move |idx| loader.build_batch(idx));
        Batches::new(
            &format!("nodes-{}", self.split),
            self.num_batches(),
            self.config.num_prefetch,
            build,
        )
    }

    fn build_batch(&self, idx: usize) -> Result<NodeBatch, SamplerError> {
        let batch_size = self.config.batch_size.max(1);
        let start = idx * batch_size;
        let end = (start + batch_size).min(self.ids.len());
        let ids = self.ids[start..end].to_vec();
        let times = vec![self.time; ids.len()];
        let mut rng = SmallRng::seed_from_u64(derive_seed(&[
            self.config.seed,
            self.split.seed_offset(),
            u64::from(self.node_type.0),
            idx as u64,
        ]));
        let subgraph = self.sampler.sample(self.node_type, &ids, &times, &mut rng)?;
        Ok(NodeBatch { ids, subgraph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TemporalStrategy;
    use crate::graph::{GraphBuilder, HeteroGraph};

    fn graph() -> Arc<HeteroGraph> {
        let mut b = GraphBuilder::new();
        let users = b.add_node_type("users", 1, vec![0.0; 6], None).unwrap();
        let items = b.add_node_type("items", 1, vec![0.0; 5], None).unwrap();
        let links: Vec<_> = (0..6u32)
            .flat_map(|u| (0..5u32).map(move |i| (u, i, (u * 5 + i) as i64)))
            .collect();
        b.add_relation(users, "bought", items, &links).unwrap();
        Arc::new(b.build().unwrap())
    }

    fn examples() -> Arc<[LinkExample]> {
        (0..20u32)
            .map(|i| LinkExample {
                src: i % 6,
                dst: i % 5,
                time: 100 + (i % 3) as i64 * 10,
            })
            .collect()
    }

    fn loader(shared_time: bool, num_prefetch: usize) -> LinkLoader {
        let sampler = Arc::new(NeighborSampler::new(graph(), vec![3, 2], TemporalStrategy::Uniform));
        let config = LinkLoaderConfig {
            batch_size: 4,
            shared_time,
            num_prefetch,
            max_steps: 100,
            ..Default::default()
        };
        LinkLoader::new(sampler, examples(), NodeType(0), NodeType(1), config).unwrap()
    }

    #[test]
    fn test_shared_time_batches_have_one_time() {
        let loader = loader(true, 0);
        // Times 100/110/120 with 7/7/6 examples -> 2+2+2 batches.
        assert_eq!(loader.num_batches(), 6);
        let mut last_time = i64::MIN;
        for batch in loader.epoch(0, usize::MAX).unwrap() {
            let batch = batch.unwrap();
            assert!(batch.times.iter().all(|&t| t == batch.times[0]));
            assert!(batch.neg_dst.seed_time.iter().all(|&t| t == batch.times[0]));
            assert_eq!(batch.neg_dst.num_seeds(), batch.len());
            assert!(batch.times[0] >= last_time);
            last_time = batch.times[0];
        }
    }

    #[test]
    fn test_capped_shared_time_epochs_reach_every_time() {
        let sampler = Arc::new(NeighborSampler::new(graph(), vec![2], TemporalStrategy::Uniform));
        let examples: Arc<[LinkExample]> = (0..30u32)
            .map(|i| LinkExample {
                src: i % 6,
                dst: i % 5,
                time: 100 + (i % 3) as i64 * 10,
            })
            .collect();
        let config = LinkLoaderConfig {
            batch_size: 4,
            shared_time: true,
            max_steps: 3,
            ..Default::default()
        };
        let loader = LinkLoader::new(sampler, Arc::clone(&examples), NodeType(0), NodeType(1), config).unwrap();

        let mut times = std::collections::BTreeSet::new();
        for epoch in 0..50 {
            let plan = loader.plan(epoch);
            assert_eq!(plan.len(), 3);
            let mut last_time = i64::MIN;
            for batch in &plan {
                let t = examples[batch[0]].time;
                assert!(batch.iter().all(|&i| examples[i].time == t));
                assert!(t >= last_time);
                last_time = t;
                times.insert(t);
            }
        }
        assert_eq!(times.into_iter().collect::<Vec<_>>(), vec![100, 110, 120]);
    }

    #[test]
    fn test_independent_mode_shuffles_per_epoch() {
        let loader = loader(false, 0);
        assert_eq!(loader.num_batches(), 5);
        let a = loader.plan(0);
        let b = loader.plan(1);
        assert_ne!(a, b);
        assert_eq!(a, loader.plan(0));
        let mut seen: Vec<usize> = a.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        let batch = loader.epoch(0, 1).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.neg_dst.seed_time, batch.times);
    }

    #[test]
    fn test_prefetch_matches_inline() {
        let inline: Vec<_> = loader(false, 0)
            .epoch(2, usize::MAX)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        let prefetched: Vec<_> = loader(false, 2)
            .epoch(2, usize::MAX)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(inline.len(), prefetched.len());
        for (a, b) in inline.iter().zip(&prefetched) {
            assert_eq!(a.src, b.src);
            assert_eq!(a.neg_dst, b.neg_dst);
        }
    }

    #[test]
    fn test_early_drop_with_prefetch() {
        let mut batches = loader(true, 1).epoch(0, usize::MAX).unwrap();
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn test_steps_cap() {
        let loader = loader(true, 0);
        assert_eq!(loader.epoch(0, 3).unwrap().count(), 3);
    }

    #[test]
    fn test_empty_shard_yields_nothing() {
        let sampler = Arc::new(NeighborSampler::new(graph(), vec![2], TemporalStrategy::Last));
        let loader = LinkLoader::new(
            sampler,
            Arc::from(Vec::new()),
            NodeType(0),
            NodeType(1),
            LinkLoaderConfig::default(),
        )
        .unwrap();
        assert_eq!(loader.num_batches(), 0);
        assert_eq!(loader.epoch(0, usize::MAX).unwrap().count(), 0);
    }

    #[test]
    fn test_node_loader_covers_in_order_and_repeats() {
        let sampler = Arc::new(NeighborSampler::new(graph(), vec![2], TemporalStrategy::Uniform));
        let config = NodeLoaderConfig {
            batch_size: 2,
            ..Default::default()
        };
        let loader = NodeLoader::all_nodes(sampler, NodeType(1), 12, Split::Val, config).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let first: Vec<_> = loader.iter().unwrap().map(|b| b.unwrap()).collect();
        let ids: Vec<u32> = first.iter().flat_map(|b| b.ids.clone()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        let second: Vec<_> = loader.iter().unwrap().map(|b| b.unwrap()).collect();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.subgraph, b.subgraph);
        }
    }
}
