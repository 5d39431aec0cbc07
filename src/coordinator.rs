//! Run orchestration: one training worker per device, evaluation and best
//! checkpoint selection on rank 0.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use burn::collective::{self, CollectiveConfig, PeerId};
use burn::module::{AutodiffModule, Module};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use catchment::common::{Split, fanout_schedule};
use catchment::graph::HeteroGraph;
use catchment::loader::{LinkLoader, LinkLoaderConfig, NodeLoader, NodeLoaderConfig, count_batches};
use catchment::partition::{Partitioner, lockstep_steps};
use catchment::sampler::NeighborSampler;
use catchment::task::{LINK_PREDICTION_MAP, LinkTask, Metrics};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::TrainError;
use crate::evaluate::predict_top_k;
use crate::model::RelationalGnn;
use crate::training::{GradientSync, Trainer, TrainingConfig};

// ============================================================================
// Best checkpoint
// ============================================================================

/// Best model state seen so far, by a metric where higher is better. Equal
/// metrics replace the held state.
#[derive(Debug)]
pub struct BestCheckpoint<R> {
    epoch: Option<usize>,
    metric: f64,
    state: Option<R>,
}

impl<R> Default for BestCheckpoint<R> {
    fn default() -> Self {
        Self {
            epoch: None,
            metric: f64::NEG_INFINITY,
            state: None,
        }
    }
}

impl<R> BestCheckpoint<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `state()` if `metric` is at least the best so far. Returns whether
    /// it was kept.
    pub fn offer(&mut self, epoch: usize, metric: f64, state: impl FnOnce() -> R) -> bool {
        if metric >= self.metric {
            self.epoch = Some(epoch);
            self.metric = metric;
            self.state = Some(state());
            true
        } else {
            false
        }
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn metric(&self) -> f64 {
        self.metric
    }

    pub fn into_state(self) -> Option<R> {
        self.state
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub val: Option<Metrics>,
}

/// What rank 0 reports at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Epoch of the restored checkpoint (`None` if no evaluation ever ran).
    pub best_epoch: Option<usize>,
    pub val: Metrics,
    pub test: Metrics,
    pub history: Vec<EpochRecord>,
}

#[derive(Debug)]
pub struct RunOutcome<M> {
    pub report: RunReport,
    pub model: M,
}

// ============================================================================
// Worker
// ============================================================================

/// Identity of one worker in a run.
#[derive(Debug, Clone)]
pub struct WorkerContext<D> {
    pub rank: usize,
    pub world_size: usize,
    pub device: D,
    pub sync: GradientSync,
}

/// Loaders for scoring one evaluation split on rank 0.
struct EvalLoaders {
    split: Split,
    src: NodeLoader,
    dst: NodeLoader,
}

impl EvalLoaders {
    fn new(
        sampler: &Arc<NeighborSampler>,
        task: &LinkTask,
        split: Split,
        config: &TrainingConfig,
    ) -> Result<Self, TrainError> {
        let time = task
            .seed_time(split)
            .ok_or_else(|| TrainError::Config(format!("split {split} has no seed time")))?;
        let loader_config = NodeLoaderConfig {
            batch_size: config.batch_size,
            seed: config.seed,
            num_prefetch: config.num_workers,
        };
        let src = NodeLoader::new(
            Arc::clone(sampler),
            task.src_entity(),
            task.eval_table(split).src.clone().into(),
            time,
            split,
            loader_config.clone(),
        )?;
        let dst = NodeLoader::all_nodes(Arc::clone(sampler), task.dst_entity(), time, split, loader_config)?;
        Ok(Self { split, src, dst })
    }

    fn evaluate<B: Backend>(
        &self,
        model: &RelationalGnn<B>,
        task: &LinkTask,
        device: &B::Device,
    ) -> Result<Metrics, TrainError> {
        let bar = progress_bar(
            true,
            self.src.num_batches() + self.dst.num_batches(),
            &format!("Eval {}", self.split),
        );
        let k = task.eval_k();
        let pred = predict_top_k(model, &self.src, &self.dst, k, model.channels(), device, &bar)?;
        bar.finish_and_clear();
        Ok(task.evaluate(pred.indices(), k, self.split)?)
    }
}

/// Per-worker loaders: the lock-step step count, this rank's train loader
/// and, on rank 0, the validation and test loaders.
struct WorkerLoaders {
    steps: usize,
    train: LinkLoader,
    eval: Option<(EvalLoaders, EvalLoaders)>,
}

fn worker_loaders(
    config: &TrainingConfig,
    task: &LinkTask,
    sampler: &Arc<NeighborSampler>,
    rank: usize,
    world_size: usize,
) -> Result<WorkerLoaders, TrainError> {
    // Every rank derives every shard's batch count, so all agree on the step
    // count without communicating.
    let train = task.examples(Split::Train);
    let partitioner = Partitioner::new(train.len(), world_size, config.shard_strategy)?;
    let mut batches_per_rank = Vec::with_capacity(world_size);
    for r in 0..world_size {
        let shard = partitioner.shard(r, train)?;
        batches_per_rank.push(count_batches(shard, config.batch_size, config.share_same_time));
    }
    let steps = lockstep_steps(batches_per_rank, config.max_steps_per_epoch);
    if steps == 0 {
        warn!("rank {rank}: no training steps per epoch");
    }

    let shard = partitioner.shard(rank, train)?;
    let loader = LinkLoader::new(
        Arc::clone(sampler),
        shard.into(),
        task.src_entity(),
        task.dst_entity(),
        LinkLoaderConfig {
            batch_size: config.batch_size,
            shared_time: config.share_same_time,
            seed: config.seed,
            rank,
            max_steps: steps,
            num_prefetch: config.num_workers,
        },
    )?;

    let eval = if rank == 0 {
        Some((
            EvalLoaders::new(sampler, task, Split::Val, config)?,
            EvalLoaders::new(sampler, task, Split::Test, config)?,
        ))
    } else {
        None
    };
    Ok(WorkerLoaders {
        steps,
        train: loader,
        eval,
    })
}

/// Trains `model` on this worker's shard of the train split. Rank 0 also
/// evaluates and returns the outcome; other ranks return `None`.
///
/// Setup, every epoch's loader, every step and every validation round end
/// with an agreement among the workers, so a failure on one rank stops all
/// of them at the same point.
pub fn run_worker<B: AutodiffBackend>(
    config: &TrainingConfig,
    task: &LinkTask,
    sampler: Arc<NeighborSampler>,
    model: RelationalGnn<B>,
    ctx: WorkerContext<B::Device>,
) -> Result<Option<RunOutcome<RelationalGnn<B::InnerBackend>>>, TrainError> {
    let WorkerContext {
        rank,
        world_size,
        device,
        sync,
    } = ctx;
    let is_main = rank == 0;

    let loaders = worker_loaders(config, task, &sampler, rank, world_size);
    let WorkerLoaders {
        steps,
        train: loader,
        eval,
    } = sync.agree::<B, _>(loaders, &device, || "setup".into())?;

    let mut model = model.fork(&device);
    let mut trainer = Trainer::new(config.optimizer.init(), config.lr, sync, device.clone());
    let mut best = BestCheckpoint::new();
    let mut history = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        let bar = progress_bar(is_main, steps, &format!("Epoch {epoch}"));
        let batches = sync.agree::<B, _>(loader.epoch(epoch, steps).map_err(TrainError::from), &device, || {
            format!("epoch {epoch} loader")
        })?;
        let (trained, stats) = trainer.train_epoch(model, epoch, batches, &bar)?;
        bar.finish_and_clear();
        model = trained;

        let evaluated = match &eval {
            Some((val_loaders, _)) if epoch % config.eval_epochs_interval == 0 => {
                val_loaders.evaluate(&model.valid(), task, &device).map(Some)
            }
            _ => Ok(None),
        };
        let val = sync.agree::<B, _>(evaluated, &device, || format!("epoch {epoch} validation"))?;
        if !is_main {
            continue;
        }
        if let Some(metrics) = &val {
            let map = metrics.get(LINK_PREDICTION_MAP).copied().unwrap_or(f64::NAN);
            if best.offer(epoch, map, || model.valid()) {
                info!("epoch {epoch}: new best {LINK_PREDICTION_MAP}={map:.4}");
            }
        }
        match &val {
            Some(metrics) => info!("epoch {epoch}: train loss={:.4}, val {}", stats.loss(), format_metrics(metrics)),
            None => info!("epoch {epoch}: train loss={:.4}", stats.loss()),
        }
        history.push(EpochRecord {
            epoch,
            loss: stats.loss(),
            val,
        });
    }

    let Some((val_loaders, test_loaders)) = eval else {
        return Ok(None);
    };
    let best_epoch = best.epoch();
    let final_model = best.into_state().unwrap_or_else(|| model.valid());
    let val = val_loaders.evaluate(&final_model, task, &device)?;
    let test = test_loaders.evaluate(&final_model, task, &device)?;
    info!(
        "best epoch {best_epoch:?}: val {}, test {}",
        format_metrics(&val),
        format_metrics(&test)
    );

    Ok(Some(RunOutcome {
        report: RunReport {
            best_epoch,
            val,
            test,
            history,
        },
        model: final_model,
    }))
}

// ============================================================================
// Launch
// ============================================================================

/// Trains `task` data-parallel over `devices`, one worker thread per device.
/// Gradients are averaged with a collective all-reduce when there is more
/// than one device.
pub fn launch<B: AutodiffBackend>(
    config: &TrainingConfig,
    task: &LinkTask,
    sampler: Arc<NeighborSampler>,
    devices: &[B::Device],
) -> Result<RunOutcome<RelationalGnn<B::InnerBackend>>, TrainError> {
    config.validate()?;
    let Some(first_device) = devices.first() else {
        return Err(TrainError::Config("need at least one device".into()));
    };
    if task.eval_k() > task.num_dst_nodes() {
        return Err(TrainError::Config(format!(
            "eval_k {} exceeds {} destination nodes",
            task.eval_k(),
            task.num_dst_nodes()
        )));
    }

    let world_size = devices.len();
    let schema = sampler.graph().schema();
    let initial: RelationalGnn<B> = config.model.init(schema, task.dst_entity(), first_device);
    info!(
        "launch: task={}, workers={world_size}, train examples={}",
        task.name(),
        task.examples(Split::Train).len()
    );
    let collective_config = CollectiveConfig::default().with_num_devices(world_size);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = devices
            .iter()
            .enumerate()
            .map(|(rank, device)| {
                let sampler = Arc::clone(&sampler);
                let model = initial.clone();
                let device = device.clone();
                let collective_config = collective_config.clone();
                thread::Builder::new()
                    .name(format!("worker-{rank}"))
                    .spawn_scoped(s, move || {
                        worker_thread::<B>(config, task, sampler, model, rank, world_size, device, collective_config)
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(h) => h.join().map_err(|_| TrainError::WorkerPanic(rank))?,
                Err(e) => Err(TrainError::Io(e)),
            })
            .collect()
    });

    // A worker that stopped because a peer failed reports less than the
    // failing worker itself.
    let mut outcome = None;
    let mut aborted = None;
    for result in results {
        match result {
            Ok(Some(o)) => outcome = Some(o),
            Ok(None) => {}
            Err(e @ TrainError::Aborted(_)) => {
                aborted.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = aborted {
        return Err(e);
    }
    outcome.ok_or_else(|| TrainError::Config("rank 0 returned no outcome".into()))
}

#[allow(clippy::too_many_arguments)]
fn worker_thread<B: AutodiffBackend>(
    config: &TrainingConfig,
    task: &LinkTask,
    sampler: Arc<NeighborSampler>,
    model: RelationalGnn<B>,
    rank: usize,
    world_size: usize,
    device: B::Device,
    collective_config: CollectiveConfig,
) -> Result<Option<RunOutcome<RelationalGnn<B::InnerBackend>>>, TrainError> {
    if world_size == 1 {
        let ctx = WorkerContext {
            rank,
            world_size,
            device,
            sync: GradientSync::Local,
        };
        return run_worker(config, task, sampler, model, ctx);
    }

    let peer = PeerId::from(rank);
    collective::register::<B::InnerBackend>(peer, device.clone(), collective_config)
        .map_err(|e| TrainError::Collective(format!("{e:?}")))?;
    let ctx = WorkerContext {
        rank,
        world_size,
        device,
        sync: GradientSync::Collective { peer },
    };
    let result = run_worker(config, task, sampler, model, ctx);
    collective::finish_collective::<B::InnerBackend>(peer).map_err(|e| TrainError::Collective(format!("{e:?}")))?;
    result
}

/// Sampler with `config`'s fan-out schedule and temporal strategy.
pub fn build_sampler(config: &TrainingConfig, graph: Arc<HeteroGraph>) -> Arc<NeighborSampler> {
    Arc::new(NeighborSampler::new(
        graph,
        fanout_schedule(config.num_neighbors, config.model.num_layers),
        config.temporal_strategy,
    ))
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Writes `model` to `path` (`.mpk` is appended by the recorder).
pub fn save_checkpoint<B: Backend>(model: RelationalGnn<B>, path: &Path) -> Result<(), TrainError> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| TrainError::Checkpoint(format!("{e:?}")))
}

/// Loads parameters saved by [`save_checkpoint`] into `model`.
pub fn load_checkpoint<B: Backend>(
    model: RelationalGnn<B>,
    path: &Path,
    device: &B::Device,
) -> Result<RelationalGnn<B>, TrainError> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TrainError::Checkpoint(format!("{e:?}")))
}

/// `name=value` pairs, four decimals.
pub fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn progress_bar(visible: bool, len: usize, label: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let template = format!("  {label:<10} {{bar:40.cyan/blue}} {{pos}}/{{len}} batches [{{elapsed_precise}}]");
    if let Ok(style) = ProgressStyle::with_template(&template) {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}
