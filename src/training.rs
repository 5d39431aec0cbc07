use burn::collective::{self, PeerId, ReduceOperation};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, TensorPrimitive};
use catchment::common::TemporalStrategy;
use catchment::loader::LinkBatch;
use catchment::partition::ShardStrategy;
use catchment::sampler::SamplerError;
use indicatif::ProgressBar;
use tracing::debug;

use crate::error::TrainError;
use crate::loss::bpr_loss;
use crate::model::{Encoder, ModelConfig};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// The model configuration
    pub model: ModelConfig,

    /// The optimizer configuration
    pub optimizer: AdamConfig,

    /// Learning rate
    #[config(default = 0.001)]
    pub lr: f64,

    /// Number of training epochs
    #[config(default = 20)]
    pub epochs: usize,

    /// Evaluate on the validation split every this many epochs
    #[config(default = 1)]
    pub eval_epochs_interval: usize,

    /// Examples per training batch (and seeds per evaluation batch)
    #[config(default = 512)]
    pub batch_size: usize,

    /// Fan-out of the first hop, halved at every further hop
    #[config(default = 160)]
    pub num_neighbors: usize,

    #[config(default = "TemporalStrategy::Uniform")]
    pub temporal_strategy: TemporalStrategy,

    /// Batch examples by seed time and share negatives within a batch
    #[config(default = true)]
    pub share_same_time: bool,

    /// Cap on optimizer steps per epoch
    #[config(default = 2000)]
    pub max_steps_per_epoch: usize,

    /// Batches prepared ahead on a background thread (0 = inline)
    #[config(default = 0)]
    pub num_workers: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = "ShardStrategy::Balanced")]
    pub shard_strategy: ShardStrategy,
}

impl TrainingConfig {
    /// Reject settings that cannot run, before any worker starts.
    pub fn validate(&self) -> Result<(), TrainError> {
        self.model.validate().map_err(TrainError::Config)?;
        let positive = [
            ("epochs", self.epochs),
            ("eval_epochs_interval", self.eval_epochs_interval),
            ("batch_size", self.batch_size),
            ("max_steps_per_epoch", self.max_steps_per_epoch),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(TrainError::Config(format!("{name} must be positive")));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(TrainError::Config(format!("learning rate must be positive, got {}", self.lr)));
        }
        Ok(())
    }
}

/// How gradients are combined across workers after every backward pass.
#[derive(Debug, Clone, Copy)]
pub enum GradientSync {
    /// Single worker: gradients are used as computed.
    Local,
    /// Mean all-reduce with the other registered peers.
    Collective { peer: PeerId },
}

impl GradientSync {
    fn sync<B: AutodiffBackend>(&self, grads: GradientsParams) -> Result<GradientsParams, TrainError> {
        match self {
            GradientSync::Local => Ok(grads),
            GradientSync::Collective { peer } => grads
                .all_reduce::<B::InnerBackend>(*peer, ReduceOperation::Mean)
                .map_err(|e| TrainError::Collective(format!("{e:?}"))),
        }
    }

    /// Whether this worker or any peer reports a failure. Every peer must
    /// call this the same number of times.
    pub fn any_failed<B: AutodiffBackend>(&self, failed: bool, device: &B::Device) -> Result<bool, TrainError> {
        let GradientSync::Collective { peer } = self else {
            return Ok(failed);
        };
        let flag = Tensor::<B::InnerBackend, 1>::from_floats([f32::from(u8::from(failed))], device);
        let total = collective::all_reduce::<B::InnerBackend>(*peer, flag.into_primitive().tensor(), ReduceOperation::Sum)
            .map_err(|e| TrainError::Collective(format!("{e:?}")))?;
        let total = Tensor::<B::InnerBackend, 1>::from_primitive(TensorPrimitive::Float(total));
        Ok(total.into_scalar().elem::<f64>() > 0.0)
    }

    /// Passes `outcome` through once every peer has reported on the same
    /// stage. A local success becomes [`TrainError::Aborted`] if a peer failed,
    /// so no worker is left waiting in a later all-reduce.
    pub fn agree<B: AutodiffBackend, T>(
        &self,
        outcome: Result<T, TrainError>,
        device: &B::Device,
        stage: impl FnOnce() -> String,
    ) -> Result<T, TrainError> {
        let peers_failed = self.any_failed::<B>(outcome.is_err(), device)?;
        match outcome {
            Ok(_) if peers_failed => Err(TrainError::Aborted(stage())),
            outcome => outcome,
        }
    }
}

/// Running loss of one epoch, weighted by batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss_sum: f64,
    pub examples: usize,
    pub steps: usize,
}

impl EpochStats {
    pub fn record(&mut self, loss: f64, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.examples += batch_size;
        self.steps += 1;
    }

    /// Mean per-example loss (0 for an epoch without batches).
    pub fn loss(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.loss_sum / self.examples as f64
        }
    }
}

/// Optimizer state and step logic of one worker. The model is passed in and
/// returned by every epoch.
pub struct Trainer<B: AutodiffBackend, M: AutodiffModule<B>, O: Optimizer<M, B>> {
    optim: O,
    lr: f64,
    sync: GradientSync,
    device: B::Device,
    _marker: std::marker::PhantomData<M>,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Encoder<B>,
    O: Optimizer<M, B>,
{
    pub fn new(optim: O, lr: f64, sync: GradientSync, device: B::Device) -> Self {
        Self {
            optim,
            lr,
            sync,
            device,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Forward pass and loss of one batch. Under collective sync the loss also
    /// carries the model's zero-valued parameter anchor, so every worker
    /// produces the same set of gradients.
    pub fn batch_loss(&self, model: &M, batch: &LinkBatch) -> Tensor<B, 1> {
        let x_src = model.encode(&batch.src, batch.src.seed_type, &self.device);
        let x_pos = model.encode(&batch.pos_dst, batch.pos_dst.seed_type, &self.device);
        let x_neg = model.encode(&batch.neg_dst, batch.neg_dst.seed_type, &self.device);
        let loss = bpr_loss(x_src, x_pos, x_neg, batch.shared_time);
        match self.sync {
            GradientSync::Local => loss,
            GradientSync::Collective { .. } => loss + model.parameter_anchor(&self.device),
        }
    }

    /// One pass over `batches`: forward, backward, gradient sync and one
    /// optimizer step per batch. A failed batch or a non-finite loss on any
    /// worker stops every worker at the same step.
    pub fn train_epoch(
        &mut self,
        mut model: M,
        epoch: usize,
        batches: impl Iterator<Item = Result<LinkBatch, SamplerError>>,
        progress: &ProgressBar,
    ) -> Result<(M, EpochStats), TrainError> {
        let mut stats = EpochStats::default();
        for (step, batch) in batches.enumerate() {
            let outcome = batch.map_err(TrainError::from).and_then(|batch| {
                let loss = self.batch_loss(&model, &batch);
                let value = loss.clone().into_scalar().elem::<f64>();
                if value.is_finite() {
                    Ok((batch, loss, value))
                } else {
                    Err(TrainError::NonFiniteLoss {
                        loss: value,
                        epoch,
                        step,
                    })
                }
            });
            let (batch, loss, value) = self
                .sync
                .agree::<B, _>(outcome, &self.device, || format!("epoch {epoch}, step {step}"))?;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let grads = self.sync.sync::<B>(grads)?;
            model = self.optim.step(self.lr, model, grads);

            stats.record(value, batch.len());
            progress.inc(1);
            if step % 100 == 0 {
                debug!("epoch {epoch} step {step}: loss={value:.6}");
            }
        }
        Ok((model, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use catchment::common::fanout_schedule;
    use catchment::loader::{LinkLoader, LinkLoaderConfig};
    use catchment::sampler::NeighborSampler;
    use catchment::synthetic::{SyntheticConfig, TASK_NAME, generate};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use burn::collective::CollectiveConfig;

    use crate::model::RelationalGnn;

    type TB = Autodiff<NdArray>;

    #[test]
    fn test_epoch_stats_weighting() {
        let mut stats = EpochStats::default();
        assert_eq!(stats.loss(), 0.0);
        stats.record(1.0, 3);
        stats.record(2.0, 1);
        assert!((stats.loss() - 1.25).abs() < 1e-12);
        assert_eq!(stats.steps, 2);
    }

    #[test]
    fn test_validate_rejects_zero_epochs() {
        let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new());
        assert!(config.validate().is_ok());
        assert!(matches!(config.clone().with_epochs(0).validate(), Err(TrainError::Config(_))));
        assert!(matches!(config.with_batch_size(0).validate(), Err(TrainError::Config(_))));
    }

    fn fixture(max_steps: usize, rank: usize) -> (RelationalGnn<TB>, LinkLoader) {
        let dataset = generate(&SyntheticConfig {
            num_users: 40,
            num_events: 20,
            num_clusters: 2,
            attendances_per_user: 4,
            ..Default::default()
        })
        .unwrap();
        let task = dataset.link_task(TASK_NAME).unwrap();
        let model_config = ModelConfig::new().with_channels(16);
        let sampler = Arc::new(NeighborSampler::new(
            Arc::clone(&dataset.graph),
            fanout_schedule(8, model_config.num_layers),
            TemporalStrategy::Uniform,
        ));
        let loader = LinkLoader::new(
            sampler,
            task.examples(catchment::common::Split::Train).into(),
            task.src_entity(),
            task.dst_entity(),
            LinkLoaderConfig {
                batch_size: 16,
                shared_time: false,
                max_steps,
                rank,
                ..Default::default()
            },
        )
        .unwrap();
        let model = model_config.init(dataset.graph.schema(), task.dst_entity(), &Default::default());
        (model, loader)
    }

    #[test]
    fn test_train_epoch_runs_and_lowers_loss() {
        let (mut model, loader) = fixture(20, 0);
        let mut trainer = Trainer::new(AdamConfig::new().init(), 0.01, GradientSync::Local, Default::default());
        let bar = ProgressBar::hidden();
        let mut losses = Vec::new();
        for epoch in 0..3 {
            let (m, stats) = trainer
                .train_epoch(model, epoch, loader.epoch(epoch, usize::MAX).unwrap(), &bar)
                .unwrap();
            model = m;
            assert!(stats.steps > 0);
            assert!(stats.loss().is_finite());
            losses.push(stats.loss());
        }
        assert!(losses[2] < losses[0], "{losses:?}");
    }

    #[test]
    fn test_local_failure_passes_through_agreement() {
        let device = Default::default();
        let sync = GradientSync::Local;
        assert!(!sync.any_failed::<TB>(false, &device).unwrap());
        assert!(sync.any_failed::<TB>(true, &device).unwrap());
        let failed: Result<(), _> = Err(TrainError::Config("bad".into()));
        assert!(matches!(
            sync.agree::<TB, _>(failed, &device, || "setup".into()),
            Err(TrainError::Config(_))
        ));
    }

    // The collective server is process-wide; tests that register peers run
    // one at a time.
    static COLLECTIVE: Mutex<()> = Mutex::new(());

    /// Runs `job(rank, sync)` on two registered peers and returns both results
    /// in rank order.
    fn with_two_peers<T: Send>(job: impl Fn(usize, GradientSync) -> T + Sync) -> Vec<T> {
        let _guard = COLLECTIVE.lock().unwrap_or_else(|e| e.into_inner());
        collective::reset_collective::<NdArray>();
        let config = CollectiveConfig::default().with_num_devices(2);
        thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let (job, config) = (&job, config.clone());
                    s.spawn(move || {
                        let peer = PeerId::from(rank);
                        collective::register::<NdArray>(peer, Default::default(), config).unwrap();
                        let out = job(rank, GradientSync::Collective { peer });
                        collective::finish_collective::<NdArray>(peer).unwrap();
                        out
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_any_failed_is_shared_by_peers() {
        let results = with_two_peers(|rank, sync| {
            let device = Default::default();
            let quiet = sync.any_failed::<TB>(false, &device).unwrap();
            let loud = sync.any_failed::<TB>(rank == 1, &device).unwrap();
            (quiet, loud)
        });
        assert_eq!(results, vec![(false, true), (false, true)]);
    }

    #[test]
    fn test_failing_worker_stops_its_peers() {
        let results = with_two_peers(|rank, sync| {
            let (model, loader) = fixture(3, rank);
            let mut trainer = Trainer::new(AdamConfig::new().init(), 0.01, sync, Default::default());
            let batches = loader.epoch(0, 3).unwrap().enumerate().map(move |(step, batch)| {
                if rank == 1 && step == 1 {
                    Err(SamplerError::NoDestinations)
                } else {
                    batch
                }
            });
            trainer
                .train_epoch(model, 0, batches, &ProgressBar::hidden())
                .map(|(_, stats)| stats)
        });
        assert!(
            matches!(&results[0], Err(TrainError::Aborted(stage)) if stage == "epoch 0, step 1"),
            "{:?}",
            results[0]
        );
        assert!(
            matches!(&results[1], Err(TrainError::Sampler(SamplerError::NoDestinations))),
            "{:?}",
            results[1]
        );
    }

    #[test]
    fn test_collective_steps_with_different_batches() {
        // The two ranks sample different subgraphs every step, so only the
        // parameter anchor keeps their gradient sets aligned.
        let results = with_two_peers(|rank, sync| {
            let (model, loader) = fixture(4, rank);
            let mut trainer = Trainer::new(AdamConfig::new().init(), 0.01, sync, Default::default());
            trainer
                .train_epoch(model, 0, loader.epoch(0, 4).unwrap(), &ProgressBar::hidden())
                .map(|(_, stats)| stats)
        });
        for stats in results {
            let stats = stats.unwrap();
            assert_eq!(stats.steps, 4);
            assert!(stats.loss().is_finite());
        }
    }
}
