#![recursion_limit = "131"]

//! Train a link-prediction GNN on a dataset task, data-parallel over local GPUs.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin train                          # synthetic dataset, single GPU
//! cargo run --release --bin train -- --num-devices 2       # 2 GPUs, data-parallel
//! cargo run --release --bin train -- --dataset rel-event-synthetic --task user-attendance \
//!     --epochs 10 --share-same-time false --save-checkpoint
//! ```

use std::path::PathBuf;

use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use burn::optim::AdamConfig;
use catchment::common::TemporalStrategy;
use catchment::store::{dataset_dir, load_dataset, write_dataset};
use catchment::synthetic::{self, SyntheticConfig};
use clap::{ArgAction, Parser};
use confluence::coordinator::{build_sampler, format_metrics, launch, save_checkpoint};
use confluence::model::{Aggregation, ModelConfig};
use confluence::training::TrainingConfig;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(about = "Train a temporal GNN for link prediction")]
struct Args {
    #[arg(long, default_value = synthetic::DATASET_NAME)]
    dataset: String,

    #[arg(long, default_value = synthetic::TASK_NAME)]
    task: String,

    #[arg(long, default_value_t = 0.001)]
    lr: f64,

    #[arg(long, default_value_t = 20)]
    epochs: usize,

    /// Evaluate on the validation split every this many epochs.
    #[arg(long, default_value_t = 1)]
    eval_epochs_interval: usize,

    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    #[arg(long, default_value_t = 128)]
    channels: usize,

    /// Neighbor aggregation: sum | mean.
    #[arg(long, default_value_t = Aggregation::Sum)]
    aggr: Aggregation,

    #[arg(long, default_value_t = 2)]
    num_layers: usize,

    /// First-hop fan-out; halved at every further hop.
    #[arg(long, default_value_t = 160)]
    num_neighbors: usize,

    /// Neighbor selection among visible edges: uniform | last.
    #[arg(long, default_value_t = TemporalStrategy::Uniform)]
    temporal_strategy: TemporalStrategy,

    /// Batch examples sharing a seed time and share negatives within a batch.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    share_same_time: bool,

    /// Learned per-node embedding for the destination entity.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_shallow: bool,

    #[arg(long, default_value_t = 2000)]
    max_steps_per_epoch: usize,

    /// Batches prepared ahead on a background thread per loader (0 = inline).
    #[arg(long, default_value_t = 0)]
    num_workers: usize,

    /// Number of local devices (GPUs) for data-parallel training.
    #[arg(long, default_value_t = 1)]
    num_devices: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Dataset and checkpoint cache (default: `$HOME/.cache/confluence`).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Write the best model, its config and the run report under
    /// `<cache-dir>/checkpoints/`.
    #[arg(long)]
    save_checkpoint: bool,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    type B = Wgpu;
    type AB = Autodiff<B>;

    if args.num_devices == 0 {
        return Err("need at least one device".into());
    }

    let config = TrainingConfig::new(
        ModelConfig::new()
            .with_channels(args.channels)
            .with_num_layers(args.num_layers)
            .with_aggr(args.aggr)
            .with_use_shallow(args.use_shallow),
        AdamConfig::new(),
    )
    .with_lr(args.lr)
    .with_epochs(args.epochs)
    .with_eval_epochs_interval(args.eval_epochs_interval)
    .with_batch_size(args.batch_size)
    .with_num_neighbors(args.num_neighbors)
    .with_temporal_strategy(args.temporal_strategy)
    .with_share_same_time(args.share_same_time)
    .with_max_steps_per_epoch(args.max_steps_per_epoch)
    .with_num_workers(args.num_workers)
    .with_seed(args.seed);
    config.validate()?;

    let cache_dir = match args.cache_dir {
        Some(dir) => dir,
        None => {
            let home = std::env::var_os("HOME").ok_or("HOME is not set; pass --cache-dir")?;
            PathBuf::from(home).join(".cache").join("confluence")
        }
    };

    // ── Dataset ──────────────────────────────────────────────────────────
    let dir = dataset_dir(&cache_dir, &args.dataset);
    if !dir.join("metadata.json").exists() {
        if args.dataset != synthetic::DATASET_NAME {
            return Err(format!("dataset {} not found at {}", args.dataset, dir.display()).into());
        }
        info!("Synthesizing {} into {}", args.dataset, dir.display());
        let dataset = synthetic::generate(&SyntheticConfig {
            seed: args.seed,
            ..Default::default()
        })?;
        write_dataset(&dir, &dataset)?;
    }
    let dataset = load_dataset(&dir)?;
    let task = dataset.link_task(&args.task)?;

    // ── Train ────────────────────────────────────────────────────────────
    let devices: Vec<WgpuDevice> = if args.num_devices == 1 {
        vec![WgpuDevice::default()]
    } else {
        (0..args.num_devices).map(WgpuDevice::DiscreteGpu).collect()
    };
    println!(
        "Training {} / {} for {} epochs ({} device(s))...\n",
        args.dataset, args.task, config.epochs, args.num_devices
    );

    let sampler = build_sampler(&config, dataset.graph.clone());
    let outcome = launch::<AB>(&config, &task, sampler, &devices)?;
    let report = &outcome.report;

    for record in &report.history {
        match &record.val {
            Some(val) => println!("  epoch {:>3}: loss = {:.6}  val {}", record.epoch, record.loss, format_metrics(val)),
            None => println!("  epoch {:>3}: loss = {:.6}", record.epoch, record.loss),
        }
    }
    match report.best_epoch {
        Some(epoch) => println!("\nBest epoch: {epoch}"),
        None => println!("\nNo validation ran; reporting the final model"),
    }
    println!("Best val metrics:  {}", format_metrics(&report.val));
    println!("Best test metrics: {}", format_metrics(&report.test));

    if args.save_checkpoint {
        let out = cache_dir
            .join("checkpoints")
            .join(format!("{}-{}", args.dataset, args.task));
        std::fs::create_dir_all(&out)?;
        config.save(out.join("config.json"))?;
        std::fs::write(out.join("report.json"), serde_json::to_string_pretty(report)?)?;
        save_checkpoint(outcome.model, &out.join("best"))?;
        info!("Saved checkpoint to {}", out.display());
    }
    Ok(())
}
