//! Generate the synthetic event dataset and write it to the dataset cache.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin synthesize -- --cache-dir ~/.cache/confluence --num-users 5000
//! ```

use std::path::PathBuf;

use catchment::store::{dataset_dir, write_dataset};
use catchment::synthetic::{DATASET_NAME, SyntheticConfig, generate};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Write a synthetic event-recommendation dataset")]
struct Args {
    /// Dataset cache directory; output goes to `<cache-dir>/<dataset>/`.
    #[arg(long)]
    cache_dir: PathBuf,

    /// Dataset name to write under.
    #[arg(long, default_value = DATASET_NAME)]
    dataset: String,

    #[arg(long, default_value_t = 2000)]
    num_users: usize,

    #[arg(long, default_value_t = 500)]
    num_events: usize,

    #[arg(long, default_value_t = 8)]
    num_clusters: usize,

    #[arg(long, default_value_t = 12)]
    attendances_per_user: usize,

    #[arg(long, default_value_t = 4)]
    friends_per_user: usize,

    /// Number of destinations retrieved per source at evaluation.
    #[arg(long, default_value_t = 10)]
    eval_k: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = SyntheticConfig {
        num_users: args.num_users,
        num_events: args.num_events,
        num_clusters: args.num_clusters,
        attendances_per_user: args.attendances_per_user,
        friends_per_user: args.friends_per_user,
        eval_k: args.eval_k,
        seed: args.seed,
        ..Default::default()
    };

    let mut dataset = generate(&config)?;
    dataset.name = args.dataset.clone();
    let dir = dataset_dir(&args.cache_dir, &args.dataset);
    write_dataset(&dir, &dataset)?;
    info!("Done: {}", dir.display());
    Ok(())
}
