//! Inspect a dataset directory: dump the graph schema, task sizes and a
//! summary of one sampled training batch.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --dataset-dir ~/.cache/confluence/rel-event-synthetic
//! cargo run --release --bin inspect -- --dataset-dir <dir> --task user-attendance --batch-size 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use catchment::common::{EdgeType, NodeType, Split, TemporalStrategy, fanout_schedule};
use catchment::loader::{LinkLoader, LinkLoaderConfig};
use catchment::sampler::{NeighborSampler, Subgraph};
use catchment::store::load_dataset;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Inspect a dataset directory")]
struct Args {
    /// Path to the dataset directory (contains metadata.json).
    #[arg(long)]
    dataset_dir: PathBuf,

    /// Task to sample a batch from (defaults to the first task).
    #[arg(long)]
    task: Option<String>,

    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    #[arg(long, default_value_t = 16)]
    num_neighbors: usize,

    #[arg(long, default_value_t = 2)]
    num_layers: usize,

    #[arg(long, default_value_t = TemporalStrategy::Uniform)]
    temporal_strategy: TemporalStrategy,
}

fn print_subgraph(label: &str, sub: &Subgraph, names: &[String]) {
    println!(
        "│  {label}: {} seeds, {} nodes, {} edges",
        sub.num_seeds(),
        sub.num_nodes(),
        sub.num_edges()
    );
    for (t, set) in sub.nodes.iter().enumerate() {
        if !set.is_empty() {
            println!("│      {:<16} {:>8} nodes", names[t], set.len());
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let dataset = load_dataset(&args.dataset_dir)?;
    let graph = &dataset.graph;
    let schema = graph.schema();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Dataset: {} ({})", dataset.name, args.dataset_dir.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node types: {:>10}", schema.num_node_types());
    println!("║  Edge types: {:>10}", schema.num_edge_types());
    println!("║  Tasks:      {:>10}", dataset.tasks.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Node & Edge Types ────────────────────────────────────────────────
    for (t, meta) in schema.node_types.iter().enumerate() {
        println!(
            "┌─ Node type {t}: \"{}\"  nodes={}  feature_dim={}  temporal={}",
            meta.name, meta.num_nodes, meta.feature_dim, meta.temporal
        );
        for &e in graph.incoming(NodeType(t as u32)) {
            let csr = graph.adjacency(e);
            let max_degree = (0..csr.num_nodes() as u32)
                .map(|n| csr.degree(n))
                .max()
                .unwrap_or(0);
            println!(
                "│  ← {:<40} edges={:>10}  max in-degree={max_degree}",
                schema.edge_type_name(e),
                csr.num_edges()
            );
        }
        println!("└─");
    }
    println!();

    // ── Tasks ────────────────────────────────────────────────────────────
    for task in &dataset.tasks {
        let meta = &task.meta;
        println!(
            "┌─ Task \"{}\" ({})  {} → {}  eval_k={}",
            meta.name,
            meta.task_type,
            schema.node_meta(meta.src_entity).name,
            schema.node_meta(meta.dst_entity).name,
            meta.eval_k
        );
        for split in Split::ALL {
            let examples = task.split(split);
            let times = examples.iter().map(|e| e.time);
            println!(
                "│  {split:<5} examples={:>8}  time range=[{}, {}]",
                examples.len(),
                times.clone().min().unwrap_or_default(),
                times.max().unwrap_or_default()
            );
        }
        println!("│  val seed time={}  test seed time={}", meta.val_seed_time, meta.test_seed_time);
        println!("└─");
    }
    println!();

    // ── Sample Batch ─────────────────────────────────────────────────────
    let task_name = match &args.task {
        Some(name) => name.clone(),
        None => match dataset.task_names().next() {
            Some(name) => name.to_string(),
            None => return Ok(()),
        },
    };
    let task = dataset.link_task(&task_name)?;
    let sampler = Arc::new(NeighborSampler::new(
        Arc::clone(graph),
        fanout_schedule(args.num_neighbors, args.num_layers),
        args.temporal_strategy,
    ));
    let loader = LinkLoader::new(
        sampler,
        task.examples(Split::Train).into(),
        task.src_entity(),
        task.dst_entity(),
        LinkLoaderConfig {
            batch_size: args.batch_size,
            ..Default::default()
        },
    )?;
    let names: Vec<String> = schema.node_types.iter().map(|m| m.name.clone()).collect();

    println!("┌─ Sample training batch of \"{task_name}\"");
    if let Some(batch) = loader.epoch(0, 1)?.next() {
        let batch = batch?;
        println!("│  examples={}  shared_time={}  times={:?}", batch.len(), batch.shared_time, batch.times);
        print_subgraph("source", &batch.src, &names);
        print_subgraph("positive", &batch.pos_dst, &names);
        print_subgraph("negative", &batch.neg_dst, &names);
        for (e, edge_set) in batch.src.edges.iter().enumerate() {
            if !edge_set.is_empty() {
                println!(
                    "│      {:<40} {:>8} sampled edges",
                    schema.edge_type_name(EdgeType(e as u32)),
                    edge_set.len()
                );
            }
        }
    } else {
        println!("│  (no training examples)");
    }
    println!("└─");
    Ok(())
}
