//! Link batch construction throughput.
//!
//! Measures how fast the training loader turns example indices into sampled
//! source / positive / negative subgraphs, across batch sizes and both
//! batching modes, on the synthetic event dataset.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench link_sampler_throughput
//! ```

use std::sync::Arc;

use catchment::common::{Split, TemporalStrategy, fanout_schedule};
use catchment::loader::{LinkLoader, LinkLoaderConfig};
use catchment::sampler::NeighborSampler;
use catchment::store::Dataset;
use catchment::synthetic::{SyntheticConfig, TASK_NAME, generate};
use criterion::{BenchmarkId, Criterion, Throughput};

// ============================================================================
// Fixtures
// ============================================================================

fn dataset() -> Dataset {
    generate(&SyntheticConfig {
        num_users: 5_000,
        num_events: 1_000,
        attendances_per_user: 16,
        ..Default::default()
    })
    .expect("synthetic dataset")
}

fn loader(dataset: &Dataset, strategy: TemporalStrategy, batch_size: usize, shared_time: bool) -> LinkLoader {
    let task = dataset.link_task(TASK_NAME).expect("link task");
    let sampler = Arc::new(NeighborSampler::new(
        Arc::clone(&dataset.graph),
        fanout_schedule(64, 2),
        strategy,
    ));
    LinkLoader::new(
        sampler,
        task.examples(Split::Train).into(),
        task.src_entity(),
        task.dst_entity(),
        LinkLoaderConfig {
            batch_size,
            shared_time,
            max_steps: 8,
            ..Default::default()
        },
    )
    .expect("loader")
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_batch_size_sweep(c: &mut Criterion, dataset: &Dataset) {
    let mut group = c.benchmark_group("batch_size_sweep");
    group.sample_size(20);

    for batch_size in [128, 512, 2048] {
        let loader = loader(dataset, TemporalStrategy::Uniform, batch_size, false);
        let steps = loader.num_batches().min(8);
        group.throughput(Throughput::Elements((steps * batch_size) as u64));
        group.bench_with_input(BenchmarkId::new("independent", batch_size), &loader, |b, loader| {
            b.iter(|| {
                loader
                    .epoch(0, steps)
                    .unwrap()
                    .map(|batch| batch.unwrap().len())
                    .sum::<usize>()
            });
        });
    }
    group.finish();
}

fn bench_modes(c: &mut Criterion, dataset: &Dataset) {
    let mut group = c.benchmark_group("modes");
    group.sample_size(20);

    for (name, strategy, shared_time) in [
        ("uniform_shared", TemporalStrategy::Uniform, true),
        ("uniform_independent", TemporalStrategy::Uniform, false),
        ("last_independent", TemporalStrategy::Last, false),
    ] {
        let loader = loader(dataset, strategy, 512, shared_time);
        group.bench_function(name, |b| {
            b.iter(|| loader.epoch(0, 4).unwrap().map(|batch| batch.unwrap().len()).sum::<usize>());
        });
    }
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let dataset = dataset();
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(3))
        .measurement_time(std::time::Duration::from_secs(15))
        .configure_from_args();

    bench_batch_size_sweep(&mut criterion, &dataset);
    bench_modes(&mut criterion, &dataset);

    criterion.final_summary();
}
