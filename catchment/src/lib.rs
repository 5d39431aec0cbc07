use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod graph;
pub mod loader;
pub mod partition;
pub mod sampler;
pub mod store;
pub mod synthetic;
pub mod task;
