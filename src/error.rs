use catchment::partition::PartitionError;
use catchment::sampler::SamplerError;
use catchment::store::StoreError;
use catchment::task::TaskError;

/// Error type for training, evaluation and run coordination.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { loss: f64, epoch: usize, step: usize },

    #[error("tensor data conversion failed: {0}")]
    Data(String),

    #[error("aborted at {0}: another worker failed")]
    Aborted(String),

    #[error("worker {0} panicked")]
    WorkerPanic(usize),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
