//! Contiguous sharding of the training examples across workers.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    /// The first `N % world_size` workers take one extra example.
    #[default]
    Balanced,
    /// Every worker takes `ceil(N / world_size)` examples, the tail is clamped.
    CeilDiv,
}

impl FromStr for ShardStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(ShardStrategy::Balanced),
            "ceil_div" | "ceildiv" => Ok(ShardStrategy::CeilDiv),
            other => Err(format!("unknown shard strategy '{other}' (expected balanced|ceil_div)")),
        }
    }
}

impl fmt::Display for ShardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStrategy::Balanced => f.write_str("balanced"),
            ShardStrategy::CeilDiv => f.write_str("ceil_div"),
        }
    }
}

/// Splits `num_examples` ordered examples into `world_size` contiguous,
/// disjoint index ranges whose union is `0..num_examples`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    num_examples: usize,
    world_size: usize,
    strategy: ShardStrategy,
}

impl Partitioner {
    pub fn new(num_examples: usize, world_size: usize, strategy: ShardStrategy) -> Result<Self, PartitionError> {
        if world_size == 0 {
            return Err(PartitionError::ZeroWorldSize);
        }
        Ok(Self {
            num_examples,
            world_size,
            strategy,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn shard_range(&self, rank: usize) -> Result<Range<usize>, PartitionError> {
        if rank >= self.world_size {
            return Err(PartitionError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            });
        }
        let n = self.num_examples;
        let w = self.world_size;
        let range = match self.strategy {
            ShardStrategy::Balanced => {
                let base = n / w;
                let extra = n % w;
                let start = rank * base + rank.min(extra);
                let len = base + usize::from(rank < extra);
                start..start + len
            }
            ShardStrategy::CeilDiv => {
                let shard = n.div_ceil(w);
                let start = (rank * shard).min(n);
                let end = ((rank + 1) * shard).min(n);
                start..end
            }
        };
        Ok(range)
    }

    /// The slice of `items` owned by `rank`. Applying the same range to
    /// sources, destinations and times keeps triples aligned.
    pub fn shard<'a, T>(&self, rank: usize, items: &'a [T]) -> Result<&'a [T], PartitionError> {
        if items.len() != self.num_examples {
            return Err(PartitionError::LengthMismatch {
                expected: self.num_examples,
                actual: items.len(),
            });
        }
        Ok(&items[self.shard_range(rank)?])
    }

    pub fn shard_sizes(&self) -> Vec<usize> {
        (0..self.world_size)
            .map(|r| self.shard_range(r).map(|range| range.len()).unwrap_or(0))
            .collect()
    }
}

/// Steps every worker runs per epoch: the smallest per-rank batch count,
/// capped by `max_steps`. All-reduce needs every rank at the same step.
pub fn lockstep_steps(batches_per_rank: impl IntoIterator<Item = usize>, max_steps: usize) -> usize {
    batches_per_rank.into_iter().min().unwrap_or(0).min(max_steps)
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("world size must be at least 1")]
    ZeroWorldSize,

    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("expected {expected} items to shard, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}
