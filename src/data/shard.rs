/// Partitioning of records across ranks by id
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, VisionError};

/// Which records a dataset instance is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardAssignment {
    /// Every record
    Unsharded,
    /// Records whose id maps to `rank` out of `num_ranks`
    Fixed { rank: usize, num_ranks: usize },
}

impl ShardAssignment {
    pub fn fixed(rank: usize, num_ranks: usize) -> Result<Self> {
        if num_ranks == 0 {
            return Err(VisionError::ShardConfiguration(
                "num_ranks must be > 0".to_string(),
            ));
        }
        if i64::try_from(num_ranks).is_err() {
            return Err(VisionError::ShardConfiguration(format!(
                "num_ranks {} does not fit the id range",
                num_ranks
            )));
        }
        if rank >= num_ranks {
            return Err(VisionError::ShardConfiguration(format!(
                "fixed_rank {} must be < num_ranks {}",
                rank, num_ranks
            )));
        }
        Ok(ShardAssignment::Fixed { rank, num_ranks })
    }

    /// Rank owning `id`. Euclidean remainder keeps negative ids in range.
    pub fn rank_of(id: i64, num_ranks: usize) -> usize {
        // i128 holds every usize, so no rank count wraps
        i128::from(id).rem_euclid(num_ranks as i128) as usize
    }

    pub fn owns(&self, id: i64) -> bool {
        match *self {
            ShardAssignment::Unsharded => true,
            ShardAssignment::Fixed { rank, num_ranks } => Self::rank_of(id, num_ranks) == rank,
        }
    }

    /// Row indices (in table order) of the ids this shard owns
    pub fn select_rows(&self, ids: &[i64]) -> Vec<usize> {
        ids.iter()
            .enumerate()
            .filter(|(_, id)| self.owns(**id))
            .map(|(row, _)| row)
            .collect()
    }
}

impl fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardAssignment::Unsharded => write!(f, "unsharded"),
            ShardAssignment::Fixed { rank, num_ranks } => write!(f, "rank {}/{}", rank, num_ranks),
        }
    }
}
