/// Data supply: transform, sharded streaming dataset, batching, phases
pub mod dataset;
pub mod loader;
pub mod module;
pub mod shard;
pub mod transform;

pub use dataset::{plan_pass, Sample, SampleStream, StreamingDataset};
pub use loader::{collate, Batch, BatchStream, DataLoader};
pub use module::{DataModule, Phase};
pub use shard::ShardAssignment;
pub use transform::{ImageShape, ImageTransform, SampleTransform};

use crate::Result;

/// Stateful, epoch-resettable view of a batch source
pub trait BatchDataLoader {
    /// Get next batch of the current pass, starting one if needed
    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Abandon the current pass; the next call to `next_batch` starts a new one
    fn reset(&mut self);

    /// Get total number of batches per pass
    fn num_batches(&self) -> usize;
}
