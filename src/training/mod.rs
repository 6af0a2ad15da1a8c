/// Training infrastructure for the classifier

pub mod checkpoint;
pub mod early_stopping;
pub mod metrics;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use early_stopping::{EarlyStopping, EarlyStoppingConfig};
pub use metrics::{EpochSummary, PhaseMetrics, StepMetrics};
pub use trainer::{Trainer, TrainingConfig};
