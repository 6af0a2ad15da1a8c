//! Delta Vision - streaming image classification on candle
//!
//! Streams labeled images out of a versioned columnar table, turns them into
//! normalized tensors on a pool of background reader threads and trains a
//! small convolutional classifier against that stream.
//!
//! # Architecture
//!
//! The data path runs leaves first:
//! - **Storage**: a [`storage::RecordSource`] yields raw `(id, image, label)` records
//! - **Transform**: [`data::ImageTransform`] decodes and normalizes one record
//! - **Dataset**: [`data::StreamingDataset`] shards, shuffles and fans out reads
//! - **Loader**: [`data::DataLoader`] groups samples into [`data::Batch`]es
//!
//! On top of it, [`training::Trainer`] runs the train / validate / test phases
//! of a [`models::ConvClassifier`].
//!
//! # Example
//!
//! ```ignore
//! use delta_vision::{DataModule, ExperimentConfig, Trainer};
//!
//! let config = ExperimentConfig::default();
//! let data = DataModule::new(config.data.clone(), device.clone())?;
//! let mut trainer = Trainer::new(config.model, config.training, device)?;
//! trainer.fit(&data)?;
//! let metrics = trainer.test(&data)?;
//! ```

use std::path::PathBuf;

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod storage;
pub mod training;

// Re-export commonly used items
pub use config::{ClassifierConfig, DataModuleConfig, ExperimentConfig, StorageRoot};
pub use data::{DataLoader, DataModule, Phase, StreamingDataset};
pub use models::ConvClassifier;
pub use training::{Trainer, TrainingConfig};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Storage unavailable at {}: {reason}", .path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("Schema mismatch: field '{field}' not found (available: {available:?})")]
    SchemaMismatch { field: String, available: Vec<String> },

    #[error("Decode error for record {}: {reason}", display_id(.id))]
    Decode { id: Option<i64>, reason: String },

    #[error("Shard configuration error: {0}")]
    ShardConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VisionError {
    /// Attach a record id to a decode error that was raised without one.
    pub fn for_record(self, record_id: i64) -> Self {
        match self {
            VisionError::Decode { id: None, reason } => VisionError::Decode {
                id: Some(record_id),
                reason,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;

fn display_id(id: &Option<i64>) -> String {
    id.map_or_else(|| "<unknown>".to_string(), |id| id.to_string())
}
