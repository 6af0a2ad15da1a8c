/// Configuration for the data pipeline, the classifier and a training run
///
/// Defaults reproduce the single-node CIFAR-10 setup: 32x32x3 images, ten
/// classes, channel-wise (0.5, 0.5) normalization and a 128 / 32 batch split
/// between training and evaluation.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{Phase, ShardAssignment};
use crate::training::TrainingConfig;
use crate::{Result, VisionError};

/// Names of the table columns a dataset reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Column holding the raw image bytes
    pub src_field: String,
    /// Column holding the integer class label
    pub target_field: String,
    /// Column holding the unique record id (also the sharding key)
    pub id_field: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            src_field: "image".to_string(),
            target_field: "label".to_string(),
            id_field: "id".to_string(),
        }
    }
}

impl FieldMapping {
    /// Field names in read order: id, source, target
    pub fn names(&self) -> [&str; 3] {
        [&self.id_field, &self.src_field, &self.target_field]
    }
}

/// Channel-wise affine normalization: `x' = (x / 255 - mean) / std`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }
    }
}

impl TransformConfig {
    pub fn validate(&self, channels: usize) -> Result<()> {
        if self.mean.len() != channels || self.std.len() != channels {
            return Err(VisionError::Config(format!(
                "normalization expects {} channels, got mean={} std={}",
                channels,
                self.mean.len(),
                self.std.len()
            )));
        }
        if self.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(VisionError::Config(
                "normalization std must be finite and non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of one streaming dataset instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Table location
    pub path: PathBuf,

    /// Columns to read
    #[serde(default)]
    pub fields: FieldMapping,

    /// Restrict this instance to one rank's shard
    #[serde(default)]
    pub use_fixed_rank: bool,

    /// Rank served by this instance (required when `use_fixed_rank`)
    #[serde(default)]
    pub fixed_rank: Option<usize>,

    /// Total number of ranks (required when `use_fixed_rank`)
    #[serde(default)]
    pub num_ranks: Option<usize>,

    /// Expected raw image shape as (height, width, channels)
    pub apply_src_numpy_shape: [usize; 3],

    /// Labels must fall in `[0, num_classes)`
    pub num_classes: usize,

    /// Background reader threads (minimum 1)
    pub num_workers: usize,

    /// Decoded samples each worker may buffer ahead of the consumer
    #[serde(default = "default_prefetch_per_worker")]
    pub prefetch_per_worker: usize,

    /// Permute record order within each worker's slice on every pass
    pub shuffle: bool,

    /// Seed for reproducible shuffles; pass `k` uses `seed + k`
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_prefetch_per_worker() -> usize {
    64
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cifar_train.delta"),
            fields: FieldMapping::default(),
            use_fixed_rank: false,
            fixed_rank: None,
            num_ranks: None,
            apply_src_numpy_shape: [32, 32, 3],
            num_classes: 10,
            num_workers: 2,
            prefetch_per_worker: default_prefetch_per_worker(),
            shuffle: true,
            seed: None,
        }
    }
}

impl DatasetConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(VisionError::Config("num_workers must be >= 1".to_string()));
        }
        if self.prefetch_per_worker == 0 {
            return Err(VisionError::Config(
                "prefetch_per_worker must be >= 1".to_string(),
            ));
        }
        if self.apply_src_numpy_shape.iter().any(|d| *d == 0) {
            return Err(VisionError::Config(format!(
                "apply_src_numpy_shape must be non-zero, got {:?}",
                self.apply_src_numpy_shape
            )));
        }
        if self.num_classes == 0 {
            return Err(VisionError::Config("num_classes must be > 0".to_string()));
        }
        self.shard_assignment()?;
        Ok(())
    }

    /// Resolve the rank flags into a shard assignment
    pub fn shard_assignment(&self) -> Result<ShardAssignment> {
        if !self.use_fixed_rank {
            return Ok(ShardAssignment::Unsharded);
        }
        match (self.fixed_rank, self.num_ranks) {
            (Some(rank), Some(num_ranks)) => ShardAssignment::fixed(rank, num_ranks),
            _ => Err(VisionError::ShardConfiguration(
                "use_fixed_rank requires both fixed_rank and num_ranks".to_string(),
            )),
        }
    }
}

/// Configuration of the batch assembler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Samples per batch
    pub batch_size: usize,

    /// Reshuffle samples across a bounded buffer before batching
    pub shuffle: bool,

    /// Shuffle buffer size, in batches
    #[serde(default = "default_shuffle_buffer_batches")]
    pub shuffle_buffer_batches: usize,

    /// Drop the short final batch instead of emitting it
    #[serde(default)]
    pub drop_last: bool,

    /// Background collation threads; 0 assembles on the caller's thread
    pub num_workers: usize,

    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_shuffle_buffer_batches() -> usize {
    4
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            shuffle_buffer_batches: default_shuffle_buffer_batches(),
            drop_last: false,
            num_workers: 0,
            seed: None,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(VisionError::Config("batch_size must be >= 1".to_string()));
        }
        if self.shuffle && self.shuffle_buffer_batches == 0 {
            return Err(VisionError::Config(
                "shuffle_buffer_batches must be >= 1 when shuffling".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where tables live, resolved once by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageRoot {
    /// Tables under a local directory
    Local { root: PathBuf },
    /// Tables on a distributed filesystem exposed under a local mount prefix
    Distributed { mount: PathBuf, root: PathBuf },
}

impl Default for StorageRoot {
    fn default() -> Self {
        StorageRoot::Local {
            root: PathBuf::from("/tmp/datasets"),
        }
    }
}

impl StorageRoot {
    /// Directory holding the tables
    pub fn base(&self) -> PathBuf {
        match self {
            StorageRoot::Local { root } => root.clone(),
            StorageRoot::Distributed { mount, root } => {
                // `/tmp/x` under mount `/dbfs` becomes `/dbfs/tmp/x`
                let relative: PathBuf = root
                    .components()
                    .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                    .collect();
                mount.join(relative)
            }
        }
    }

    /// Full path of a named table
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.base().join(table)
    }
}

/// Per-phase data settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Table name under the storage root
    pub table: String,
    pub batch_size: usize,
    /// Dataset reader threads; 0 falls back to 2
    pub num_workers: usize,
    /// Record-level shuffling inside the dataset
    pub shuffle: bool,
    /// Batch-level shuffling in the loader
    #[serde(default)]
    pub batch_shuffle: bool,
    #[serde(default)]
    pub loader_workers: usize,
    #[serde(default)]
    pub drop_last: bool,
    #[serde(default)]
    pub use_fixed_rank: bool,
    #[serde(default)]
    pub fixed_rank: Option<usize>,
    #[serde(default)]
    pub num_ranks: Option<usize>,
}

impl PhaseConfig {
    fn new(table: &str, batch_size: usize, num_workers: usize) -> Self {
        Self {
            table: table.to_string(),
            batch_size,
            num_workers,
            shuffle: true,
            batch_shuffle: false,
            loader_workers: 0,
            drop_last: false,
            use_fixed_rank: false,
            fixed_rank: None,
            num_ranks: None,
        }
    }

    /// Reader threads actually used by the dataset
    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            2
        }
    }
}

/// Configuration of the three-phase data module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModuleConfig {
    pub storage_root: StorageRoot,
    #[serde(default)]
    pub fields: FieldMapping,
    /// Raw image shape as (height, width, channels)
    pub image_shape: [usize; 3],
    pub num_classes: usize,
    #[serde(default)]
    pub transform: TransformConfig,
    pub phases: BTreeMap<Phase, PhaseConfig>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        let mut phases = BTreeMap::new();
        phases.insert(Phase::Train, PhaseConfig::new("cifar_train.delta", 128, 4));
        phases.insert(Phase::Validate, PhaseConfig::new("cifar_test.delta", 32, 0));
        phases.insert(Phase::Test, PhaseConfig::new("cifar_test.delta", 32, 0));

        Self {
            storage_root: StorageRoot::default(),
            fields: FieldMapping::default(),
            image_shape: [32, 32, 3],
            num_classes: 10,
            transform: TransformConfig::default(),
            phases,
            seed: None,
        }
    }
}

impl DataModuleConfig {
    pub fn validate(&self) -> Result<()> {
        self.transform.validate(self.image_shape[2])?;
        for phase in Phase::ALL {
            self.dataset_config(phase)?.validate()?;
            self.loader_config(phase)?.validate()?;
        }
        Ok(())
    }

    pub fn phase(&self, phase: Phase) -> Result<&PhaseConfig> {
        self.phases
            .get(&phase)
            .ok_or_else(|| VisionError::Config(format!("no data configured for phase {phase}")))
    }

    /// Dataset settings for a phase
    pub fn dataset_config(&self, phase: Phase) -> Result<DatasetConfig> {
        let p = self.phase(phase)?;
        Ok(DatasetConfig {
            path: self.storage_root.table_path(&p.table),
            fields: self.fields.clone(),
            use_fixed_rank: p.use_fixed_rank,
            fixed_rank: p.fixed_rank,
            num_ranks: p.num_ranks,
            apply_src_numpy_shape: self.image_shape,
            num_classes: self.num_classes,
            num_workers: p.effective_workers(),
            prefetch_per_worker: default_prefetch_per_worker(),
            shuffle: p.shuffle,
            seed: self.seed,
        })
    }

    /// Loader settings for a phase
    pub fn loader_config(&self, phase: Phase) -> Result<LoaderConfig> {
        let p = self.phase(phase)?;
        Ok(LoaderConfig {
            batch_size: p.batch_size,
            shuffle: p.batch_shuffle,
            shuffle_buffer_batches: default_shuffle_buffer_batches(),
            drop_last: p.drop_last,
            num_workers: p.loader_workers,
            seed: self.seed,
        })
    }
}

/// Configuration for the convolutional classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Input shape as (channels, height, width)
    pub input_shape: [usize; 3],

    /// Output width of each convolution, applied in order
    pub conv_channels: Vec<usize>,

    /// Square kernel size, stride 1, no padding
    pub kernel_size: usize,

    /// Indices of the convolutions followed by a 2x2 max-pool
    pub pool_after: Vec<usize>,

    /// Widths of the hidden dense layers
    pub hidden_sizes: Vec<usize>,

    /// Number of output classes
    pub num_classes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_shape: [3, 32, 32],
            conv_channels: vec![32, 32, 64, 64],
            kernel_size: 3,
            pool_after: vec![1, 3],
            hidden_sizes: vec![512, 128],
            num_classes: 10,
        }
    }
}

impl ClassifierConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_shape.iter().any(|d| *d == 0) {
            return Err(VisionError::Config(format!(
                "input_shape must be non-zero, got {:?}",
                self.input_shape
            )));
        }

        if self.conv_channels.is_empty() || self.conv_channels.contains(&0) {
            return Err(VisionError::Config(
                "conv_channels must be non-empty and > 0".to_string(),
            ));
        }

        if self.kernel_size == 0 {
            return Err(VisionError::Config("kernel_size must be > 0".to_string()));
        }

        if let Some(idx) = self.pool_after.iter().find(|i| **i >= self.conv_channels.len()) {
            return Err(VisionError::Config(format!(
                "pool_after index {} out of range for {} convolutions",
                idx,
                self.conv_channels.len()
            )));
        }

        if self.hidden_sizes.contains(&0) || self.num_classes == 0 {
            return Err(VisionError::Config(
                "hidden_sizes and num_classes must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Everything a training run needs, loadable from one JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub data: DataModuleConfig,
    #[serde(default)]
    pub model: ClassifierConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl ExperimentConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.model.validate()?;
        self.training.validate()?;

        let [h, w, c] = self.data.image_shape;
        if self.model.input_shape != [c, h, w] {
            return Err(VisionError::Config(format!(
                "model input_shape {:?} does not match image_shape {:?} (HWC)",
                self.model.input_shape, self.data.image_shape
            )));
        }
        if self.model.num_classes != self.data.num_classes {
            return Err(VisionError::Config(format!(
                "model has {} classes but data has {}",
                self.model.num_classes, self.data.num_classes
            )));
        }
        Ok(())
    }
}
