/// Train / validate / test data wiring
use std::fmt;
use std::sync::Arc;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use super::dataset::StreamingDataset;
use super::loader::DataLoader;
use super::transform::{ImageTransform, SampleTransform};
use crate::config::DataModuleConfig;
use crate::Result;

/// Stage of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Validate,
    Test,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Validate, Phase::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validate => "validate",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the per-phase loaders from one [`DataModuleConfig`].
///
/// Every [`DataModule::loader`] call opens the phase's table again and returns
/// an independent loader; every [`DataLoader::iter`] on it is a fresh pass.
pub struct DataModule {
    config: DataModuleConfig,
    transform: Arc<dyn SampleTransform>,
    device: Device,
}

impl DataModule {
    pub fn new(config: DataModuleConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let transform: Arc<dyn SampleTransform> = Arc::new(ImageTransform::new(&config.transform));
        Ok(Self {
            config,
            transform,
            device,
        })
    }

    /// Replace the sample transform used by every phase
    pub fn with_transform(mut self, transform: Arc<dyn SampleTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Open the phase's dataset
    pub fn dataset(&self, phase: Phase) -> Result<StreamingDataset> {
        let config = self.config.dataset_config(phase)?;
        StreamingDataset::open(config, Arc::clone(&self.transform))
    }

    /// Build a new loader for the phase
    pub fn loader(&self, phase: Phase) -> Result<DataLoader> {
        let dataset = self.dataset(phase)?;
        let loader = DataLoader::new(
            Arc::new(dataset),
            self.config.loader_config(phase)?,
            self.device.clone(),
        )?;

        log::info!(
            "{} loader: {} samples, batch size {}, {} batches per pass",
            phase,
            loader.dataset().len(),
            loader.batch_size(),
            loader.num_batches()
        );

        Ok(loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageRoot;
    use crate::storage::{OwnedRecord, TableWriter};
    use crate::VisionError;

    fn write_tables(root: &std::path::Path) -> crate::Result<()> {
        let records = |n: i64| -> Vec<OwnedRecord> {
            (0..n)
                .map(|i| OwnedRecord::new(i, vec![i as u8; 32 * 32 * 3], i % 10))
                .collect()
        };
        TableWriter::new(root.join("cifar_train.delta")).commit(&records(300))?;
        TableWriter::new(root.join("cifar_test.delta")).commit(&records(70))?;
        Ok(())
    }

    fn module(root: &std::path::Path) -> DataModule {
        let mut config = DataModuleConfig {
            storage_root: StorageRoot::Local {
                root: root.to_path_buf(),
            },
            ..Default::default()
        };
        for phase in config.phases.values_mut() {
            phase.num_workers = 2;
        }
        DataModule::new(config, Device::Cpu).unwrap()
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Validate.to_string(), "validate");
        assert_eq!(serde_json::to_string(&Phase::Test).unwrap(), "\"test\"");
    }

    #[test]
    fn test_each_phase_gets_its_own_loader() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_tables(dir.path())?;
        let data = module(dir.path());

        let train = data.loader(Phase::Train)?;
        assert_eq!(train.batch_size(), 128);
        assert_eq!(train.num_batches(), 3);

        let val = data.loader(Phase::Validate)?;
        assert_eq!(val.batch_size(), 32);
        assert_eq!(val.dataset().len(), 70);

        let sizes: Vec<usize> = val.iter()?.map(|b| b.map(|b| b.len())).collect::<crate::Result<_>>()?;
        assert_eq!(sizes, vec![32, 32, 6]);
        Ok(())
    }

    #[test]
    fn test_repeated_passes_are_independent() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_tables(dir.path())?;
        let data = module(dir.path());
        let train = data.loader(Phase::Train)?;

        for _ in 0..2 {
            let total: usize = train.iter()?.map(|b| b.map(|b| b.len())).sum::<crate::Result<usize>>()?;
            assert_eq!(total, 300);
        }

        // a second loader for the same phase is independent of the first
        let mut abandoned = train.iter()?;
        assert!(abandoned.next().is_some());
        let other = data.loader(Phase::Train)?;
        assert_eq!(other.iter()?.count(), 3);
        Ok(())
    }

    #[test]
    fn test_missing_phase_table() {
        let dir = tempfile::tempdir().unwrap();
        let data = module(dir.path());
        assert!(matches!(
            data.loader(Phase::Test),
            Err(VisionError::StorageUnavailable { .. })
        ));
    }
}
