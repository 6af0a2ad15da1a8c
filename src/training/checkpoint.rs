/// Model checkpointing with safetensors
use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::SafeTensors;

use crate::{Result, VisionError};

/// Header key the metadata JSON is stored under
const METADATA_KEY: &str = "checkpoint";

/// Checkpoint metadata
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Completed epochs
    pub epoch: usize,
    /// Optimizer steps taken
    pub step: usize,
    /// Learning rate at checkpoint
    pub lr: f64,
    /// Mean training loss of the last epoch
    pub train_loss: Option<f64>,
    /// Mean validation loss of the last epoch
    pub val_loss: Option<f64>,
    /// Model configuration (as JSON string)
    pub config: Option<String>,
}

/// Model checkpoint
pub struct Checkpoint {
    /// Model parameters
    pub tensors: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Snapshot every variable in `varmap`
    pub fn from_varmap(varmap: &VarMap, metadata: CheckpointMetadata) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| VisionError::Checkpoint("parameter map lock poisoned".to_string()))?;

        let mut tensors = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            // copy so later optimizer steps do not show through
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(Self::new(tensors, metadata))
    }

    /// Save checkpoint to file
    ///
    /// The metadata travels as JSON in the safetensors header, so the file
    /// stays loadable by any safetensors reader.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let metadata_json = serde_json::to_string(&self.metadata)?;
        let header = Some(HashMap::from([(METADATA_KEY.to_string(), metadata_json)]));

        safetensors::serialize_to_file(self.tensors.iter(), &header, path).map_err(|e| {
            VisionError::Checkpoint(format!("failed to write {}: {}", path.display(), e))
        })?;

        log::debug!("Wrote {} tensors to {}", self.tensors.len(), path.display());
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    ///
    /// # Returns
    /// Loaded checkpoint
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| {
            VisionError::Checkpoint(format!("failed to parse {}: {}", path.display(), e))
        })?;
        let metadata = match header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
        {
            Some(json) => serde_json::from_str(json)?,
            None => {
                log::warn!("{} carries no checkpoint metadata", path.display());
                CheckpointMetadata::default()
            }
        };

        let tensors = candle_core::safetensors::load_buffer(&data, device)?;
        Ok(Self { tensors, metadata })
    }

    /// Copy the stored tensors into the matching variables of `varmap`
    ///
    /// Every variable must have a stored tensor of the same shape.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| VisionError::Checkpoint("parameter map lock poisoned".to_string()))?;

        for (name, var) in data.iter() {
            let tensor = self
                .tensors
                .get(name)
                .ok_or_else(|| VisionError::Checkpoint(format!("missing tensor '{}'", name)))?;
            if tensor.dims() != var.dims() {
                return Err(VisionError::Checkpoint(format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }

        if self.tensors.len() > data.len() {
            log::warn!(
                "Checkpoint has {} tensors, model uses {}",
                self.tensors.len(),
                data.len()
            );
        }
        Ok(())
    }
}
