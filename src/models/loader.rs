/// Rebuild a classifier from a checkpoint file
///
/// Checkpoints written by the trainer carry the model's `ClassifierConfig`
/// as JSON in their metadata, so [`load_model`] needs nothing but the path.
/// Plain safetensors weight files have no such header and go through
/// [`load_model_with_config`].
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::ConvClassifier;
use crate::config::ClassifierConfig;
use crate::training::Checkpoint;
use crate::{Result, VisionError};

/// Load a self-describing checkpoint
pub fn load_model<P: AsRef<Path>>(path: P, device: &Device) -> Result<ConvClassifier> {
    let path = path.as_ref();
    let checkpoint = Checkpoint::load(path, device)?;

    let json = checkpoint.metadata.config.as_deref().ok_or_else(|| {
        VisionError::Checkpoint(format!(
            "{} has no model config; use load_model_with_config",
            path.display()
        ))
    })?;
    let config: ClassifierConfig = serde_json::from_str(json)?;

    build(config, &checkpoint, device)
}

/// Load weights for an explicitly given architecture
///
/// A config stored in the file must agree with `config`.
pub fn load_model_with_config<P: AsRef<Path>>(
    config: ClassifierConfig,
    path: P,
    device: &Device,
) -> Result<ConvClassifier> {
    let checkpoint = Checkpoint::load(path.as_ref(), device)?;

    if let Some(json) = &checkpoint.metadata.config {
        let stored: ClassifierConfig = serde_json::from_str(json)?;
        if stored != config {
            return Err(VisionError::Checkpoint(format!(
                "{} was written for {:?}, not {:?}",
                path.as_ref().display(),
                stored,
                config
            )));
        }
    }

    build(config, &checkpoint, device)
}

fn build(config: ClassifierConfig, checkpoint: &Checkpoint, device: &Device) -> Result<ConvClassifier> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = ConvClassifier::new(config, vb)?;

    // The model shares storage with the varmap's variables
    checkpoint.restore(&varmap)?;

    log::info!(
        "Loaded classifier (epoch {}, step {}) with {} tensors",
        checkpoint.metadata.epoch,
        checkpoint.metadata.step,
        checkpoint.tensors.len()
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::CheckpointMetadata;
    use candle_core::Tensor;

    fn small_config() -> ClassifierConfig {
        ClassifierConfig {
            input_shape: [3, 12, 12],
            conv_channels: vec![4, 4],
            pool_after: vec![1],
            hidden_sizes: vec![8],
            num_classes: 3,
            ..Default::default()
        }
    }

    fn fresh(config: &ClassifierConfig, device: &Device) -> Result<(VarMap, ConvClassifier)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = ConvClassifier::new(config.clone(), vb)?;
        Ok((varmap, model))
    }

    fn outputs(model: &ConvClassifier, x: &Tensor) -> Result<Vec<f32>> {
        Ok(model.forward(x)?.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_checkpoint_rebuilds_model_from_its_header() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let (varmap, model) = fresh(&config, &device)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let metadata = CheckpointMetadata {
            config: Some(serde_json::to_string(&config)?),
            ..Default::default()
        };
        Checkpoint::from_varmap(&varmap, metadata)?.save(&path)?;

        let loaded = load_model(&path, &device)?;
        assert_eq!(loaded.config(), &config);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 12, 12), &device)?;
        assert_eq!(outputs(&loaded, &x)?, outputs(&model, &x)?);
        Ok(())
    }

    #[test]
    fn test_plain_weights_need_explicit_config() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let (varmap, model) = fresh(&config, &device)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");
        varmap.save(&path)?;

        assert!(matches!(
            load_model(&path, &device),
            Err(VisionError::Checkpoint(_))
        ));

        let loaded = load_model_with_config(config, &path, &device)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 12, 12), &device)?;
        assert_eq!(outputs(&loaded, &x)?, outputs(&model, &x)?);
        Ok(())
    }

    #[test]
    fn test_conflicting_config_rejected() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let (varmap, _model) = fresh(&config, &device)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let metadata = CheckpointMetadata {
            config: Some(serde_json::to_string(&config)?),
            ..Default::default()
        };
        Checkpoint::from_varmap(&varmap, metadata)?.save(&path)?;

        let other = ClassifierConfig {
            num_classes: 4,
            ..small_config()
        };
        assert!(matches!(
            load_model_with_config(other, &path, &device),
            Err(VisionError::Checkpoint(_))
        ));
        Ok(())
    }
}
