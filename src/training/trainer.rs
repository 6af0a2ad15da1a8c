/// Training loop for ConvClassifier
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::checkpoint::{Checkpoint, CheckpointMetadata};
use super::early_stopping::{EarlyStopping, EarlyStoppingConfig};
use super::metrics::{EpochSummary, MetricsAccumulator, PhaseMetrics, StepMetrics};
use crate::config::ClassifierConfig;
use crate::data::{Batch, BatchDataLoader, DataModule, Phase};
use crate::models::ConvClassifier;
use crate::{Result, VisionError};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Weight decay (0 gives plain Adam)
    pub weight_decay: f64,
    /// Log the running loss every N optimizer steps
    pub log_every: usize,
    /// Checkpoint directory; `None` disables checkpoints
    pub checkpoint_dir: Option<PathBuf>,
    /// Stop on stalled validation loss
    pub early_stopping: Option<EarlyStoppingConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            learning_rate: 2e-4,
            weight_decay: 0.0,
            log_every: 50,
            checkpoint_dir: Some(PathBuf::from("checkpoints")),
            early_stopping: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(VisionError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(VisionError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if self.log_every == 0 {
            return Err(VisionError::Config("log_every must be > 0".to_string()));
        }
        if let Some(early_stopping) = &self.early_stopping {
            early_stopping.validate()?;
        }
        Ok(())
    }
}

/// Trainer for ConvClassifier
///
/// Owns the model parameters. Only [`Trainer::train_step`] changes them;
/// evaluation runs forward passes only.
pub struct Trainer {
    model: ConvClassifier,
    varmap: VarMap,
    optimizer: AdamW,
    config: TrainingConfig,
    device: Device,
    step: usize,
    epoch: usize,
}

impl Trainer {
    /// Create new trainer
    pub fn new(
        model_config: ClassifierConfig,
        training_config: TrainingConfig,
        device: Device,
    ) -> Result<Self> {
        training_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ConvClassifier::new(model_config, vb)?;

        let optimizer_params = ParamsAdamW {
            lr: training_config.learning_rate,
            weight_decay: training_config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), optimizer_params)?;

        log::info!(
            "Classifier with {} parameter tensors, feature width {}",
            varmap.all_vars().len(),
            model.feature_width()
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            config: training_config,
            device,
            step: 0,
            epoch: 0,
        })
    }

    pub fn model(&self) -> &ConvClassifier {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimizer steps taken so far
    pub fn step(&self) -> usize {
        self.step
    }

    /// Completed epochs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Mean NLL loss and correct-prediction count for a batch
    fn loss_and_correct(&self, batch: &Batch) -> Result<(Tensor, usize)> {
        let inputs = batch.inputs.to_device(&self.device)?;
        let labels = batch.labels.to_device(&self.device)?;

        let log_probs = self.model.forward(&inputs)?;
        let loss = loss::nll(&log_probs, &labels)?;

        let correct = log_probs
            .argmax(D::Minus1)?
            .eq(&labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as usize;

        Ok((loss, correct))
    }

    /// Training step: forward, backward and one optimizer update
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let (loss, correct) = self.loss_and_correct(batch)?;
        let loss_val = loss.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            return Err(VisionError::Training(format!(
                "non-finite loss {} at step {}",
                loss_val, self.step
            )));
        }

        // Backward pass + parameter update
        self.optimizer.backward_step(&loss)?;
        self.step += 1;

        Ok(StepMetrics {
            loss: loss_val,
            correct,
            samples: batch.len(),
        })
    }

    /// Forward-only step; parameters are not touched
    pub fn eval_step(&self, batch: &Batch) -> Result<StepMetrics> {
        let (loss, correct) = self.loss_and_correct(batch)?;
        Ok(StepMetrics {
            loss: loss.to_scalar::<f32>()?,
            correct,
            samples: batch.len(),
        })
    }

    /// Train for one epoch
    ///
    /// Starts a fresh pass over `loader`. Any error aborts the epoch.
    pub fn train_epoch(&mut self, loader: &mut impl BatchDataLoader) -> Result<PhaseMetrics> {
        let mut metrics = MetricsAccumulator::new(Phase::Train);
        let num_batches = loader.num_batches();

        loader.reset();
        while let Some(batch) = loader.next_batch()? {
            if batch.is_empty() {
                continue;
            }
            let step = self.train_step(&batch)?;
            metrics.push(&step);

            if self.step % self.config.log_every == 0 {
                log::info!(
                    "Step {}: loss={:.4}, acc={:.4}, batch {}/{}",
                    self.step,
                    step.loss,
                    step.accuracy(),
                    metrics.finish().batches,
                    num_batches
                );
            }
        }
        loader.reset();

        if metrics.samples() == 0 {
            log::warn!("Training pass produced no samples");
        }
        Ok(metrics.finish())
    }

    /// Run one evaluation pass over `loader`
    pub fn evaluate(&self, loader: &mut impl BatchDataLoader, phase: Phase) -> Result<PhaseMetrics> {
        let mut metrics = MetricsAccumulator::new(phase);

        loader.reset();
        while let Some(batch) = loader.next_batch()? {
            if batch.is_empty() {
                continue;
            }
            metrics.push(&self.eval_step(&batch)?);
        }
        loader.reset();

        Ok(metrics.finish())
    }

    /// Full training loop: train then validate once per epoch
    ///
    /// The train and validate loaders are built once; each epoch is a new
    /// pass over both.
    pub fn fit(&mut self, data: &DataModule) -> Result<Vec<EpochSummary>> {
        self.check_data(data)?;

        let mut train = data.loader(Phase::Train)?;
        let mut validate = data.loader(Phase::Validate)?;
        let mut early_stopping = self.config.early_stopping.map(EarlyStopping::new);
        let mut history = Vec::with_capacity(self.config.num_epochs);

        log::info!("Starting training for {} epochs", self.config.num_epochs);

        for _ in 0..self.config.num_epochs {
            let epoch = self.epoch + 1;
            log::info!("=== Epoch {}/{} ===", epoch, self.config.num_epochs);

            let train_metrics = self.train_epoch(&mut train)?;
            let val_metrics = self.evaluate(&mut validate, Phase::Validate)?;
            self.epoch = epoch;

            log::info!("Epoch {} complete: {} | {}", epoch, train_metrics, val_metrics);

            let summary = EpochSummary {
                epoch,
                train: train_metrics,
                validate: val_metrics,
            };
            history.push(summary);

            if let Some(dir) = self.config.checkpoint_dir.clone() {
                let path = dir.join(format!("checkpoint_epoch_{}.safetensors", epoch));
                self.save_checkpoint(&path, Some(&summary))?;
            }

            if let Some(stopper) = early_stopping.as_mut() {
                if val_metrics.samples > 0 && stopper.update(val_metrics.loss) {
                    log::info!(
                        "Early stopping after epoch {} (best val_loss={:.4})",
                        epoch,
                        stopper.best().unwrap_or(f64::NAN)
                    );
                    break;
                }
            }
        }

        log::info!("Training complete after {} steps", self.step);

        // The final model carries its config, so `load_model` can rebuild it alone
        if let Some(dir) = &self.config.checkpoint_dir {
            let final_path = dir.join("final_model.safetensors");
            self.save_checkpoint(&final_path, history.last())?;
        }

        Ok(history)
    }

    /// Evaluate on the test phase
    pub fn test(&self, data: &DataModule) -> Result<PhaseMetrics> {
        self.check_data(data)?;
        let mut loader = data.loader(Phase::Test)?;
        let metrics = self.evaluate(&mut loader, Phase::Test)?;
        log::info!("Test: {}", metrics);
        Ok(metrics)
    }

    /// Save checkpoint
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P, summary: Option<&EpochSummary>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let metadata = CheckpointMetadata {
            epoch: self.epoch,
            step: self.step,
            lr: self.optimizer.learning_rate(),
            train_loss: summary.map(|s| s.train.loss),
            val_loss: summary.filter(|s| s.validate.samples > 0).map(|s| s.validate.loss),
            config: Some(serde_json::to_string(self.model.config())?),
        };

        log::info!("Saving checkpoint to {}", path.display());
        Checkpoint::from_varmap(&self.varmap, metadata)?.save(path)
    }

    /// Restore weights and counters from a checkpoint
    ///
    /// Optimizer moment estimates are not part of the checkpoint and start
    /// from zero again.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<CheckpointMetadata> {
        let checkpoint = Checkpoint::load(path.as_ref(), &self.device)?;

        if let Some(json) = &checkpoint.metadata.config {
            let saved: ClassifierConfig = serde_json::from_str(json)?;
            if &saved != self.model.config() {
                return Err(VisionError::Checkpoint(format!(
                    "checkpoint was written for a different model: {:?}",
                    saved
                )));
            }
        }

        checkpoint.restore(&self.varmap)?;
        self.step = checkpoint.metadata.step;
        self.epoch = checkpoint.metadata.epoch;

        log::info!(
            "Restored {} at epoch {}, step {}",
            path.as_ref().display(),
            self.epoch,
            self.step
        );
        Ok(checkpoint.metadata)
    }

    fn check_data(&self, data: &DataModule) -> Result<()> {
        if data.num_classes() != self.model.config().num_classes {
            return Err(VisionError::Config(format!(
                "data has {} classes but the model predicts {}",
                data.num_classes(),
                self.model.config().num_classes
            )));
        }
        let [h, w, c] = data.config().image_shape;
        if self.model.config().input_shape != [c, h, w] {
            return Err(VisionError::Config(format!(
                "data images are {:?} (HWC) but the model expects {:?} (CHW)",
                data.config().image_shape,
                self.model.config().input_shape
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataModuleConfig, StorageRoot};
    use crate::data::{collate, Sample};
    use crate::storage::{OwnedRecord, TableWriter};
    use ndarray::Array3;

    fn small_model() -> ClassifierConfig {
        ClassifierConfig {
            input_shape: [3, 8, 8],
            conv_channels: vec![4, 4],
            kernel_size: 3,
            pool_after: vec![1],
            hidden_sizes: vec![16],
            num_classes: 2,
        }
    }

    fn quick_training(dir: Option<PathBuf>) -> TrainingConfig {
        TrainingConfig {
            num_epochs: 2,
            learning_rate: 1e-2,
            log_every: 1,
            checkpoint_dir: dir,
            ..Default::default()
        }
    }

    /// Class 0 images are dark, class 1 images are bright
    fn separable_batch(n: usize) -> crate::Result<Batch> {
        let samples = (0..n)
            .map(|i| Sample {
                id: i as i64,
                input: Array3::from_elem((3, 8, 8), if i % 2 == 0 { -0.9 } else { 0.9 }),
                label: (i % 2) as u32,
            })
            .collect();
        collate(samples, &Device::Cpu)
    }

    fn snapshot(trainer: &Trainer) -> Vec<Vec<f32>> {
        let data = trainer.varmap().data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| data[n].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    fn write_tables(root: &Path) -> crate::Result<()> {
        let records = |n: i64| -> Vec<OwnedRecord> {
            (0..n)
                .map(|i| {
                    let value = if i % 2 == 0 { 10 } else { 240 };
                    OwnedRecord::new(i, vec![value; 8 * 8 * 3], i % 2)
                })
                .collect()
        };
        TableWriter::new(root.join("train.delta")).commit(&records(40))?;
        TableWriter::new(root.join("test.delta")).commit(&records(12))?;
        Ok(())
    }

    fn small_data(root: &Path) -> crate::Result<DataModule> {
        let mut config = DataModuleConfig {
            storage_root: StorageRoot::Local {
                root: root.to_path_buf(),
            },
            image_shape: [8, 8, 3],
            num_classes: 2,
            ..Default::default()
        };
        for (phase, settings) in config.phases.iter_mut() {
            settings.table = match phase {
                Phase::Train => "train.delta".to_string(),
                _ => "test.delta".to_string(),
            };
            settings.batch_size = 8;
            settings.num_workers = 2;
        }
        DataModule::new(config, Device::Cpu)
    }

    #[test]
    fn test_train_step_reduces_loss() -> crate::Result<()> {
        let config = TrainingConfig {
            learning_rate: 1e-3,
            ..quick_training(None)
        };
        let mut trainer = Trainer::new(small_model(), config, Device::Cpu)?;
        let batch = separable_batch(8)?;

        let mut losses = Vec::with_capacity(40);
        for _ in 0..40 {
            losses.push(trainer.train_step(&batch)?.loss);
        }

        // compare windows so a single noisy step cannot decide the outcome
        let mean = |xs: &[f32]| xs.iter().sum::<f32>() / xs.len() as f32;
        let first = mean(&losses[..5]);
        let last = mean(&losses[35..]);
        assert!(last < first, "mean loss went from {} to {}", first, last);
        assert_eq!(trainer.step(), 40);
        Ok(())
    }

    #[test]
    fn test_eval_step_leaves_parameters_unchanged() -> crate::Result<()> {
        let trainer = Trainer::new(small_model(), quick_training(None), Device::Cpu)?;
        let batch = separable_batch(6)?;

        let before = snapshot(&trainer);
        let metrics = trainer.eval_step(&batch)?;
        assert_eq!(metrics.samples, 6);
        assert!(metrics.correct <= 6);
        assert_eq!(snapshot(&trainer), before);
        assert_eq!(trainer.step(), 0);
        Ok(())
    }

    #[test]
    fn test_fit_then_test() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_tables(dir.path())?;
        let data = small_data(dir.path())?;
        let checkpoints = dir.path().join("checkpoints");

        let mut trainer = Trainer::new(small_model(), quick_training(Some(checkpoints.clone())), Device::Cpu)?;
        let history = trainer.fit(&data)?;

        assert_eq!(history.len(), 2);
        for summary in &history {
            assert_eq!(summary.train.samples, 40);
            assert_eq!(summary.train.batches, 5);
            assert_eq!(summary.validate.samples, 12);
            assert_eq!(summary.validate.batches, 2);
        }
        assert_eq!(trainer.step(), 10);
        assert_eq!(trainer.epoch(), 2);

        assert!(checkpoints.join("checkpoint_epoch_1.safetensors").exists());
        assert!(checkpoints.join("checkpoint_epoch_2.safetensors").exists());
        let final_model = crate::models::loader::load_model(checkpoints.join("final_model.safetensors"), &Device::Cpu)?;
        let x = separable_batch(4)?.inputs;
        assert_eq!(
            final_model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?,
            trainer.model().forward(&x)?.flatten_all()?.to_vec1::<f32>()?
        );

        let test = trainer.test(&data)?;
        assert_eq!(test.phase, Phase::Test);
        assert_eq!(test.samples, 12);
        Ok(())
    }

    #[test]
    fn test_early_stopping_ends_fit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_tables(dir.path())?;
        let data = small_data(dir.path())?;

        let config = TrainingConfig {
            num_epochs: 50,
            // too small to move the validation loss past min_delta
            learning_rate: 1e-9,
            checkpoint_dir: None,
            early_stopping: Some(EarlyStoppingConfig {
                patience: 2,
                min_delta: 1.0,
            }),
            ..Default::default()
        };
        let mut trainer = Trainer::new(small_model(), config, Device::Cpu)?;
        let history = trainer.fit(&data)?;

        // first epoch sets the best value, two stalled epochs stop the run
        assert_eq!(history.len(), 3);
        Ok(())
    }

    #[test]
    fn test_checkpoint_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt").join("model.safetensors");

        let mut trained = Trainer::new(small_model(), quick_training(None), Device::Cpu)?;
        let batch = separable_batch(8)?;
        for _ in 0..3 {
            trained.train_step(&batch)?;
        }
        trained.save_checkpoint(&path, None)?;

        let mut fresh = Trainer::new(small_model(), quick_training(None), Device::Cpu)?;
        assert_ne!(snapshot(&fresh), snapshot(&trained));

        let metadata = fresh.load_checkpoint(&path)?;
        assert_eq!(metadata.step, 3);
        assert_eq!(fresh.step(), 3);
        assert_eq!(snapshot(&fresh), snapshot(&trained));
        Ok(())
    }

    #[test]
    fn test_checkpoint_for_other_model_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        Trainer::new(small_model(), quick_training(None), Device::Cpu)?.save_checkpoint(&path, None)?;

        let other = ClassifierConfig {
            hidden_sizes: vec![8],
            ..small_model()
        };
        let mut trainer = Trainer::new(other, quick_training(None), Device::Cpu)?;
        assert!(matches!(
            trainer.load_checkpoint(&path),
            Err(VisionError::Checkpoint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mismatched_data_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        write_tables(dir.path())?;
        let data = small_data(dir.path())?;

        let model = ClassifierConfig {
            num_classes: 3,
            ..small_model()
        };
        let mut trainer = Trainer::new(model, quick_training(None), Device::Cpu)?;
        assert!(matches!(trainer.fit(&data), Err(VisionError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_training_config() {
        let config = TrainingConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
