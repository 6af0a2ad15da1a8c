/// CIFAR-10 training from versioned npy tables
///
/// Usage: train_cifar10 [experiment.json]
///
/// Without a config file the defaults are used: tables `cifar_train.delta`
/// and `cifar_test.delta` under the configured storage root, five epochs of
/// Adam at lr 2e-4.
use candle_core::Device;
use delta_vision::{DataModule, ExperimentConfig, Phase, Trainer};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading experiment config from {}", path);
            ExperimentConfig::from_json_file(&path)?
        }
        None => {
            let config = ExperimentConfig::default();
            config.validate()?;
            config
        }
    };

    // Device setup - Try CUDA first, fallback to CPU
    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    log::info!("Model configuration: {:#?}", config.model);
    log::info!("Training configuration: {:#?}", config.training);
    for phase in Phase::ALL {
        let dataset = config.data.dataset_config(phase)?;
        log::info!("{} table: {}", phase, dataset.path.display());
    }

    let data = DataModule::new(config.data.clone(), device.clone())?;
    let mut trainer = Trainer::new(config.model, config.training, device)?;

    let history = trainer.fit(&data)?;
    if let Some(last) = history.last() {
        log::info!(
            "Last epoch {}: train_loss={:.4} val_loss={:.4} val_acc={:.4}",
            last.epoch,
            last.train.loss,
            last.validate.loss,
            last.validate.accuracy
        );
    }

    let test = trainer.test(&data)?;
    log::info!("=== Test ===");
    log::info!("loss={:.4} accuracy={:.4} over {} samples", test.loss, test.accuracy, test.samples);

    Ok(())
}
