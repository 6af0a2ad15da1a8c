/// Stop training once validation loss stops improving
use serde::{Deserialize, Serialize};

use crate::{Result, VisionError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before stopping
    pub patience: usize,
    /// Smallest decrease that counts as an improvement
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 3,
            min_delta: 0.0,
        }
    }
}

impl EarlyStoppingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.patience == 0 {
            return Err(VisionError::Config("early_stopping.patience must be > 0".to_string()));
        }
        if !(self.min_delta >= 0.0) {
            return Err(VisionError::Config(format!(
                "early_stopping.min_delta must be >= 0, got {}",
                self.min_delta
            )));
        }
        Ok(())
    }
}

/// Tracks the best monitored value seen so far
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best: Option<f64>,
    bad_epochs: usize,
}

impl EarlyStopping {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        Self {
            config,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Record one epoch's value; returns true when training should stop
    pub fn update(&mut self, value: f64) -> bool {
        let improved = match self.best {
            None => value.is_finite(),
            Some(best) => value < best - self.config.min_delta,
        };

        if improved {
            self.best = Some(value);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }
        self.bad_epochs >= self.config.patience
    }
}
