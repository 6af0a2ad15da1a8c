/// Loss and accuracy bookkeeping for one phase pass
use std::fmt;

use crate::data::Phase;

/// Result of one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// Mean loss over the batch
    pub loss: f32,
    /// Correctly classified samples
    pub correct: usize,
    pub samples: usize,
}

impl StepMetrics {
    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// Sample-weighted averages over a whole pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    pub phase: Phase,
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
    pub batches: usize,
}

impl fmt::Display for PhaseMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_loss={:.4} {}_acc={:.4} ({} samples, {} batches)",
            self.phase, self.loss, self.phase, self.accuracy, self.samples, self.batches
        )
    }
}

/// Accumulates [`StepMetrics`] into a [`PhaseMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    phase: Phase,
    loss_sum: f64,
    correct: usize,
    samples: usize,
    batches: usize,
}

impl MetricsAccumulator {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            loss_sum: 0.0,
            correct: 0,
            samples: 0,
            batches: 0,
        }
    }

    pub fn push(&mut self, step: &StepMetrics) {
        self.loss_sum += step.loss as f64 * step.samples as f64;
        self.correct += step.correct;
        self.samples += step.samples;
        self.batches += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Empty passes report zero loss and accuracy
    pub fn finish(&self) -> PhaseMetrics {
        let (loss, accuracy) = if self.samples == 0 {
            (0.0, 0.0)
        } else {
            let n = self.samples as f64;
            (self.loss_sum / n, self.correct as f64 / n)
        };
        PhaseMetrics {
            phase: self.phase,
            loss,
            accuracy,
            samples: self.samples,
            batches: self.batches,
        }
    }
}

/// One epoch of [`Trainer::fit`](super::Trainer::fit)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// 1-based
    pub epoch: usize,
    pub train: PhaseMetrics,
    pub validate: PhaseMetrics,
}
