/// Neural network layer primitives
///
/// This module contains the building blocks for the classifier:
/// - Convolution stages (conv + ReLU + optional max-pool)
/// - Dense stages (linear + optional ReLU)
pub mod conv;
pub mod dense;

pub use conv::ConvBlock;
pub use dense::DenseBlock;
