/// Fully-connected layer with optional ReLU
use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

pub struct DenseBlock {
    linear: Linear,
    relu: bool,
}

impl DenseBlock {
    pub fn new(in_features: usize, out_features: usize, relu: bool, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(in_features, out_features, vb)?;
        Ok(Self { linear, relu })
    }
}

impl Module for DenseBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.linear.forward(xs)?;
        if self.relu {
            xs.relu()
        } else {
            Ok(xs)
        }
    }
}
