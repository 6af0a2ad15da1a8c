/// Convolution stage: conv -> ReLU -> optional 2x2 max-pool
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

pub struct ConvBlock {
    conv: Conv2d,
    pool: bool,
}

impl ConvBlock {
    /// Create new conv block (stride 1, no padding)
    ///
    /// # Arguments
    /// * `in_channels` - Input channels
    /// * `out_channels` - Output channels
    /// * `kernel_size` - Square kernel size
    /// * `pool` - Follow the activation with a 2x2 max-pool
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        pool: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = candle_nn::conv2d(
            in_channels,
            out_channels,
            kernel_size,
            Conv2dConfig::default(),
            vb,
        )?;
        Ok(Self { conv, pool })
    }

    /// Spatial size after this block for an input of `size`, if non-empty
    pub fn output_size(size: usize, kernel_size: usize, pool: bool) -> Option<usize> {
        let conv = size.checked_sub(kernel_size - 1).filter(|s| *s > 0)?;
        if pool {
            Some(conv / 2).filter(|s| *s > 0)
        } else {
            Some(conv)
        }
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?.relu()?;
        if self.pool {
            xs.max_pool2d(2)
        } else {
            Ok(xs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_conv_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let plain = ConvBlock::new(3, 8, 3, false, vb.pp("a"))?;
        let pooled = ConvBlock::new(8, 8, 3, true, vb.pp("b"))?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device)?;
        let y = plain.forward(&x)?;
        assert_eq!(y.dims(), &[2, 8, 14, 14]);
        let z = pooled.forward(&y)?;
        assert_eq!(z.dims(), &[2, 8, 6, 6]);

        // ReLU output is non-negative
        let min = z.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }

    #[test]
    fn test_output_size() {
        assert_eq!(ConvBlock::output_size(32, 3, false), Some(30));
        assert_eq!(ConvBlock::output_size(30, 3, true), Some(14));
        assert_eq!(ConvBlock::output_size(2, 3, false), None);
        assert_eq!(ConvBlock::output_size(3, 3, true), None);
    }
}
