/// Convolutional image classifier
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::ClassifierConfig;
use crate::layers::{ConvBlock, DenseBlock};
use crate::VisionError;

pub mod loader;

/// Stacked conv stages followed by dense stages and a log-softmax head.
///
/// Construction happens in a fixed order:
/// 1. build the convolution stages,
/// 2. run one random probe image of `input_shape` through them to measure the
///    flattened feature width,
/// 3. build the dense stages on top of that width.
///
/// The first dense layer therefore follows the input resolution instead of
/// being hard-coded.
pub struct ConvClassifier {
    config: ClassifierConfig,
    features: Vec<ConvBlock>,
    hidden: Vec<DenseBlock>,
    head: DenseBlock,
    feature_width: usize,
}

impl ConvClassifier {
    /// Create new classifier
    pub fn new(config: ClassifierConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        if expected_feature_width(&config).is_none() {
            return Err(VisionError::Config(format!(
                "input shape {:?} is too small for {} conv stages",
                config.input_shape,
                config.conv_channels.len()
            )));
        }

        // 1. Convolution stages
        let mut features = Vec::with_capacity(config.conv_channels.len());
        let mut in_channels = config.input_shape[0];
        for (i, &out_channels) in config.conv_channels.iter().enumerate() {
            features.push(ConvBlock::new(
                in_channels,
                out_channels,
                config.kernel_size,
                config.pool_after.contains(&i),
                vb.pp(format!("conv{}", i + 1)),
            )?);
            in_channels = out_channels;
        }

        // 2. Probe forward pass
        let feature_width = probe_feature_width(&features, config.input_shape, vb.dtype(), vb.device())?;
        log::debug!(
            "Probe through {} conv stages: {:?} -> {} features",
            features.len(),
            config.input_shape,
            feature_width
        );

        // 3. Dense stages
        let mut hidden = Vec::with_capacity(config.hidden_sizes.len());
        let mut in_features = feature_width;
        for (i, &out_features) in config.hidden_sizes.iter().enumerate() {
            hidden.push(DenseBlock::new(
                in_features,
                out_features,
                true,
                vb.pp(format!("fc{}", i + 1)),
            )?);
            in_features = out_features;
        }
        let head = DenseBlock::new(
            in_features,
            config.num_classes,
            false,
            vb.pp(format!("fc{}", config.hidden_sizes.len() + 1)),
        )?;

        Ok(Self {
            config,
            features,
            hidden,
            head,
            feature_width,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Input width of the first dense layer, as measured by the probe
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    /// Conv stages only: [batch, C, H, W] -> [batch, C', H', W']
    pub fn forward_features(&self, xs: &Tensor) -> Result<Tensor> {
        run_features(&self.features, xs)
    }

    /// Per-class log-probabilities, [batch, num_classes]
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.forward_features(xs)?.flatten_from(1)?;
        for layer in &self.hidden {
            xs = layer.forward(&xs)?;
        }
        let logits = self.head.forward(&xs)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }
}

impl Module for ConvClassifier {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        ConvClassifier::forward(self, xs)
    }
}

fn run_features(features: &[ConvBlock], xs: &Tensor) -> Result<Tensor> {
    let mut xs = xs.clone();
    for block in features {
        xs = block.forward(&xs)?;
    }
    Ok(xs)
}

fn probe_feature_width(
    features: &[ConvBlock],
    [c, h, w]: [usize; 3],
    dtype: DType,
    device: &Device,
) -> Result<usize> {
    let probe = Tensor::rand(0f32, 1f32, (1, c, h, w), device)?.to_dtype(dtype)?;
    let out = run_features(features, &probe)?;
    out.flatten_from(1)?.dim(1)
}

/// Feature width computed from layer arithmetic; `None` if a stage would
/// shrink the image to nothing
pub fn expected_feature_width(config: &ClassifierConfig) -> Option<usize> {
    let [_, mut h, mut w] = config.input_shape;
    for i in 0..config.conv_channels.len() {
        let pool = config.pool_after.contains(&i);
        h = ConvBlock::output_size(h, config.kernel_size, pool)?;
        w = ConvBlock::output_size(w, config.kernel_size, pool)?;
    }
    config.conv_channels.last().map(|c| c * h * w)
}
