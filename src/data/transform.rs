/// Per-sample decode + normalization
use ndarray::{Array3, ArrayView3, Axis, Zip};

use crate::config::TransformConfig;
use crate::{Result, VisionError};

/// Raw image layout as stored in the table (height, width, channels)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn from_hwc([height, width, channels]: [usize; 3]) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Expected raw byte length of one image
    pub fn num_bytes(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// Tensor layout produced by the transform
    pub fn chw(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

/// Maps raw image bytes to a normalized CHW array.
///
/// Implementations are called concurrently from the dataset's reader threads.
pub trait SampleTransform: Send + Sync {
    fn apply(&self, raw: &[u8], shape: ImageShape) -> Result<Array3<f32>>;
}

/// Reinterpret `u8` HWC bytes, scale to [0, 1], then `(x - mean) / std` per channel
#[derive(Debug, Clone)]
pub struct ImageTransform {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ImageTransform {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            mean: config.mean.clone(),
            std: config.std.clone(),
        }
    }
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new(&TransformConfig::default())
    }
}

impl SampleTransform for ImageTransform {
    fn apply(&self, raw: &[u8], shape: ImageShape) -> Result<Array3<f32>> {
        if raw.len() != shape.num_bytes() {
            return Err(VisionError::Decode {
                id: None,
                reason: format!(
                    "expected {} bytes for a {}x{}x{} image, got {}",
                    shape.num_bytes(),
                    shape.height,
                    shape.width,
                    shape.channels,
                    raw.len()
                ),
            });
        }
        if shape.channels != self.mean.len() {
            return Err(VisionError::Decode {
                id: None,
                reason: format!(
                    "image has {} channels, normalization is configured for {}",
                    shape.channels,
                    self.mean.len()
                ),
            });
        }

        let hwc = ArrayView3::from_shape((shape.height, shape.width, shape.channels), raw)
            .map_err(|e| VisionError::Decode {
                id: None,
                reason: e.to_string(),
            })?;
        let chw = hwc.permuted_axes([2, 0, 1]);

        let mut out = Array3::<f32>::zeros((shape.channels, shape.height, shape.width));
        for (channel, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            let mean = self.mean[channel];
            let std = self.std[channel];
            Zip::from(&mut plane)
                .and(chw.index_axis(Axis(0), channel))
                .for_each(|o, &x| *o = (f32::from(x) / 255.0 - mean) / std);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: ImageShape = ImageShape {
        height: 2,
        width: 2,
        channels: 3,
    };

    #[test]
    fn test_hwc_bytes_become_chw_planes() {
        // pixel p has channels (p, 100 + p, 200 + p)
        let raw: Vec<u8> = (0..4u8).flat_map(|p| [p, 100 + p, 200 + p]).collect();
        let transform = ImageTransform::new(&TransformConfig {
            mean: vec![0.0; 3],
            std: vec![1.0 / 255.0; 3],
        });

        let out = transform.apply(&raw, SHAPE).unwrap();
        assert_eq!(out.dim(), (3, 2, 2));
        assert!((out[[0, 0, 1]] - 1.0).abs() < 1e-4);
        assert!((out[[1, 1, 0]] - 102.0).abs() < 1e-3);
        assert!((out[[2, 1, 1]] - 203.0).abs() < 1e-3);
    }

    #[test]
    fn test_half_normalization_range() {
        let transform = ImageTransform::default();
        let raw = [0u8, 255, 0, 255, 0, 255, 0, 255, 0, 255, 0, 255];

        let out = transform.apply(&raw, SHAPE).unwrap();
        assert_eq!(out[[0, 0, 0]], -1.0);
        assert_eq!(out[[1, 0, 0]], 1.0);
        assert!(out.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let transform = ImageTransform::default();
        let raw: Vec<u8> = (0..12u8).map(|b| b.wrapping_mul(37)).collect();

        let a = transform.apply(&raw, SHAPE).unwrap();
        let b = transform.apply(&raw, SHAPE).unwrap();
        let bits_a: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn test_wrong_length_is_decode_error() {
        let transform = ImageTransform::default();
        match transform.apply(&[0u8; 11], SHAPE) {
            Err(VisionError::Decode { id: None, reason }) => assert!(reason.contains("expected 12 bytes")),
            other => panic!("expected decode error, got {:?}", other),
        }
    }
}
