//! The segmentation model: a pretrained network plus its preprocessor.
//!
//! The network itself is a collaborator behind [`SegmentationNetwork`]:
//! a black-box function from a normalized input tensor to per-class
//! logits at the network's native (coarser) resolution. Everything
//! around it is owned here: input preparation, softmax, and upsampling
//! back to the source image's resolution.
//!
//! A [`SegmentationModel`] is constructed once and passed by reference
//! to whatever drives a batch, so the network's load cost is paid once
//! per run rather than once per image.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::probability::{softmax, upsample_bilinear};
use crate::types::{Dimensions, Logits, PipelineError, ProbabilityField, RgbImage};

/// How source images are turned into network input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Edge length of the square network input, in pixels.
    pub size: u32,
    /// Factor applied to 8-bit channel values before normalization.
    pub rescale: f32,
    /// Per-channel (R, G, B) mean subtracted after rescaling.
    pub mean: [f32; 3],
    /// Per-channel (R, G, B) standard deviation divided out after
    /// subtracting the mean.
    pub std: [f32; 3],
}

impl PreprocessConfig {
    /// Default input edge length.
    pub const DEFAULT_SIZE: u32 = 512;

    /// ImageNet channel means.
    pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

    /// ImageNet channel standard deviations.
    pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            size: Self::DEFAULT_SIZE,
            rescale: 1.0 / 255.0,
            mean: Self::IMAGENET_MEAN,
            std: Self::IMAGENET_STD,
        }
    }
}

/// A normalized `[channel][row][col]` RGB tensor ready for the network.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    dimensions: Dimensions,
    data: Vec<f32>,
}

impl InputTensor {
    /// Number of color channels.
    pub const CHANNELS: usize = 3;

    /// Spatial dimensions of each channel plane.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// The raw channel-major buffer.
    #[must_use]
    pub fn as_raw(&self) -> &[f32] {
        &self.data
    }

    /// Shape as `[batch, channels, height, width]` with a batch of one.
    #[must_use]
    pub const fn shape(&self) -> [usize; 4] {
        [
            1,
            Self::CHANNELS,
            self.dimensions.height as usize,
            self.dimensions.width as usize,
        ]
    }
}

/// Resizes and normalizes images the way the network was trained.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    /// Create a preprocessor.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `size` is zero or any
    /// standard deviation is not strictly positive.
    pub fn new(config: PreprocessConfig) -> Result<Self, PipelineError> {
        if config.size == 0 {
            return Err(PipelineError::InvalidConfig(
                "network input size must be non-zero".to_string(),
            ));
        }
        if config.std.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "normalization std must be positive, got {:?}",
                config.std,
            )));
        }
        Ok(Self { config })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Resize `image` to the network's square input (bilinear), rescale,
    /// and normalize each channel.
    #[must_use = "returns the prepared tensor"]
    pub fn prepare(&self, image: &RgbImage) -> InputTensor {
        let size = self.config.size;
        let resized = if image.width() == size && image.height() == size {
            image.clone()
        } else {
            image::imageops::resize(image, size, size, FilterType::Triangle)
        };

        let plane = size as usize * size as usize;
        let mut data = vec![0.0; InputTensor::CHANNELS * plane];
        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..InputTensor::CHANNELS {
                let scaled = f32::from(pixel.0[c]) * self.config.rescale;
                data[c * plane + i] = (scaled - self.config.mean[c]) / self.config.std[c];
            }
        }

        InputTensor {
            dimensions: Dimensions {
                width: size,
                height: size,
            },
            data,
        }
    }
}

/// A pretrained semantic-segmentation network.
///
/// Implementations run one forward pass without gradient tracking and
/// return raw class scores at whatever resolution the network produces.
pub trait SegmentationNetwork {
    /// Run the network on a prepared input tensor.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Network`] (or another variant) when the
    /// backend cannot produce logits.
    fn forward(&self, input: &InputTensor) -> Result<Logits, PipelineError>;
}

impl<N: SegmentationNetwork + ?Sized> SegmentationNetwork for &N {
    fn forward(&self, input: &InputTensor) -> Result<Logits, PipelineError> {
        (**self).forward(input)
    }
}

impl<N: SegmentationNetwork + ?Sized> SegmentationNetwork for Box<N> {
    fn forward(&self, input: &InputTensor) -> Result<Logits, PipelineError> {
        (**self).forward(input)
    }
}

/// A network paired with its preprocessor.
#[derive(Debug)]
pub struct SegmentationModel<N> {
    network: N,
    preprocessor: Preprocessor,
}

impl<N: SegmentationNetwork> SegmentationModel<N> {
    /// Pair a loaded network with the preprocessing it expects.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the preprocessing
    /// configuration is invalid.
    pub fn new(network: N, config: PreprocessConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            network,
            preprocessor: Preprocessor::new(config)?,
        })
    }

    /// The wrapped network.
    #[must_use]
    pub const fn network(&self) -> &N {
        &self.network
    }

    /// The companion preprocessor.
    #[must_use]
    pub const fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Raw network output for `image`, at network resolution.
    ///
    /// # Errors
    ///
    /// Propagates network failures.
    pub fn logits(&self, image: &RgbImage) -> Result<Logits, PipelineError> {
        let input = self.preprocessor.prepare(image);
        self.network.forward(&input)
    }

    /// Per-pixel class probabilities for `image`, at the image's own
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyField`] for a zero-sized image,
    /// [`PipelineError::ClassCountMismatch`] if the network's channel
    /// count differs from the class registry, and propagates network
    /// failures.
    pub fn infer(&self, image: &RgbImage) -> Result<ProbabilityField, PipelineError> {
        let target = Dimensions::of(image);
        if target.pixel_count() == 0 {
            return Err(PipelineError::EmptyField {
                width: target.width,
                height: target.height,
            });
        }
        let logits = self.logits(image)?;
        let coarse = softmax(&logits)?;
        Ok(upsample_bilinear(&coarse, target))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classes::{LandCover, NUM_CLASSES};
    use crate::types::DISTRIBUTION_TOLERANCE;

    /// Downsamples 4x and scores Water where the blue input channel is
    /// positive, Tree elsewhere.
    struct BlueIsWater;

    impl SegmentationNetwork for BlueIsWater {
        fn forward(&self, input: &InputTensor) -> Result<Logits, PipelineError> {
            let d = input.dimensions();
            let (w, h) = (d.width / 4, d.height / 4);
            let plane = (w * h) as usize;
            let in_plane = d.pixel_count();
            let mut data = vec![0.0; NUM_CLASSES * plane];
            for y in 0..h as usize {
                for x in 0..w as usize {
                    let src = (y * 4) * d.width as usize + x * 4;
                    let blue = input.as_raw()[2 * in_plane + src];
                    let class = if blue > 0.0 {
                        LandCover::Water
                    } else {
                        LandCover::Tree
                    };
                    data[class.index() * plane + y * w as usize + x] = 8.0;
                }
            }
            Logits::new(NUM_CLASSES, w, h, data)
        }
    }

    struct WrongClassCount;

    impl SegmentationNetwork for WrongClassCount {
        fn forward(&self, _input: &InputTensor) -> Result<Logits, PipelineError> {
            Logits::new(3, 1, 1, vec![0.0; 3])
        }
    }

    fn small_config() -> PreprocessConfig {
        PreprocessConfig {
            size: 16,
            ..PreprocessConfig::default()
        }
    }

    #[test]
    fn preprocess_defaults_are_imagenet() {
        let config = PreprocessConfig::default();
        assert_eq!(config.size, 512);
        assert_eq!(config.mean, PreprocessConfig::IMAGENET_MEAN);
        assert_eq!(config.std, PreprocessConfig::IMAGENET_STD);
    }

    #[test]
    fn preprocessor_rejects_zero_size() {
        let config = PreprocessConfig {
            size: 0,
            ..PreprocessConfig::default()
        };
        assert!(matches!(
            Preprocessor::new(config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn prepare_resizes_and_normalizes() {
        let pre = Preprocessor::new(small_config()).unwrap();
        let image = RgbImage::from_pixel(40, 24, image::Rgb([255, 0, 128]));
        let tensor = pre.prepare(&image);
        assert_eq!(tensor.shape(), [1, 3, 16, 16]);

        let plane = 16 * 16;
        let red = tensor.as_raw()[0];
        let green = tensor.as_raw()[plane];
        let expected_red = (1.0 - 0.485) / 0.229;
        let expected_green = (0.0 - 0.456) / 0.224;
        assert!((red - expected_red).abs() < 1e-4, "red = {red}");
        assert!((green - expected_green).abs() < 1e-4, "green = {green}");
    }

    #[test]
    fn infer_returns_field_at_image_resolution() {
        let model = SegmentationModel::new(BlueIsWater, small_config()).unwrap();
        let image = RgbImage::from_fn(30, 20, |x, _| {
            if x < 15 {
                image::Rgb([0, 200, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        let field = model.infer(&image).unwrap();
        assert_eq!(
            field.dimensions(),
            Dimensions {
                width: 30,
                height: 20
            }
        );
        for y in 0..20 {
            for x in 0..30 {
                let sum: f64 = field.pixel(x, y).iter().sum();
                assert!((sum - 1.0).abs() < DISTRIBUTION_TOLERANCE);
            }
        }
        assert!(field.probability(LandCover::Tree, 0, 10) > 0.9);
        assert!(field.probability(LandCover::Water, 29, 10) > 0.9);
    }

    #[test]
    fn infer_rejects_wrong_class_count() {
        let model = SegmentationModel::new(WrongClassCount, small_config()).unwrap();
        let image = RgbImage::new(4, 4);
        assert!(matches!(
            model.infer(&image),
            Err(PipelineError::ClassCountMismatch { actual: 3, .. })
        ));
    }

    #[test]
    fn infer_rejects_empty_image() {
        let model = SegmentationModel::new(BlueIsWater, small_config()).unwrap();
        let image = RgbImage::new(0, 5);
        assert!(matches!(
            model.infer(&image),
            Err(PipelineError::EmptyField { .. })
        ));
    }

    #[test]
    fn model_by_reference_is_a_network() {
        let network = BlueIsWater;
        let model = SegmentationModel::new(&network, small_config()).unwrap();
        let image = RgbImage::from_pixel(16, 16, image::Rgb([0, 0, 255]));
        let field = model.infer(&image).unwrap();
        assert!(field.probability(LandCover::Water, 8, 8) > 0.9);
    }
}
