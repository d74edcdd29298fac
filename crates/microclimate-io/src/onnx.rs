//! ONNX Runtime backend for the segmentation network.
//!
//! Expects a model with one `f32` input of shape `[1, 3, H, W]` and whose
//! first output holds logits of shape `[1, C, h, w]`.

use std::path::Path;
use std::sync::Mutex;

use microclimate_pipeline::{InputTensor, Logits, PipelineError, SegmentationNetwork};

/// A segmentation network loaded from an `.onnx` file.
pub struct OnnxNetwork {
    session: Mutex<ort::session::Session>,
}

fn network_error(context: &str) -> impl FnOnce(ort::Error) -> PipelineError + '_ {
    move |e| PipelineError::Network(format!("{context}: {e}"))
}

impl OnnxNetwork {
    /// Load the network at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Network`] if ONNX Runtime cannot load the
    /// model.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let session = ort::session::Session::builder()
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(network_error("ONNX session load"))?;
        log::info!("loaded segmentation network from {}", path.display());
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl SegmentationNetwork for OnnxNetwork {
    fn forward(&self, input: &InputTensor) -> Result<Logits, PipelineError> {
        let input = ndarray::Array4::from_shape_vec(input.shape(), input.as_raw().to_vec())
            .map_err(|e| PipelineError::Network(format!("input tensor shape: {e}")))?;
        let tensor = ort::value::Tensor::from_array(input).map_err(network_error("input tensor"))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| PipelineError::Network("ONNX session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(network_error("ONNX inference"))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(network_error("extract logits"))?;

        let [batch, classes, height, width] = shape[..] else {
            return Err(PipelineError::Network(format!(
                "expected 4-dimensional logits, got shape {shape:?}"
            )));
        };
        if batch != 1 {
            return Err(PipelineError::Network(format!(
                "expected a batch of one, got {batch}"
            )));
        }
        let dim = |value: i64, name: &str| {
            u32::try_from(value)
                .map_err(|_| PipelineError::Network(format!("invalid logits {name}: {value}")))
        };
        let classes = usize::try_from(classes)
            .map_err(|_| PipelineError::Network(format!("invalid class count: {classes}")))?;
        Logits::new(classes, dim(width, "width")?, dim(height, "height")?, data.to_vec())
    }
}
