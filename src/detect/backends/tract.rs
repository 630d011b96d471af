#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, Detection};
use crate::geometry::BoundingBox;
use crate::preprocess::InputTensor;

/// IoU above which same-class candidates are merged.
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a `[1, 3, H, W]` float input and a `[1, 4 + classes, anchors]` output
/// (center-form box followed by per-class scores). The transposed
/// `[1, anchors, 4 + classes]` layout is accepted too.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{}, {} classes)",
            model_path.display(),
            width,
            height,
            class_names.len()
        );
        Ok(Self {
            model,
            width,
            height,
            class_names,
        })
    }

    fn build_input(&self, tensor: &InputTensor) -> Result<Tensor> {
        if tensor.width() != self.width || tensor.height() != self.height {
            return Err(anyhow!(
                "tensor size {}x{} does not match model input {}x{}",
                tensor.width(),
                tensor.height(),
                self.width,
                self.height
            ));
        }
        let values = tensor.to_vec();
        Tensor::from_shape(&[1, 3, self.height as usize, self.width as usize], &values)
            .context("failed to build input tensor")
    }

    fn decode(&self, outputs: TVec<TValue>, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }

        // Features along axis 1 unless the tensor is transposed.
        let transposed = shape[1] > shape[2];
        let (features, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if features <= 4 {
            return Err(anyhow!("output has no class scores (shape {:?})", shape));
        }
        let at = |feature: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, feature]]
            } else {
                view[[0, feature, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (best_class, best_score) = (4..features)
                .map(|feature| (feature - 4, at(feature, anchor)))
                .fold((0usize, f32::NEG_INFINITY), |best, (class, score)| {
                    if score > best.1 {
                        (class, score)
                    } else {
                        best
                    }
                });
            if !best_score.is_finite() || best_score < confidence_threshold {
                continue;
            }

            let bbox = BoundingBox::from_center(
                at(0, anchor),
                at(1, anchor),
                at(2, anchor),
                at(3, anchor),
            );
            if !bbox.is_finite() || bbox.width() <= 0.0 || bbox.height() <= 0.0 {
                continue;
            }
            let class_id = best_class as u32;
            candidates.push(Detection::new(
                class_id,
                self.class_name(class_id),
                best_score.min(1.0),
                bbox,
            ));
        }

        let before = candidates.len();
        let kept = non_max_suppression(candidates, NMS_IOU_THRESHOLD);
        log::debug!("TractBackend: {} candidates, {} after NMS", before, kept.len());
        Ok(kept)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn infer(&mut self, tensor: &InputTensor, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let input = self.build_input(tensor)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, confidence_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let tensor = InputTensor::zeros(self.width, self.height);
        self.infer(&tensor, 1.0).map(|_| ())
    }
}
